//! # Kestrel Historian
//!
//! Moves feature values from the online state into the historical store.
//!
//! - [`HistorianClient`] lives next to the engine. It is the engine's
//!   [`NotificationSink`](kestrel_core::NotificationSink) and publishes
//!   collect and write notifications on the bus.
//! - [`HistorianServer`] subscribes to those notifications on the leader,
//!   reads the state and commits [`WriteNotification`](kestrel_core::WriteNotification)s
//!   to a [`HistoricalWriter`](kestrel_core::HistoricalWriter), sweeping dead
//!   window buckets on a schedule.
//! - [`Manager`] runs both as [`Runnable`](kestrel_core::Runnable)s behind a
//!   leader election.

pub mod client;
pub mod handled;
pub mod queue;
pub mod runnable;
pub mod server;
pub mod subscription;

pub use client::{HistorianClient, HistorianClientConfig};
pub use handled::HandledBuckets;
pub use queue::{QueueHandler, WorkQueue};
pub use runnable::Manager;
pub use server::{HistorianConfig, HistorianDeps, HistorianServer};
