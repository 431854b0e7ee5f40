//! # Kestrel Core Library
//!
//! Types and contracts shared by every Kestrel crate. Nothing in here does
//! I/O; the concrete providers live in `kestrel-providers`, the request
//! engine in `kestrel-engine` and the historical pipeline in
//! `kestrel-historian`.
//!
//! ## Key Components
//!
//! - **Selectors & windows**: FQN grammar ([`fqn`]) and bucket arithmetic ([`window`])
//! - **Value model**: [`Primitive`], [`Scalar`], [`Payload`], [`Value`], [`FeatureDescriptor`]
//! - **Contracts**: [`State`], [`Notifier`], [`HistoricalWriter`], [`Runnable`]
//! - **Plugin tables**: [`plugins::Providers`], selected by name from configuration
//! - **Errors**: [`Error`] with a coarse [`ErrorKind`]

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{Error, ErrorKind, Result};
pub use historical::{DescriptorLookup, HistoricalWriter};
pub use notification::{CollectNotification, Notification, NotificationSink, WriteNotification, DEAD_BUCKET_MARKER};
pub use notifier::Notifier;
pub use runnable::{AlwaysLeader, LeaderElector, Runnable};
pub use state::State;
pub use types::{
    reduce_buckets, scalar_from_string, scalar_string, AggrFn, FeatureDescriptor, Payload, Primitive, RawBucket,
    Scalar, Value, WindowResultMap,
};
pub use window::WindowPolicy;

pub mod clock;
mod error;
pub mod fqn;
pub mod historical;
pub mod notification;
pub mod notifier;
pub mod plugins;
pub mod retry;
pub mod runnable;
pub mod state;
pub mod types;
pub mod window;

// Prelude module - commonly used imports
pub mod prelude {
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::notification::{CollectNotification, WriteNotification};
    pub use crate::state::State;
    pub use crate::types::{AggrFn, FeatureDescriptor, Payload, Primitive, Scalar, Value};
}
