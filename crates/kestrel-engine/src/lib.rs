//! # Kestrel Engine
//!
//! Serves feature reads and writes through per-feature middleware pipelines.
//!
//! ## Architecture
//!
//! ```text
//!            get/set/append/incr/update
//!                       │
//!                ┌──────▼──────┐     bind      ┌───────────────┐
//!                │   Engine    │◄──────────────│ BuilderTable  │
//!                └──────┬──────┘               └───────────────┘
//!                       │ Registry (FQN → Feature)
//!                ┌──────▼──────────────────────────────────────┐
//!   read:        │ preGet.. → getFromState → postGet.. → cache │
//!   write:       │ preSet.. → state-write(op) → postSet..      │
//!                └──────┬───────────────────────────┬──────────┘
//!                       │                           │
//!                   State                   NotificationSink
//!                                          (historian client)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kestrel_engine::{Engine, RequestContext};
//!
//! let engine = Engine::builder(state, historian_client).build();
//! engine.bind(descriptor)?;
//! engine.set(RequestContext::new(), "user.clicks", "u1", 3i64.into(), Utc::now()).await?;
//! let (value, fd) = engine.get(RequestContext::new(), "user.clicks", "u1").await?;
//! ```

pub mod builders;
pub mod context;
pub mod engine;
pub mod feature;
pub mod middleware;
pub mod pipeline;
pub mod registry;

pub use builders::{FeatureBuilder, FnProgram, Program, ProgramInput, ProgramRegistry};
pub use context::RequestContext;
pub use engine::{Engine, EngineBuilder, EngineConfig, EngineHandle};
pub use feature::{Feature, MiddlewareBundle, Stage};
pub use pipeline::{Exchange, Middleware, Next, Pipeline, WriteOp};
pub use registry::Registry;
