//! Builders attach the hooks that produce a feature's values
//!
//! A descriptor names its builder; at bind time the builder inspects the
//! descriptor and its `builder_spec` and adds middlewares to the bundle.
//!
//! | Builder       | Hooks                                   |
//! |---------------|-----------------------------------------|
//! | `streaming`   | none, values arrive through writes      |
//! | `sourceless`  | runs the feature's [`Program`]          |
//! | `headless`    | runs the feature's [`Program`], no state |
//! | `rest`        | HTTP callout, optional [`Program`]      |
//! | `featureset`  | fans out over member features           |
//! | `model`       | fan-out followed by a [`Program`]       |

use crate::engine::EngineHandle;
use crate::feature::{MiddlewareBundle, Stage};
use kestrel_core::plugins::FactoryTable;
use kestrel_core::{FeatureDescriptor, Result};
use std::sync::Arc;

mod compute;
mod featureset;
mod rest;

pub use compute::{FnProgram, Headless, Program, ProgramInput, ProgramRegistry, Sourceless};
pub use featureset::{FeatureSet, Model};
pub use rest::{Rest, RestSpec};

/// Attaches a feature's hooks at bind time
pub trait FeatureBuilder: Send + Sync {
    fn apply(&self, fd: &FeatureDescriptor, bundle: &mut MiddlewareBundle, engine: &EngineHandle) -> Result<()>;
}

pub type BuilderTable = FactoryTable<Arc<dyn FeatureBuilder>>;

/// Features with no builder logic
pub struct Streaming;

impl FeatureBuilder for Streaming {
    fn apply(&self, _fd: &FeatureDescriptor, _bundle: &mut MiddlewareBundle, _engine: &EngineHandle) -> Result<()> {
        Ok(())
    }
}

/// Every builder the engine knows out of the box
pub fn default_table(programs: Arc<ProgramRegistry>) -> BuilderTable {
    let mut table = BuilderTable::new("builder");
    table.register("streaming", Arc::new(Streaming));
    table.register("sourceless", Arc::new(Sourceless::new(programs.clone())));
    table.register("headless", Arc::new(Headless::new(programs.clone())));
    table.register("rest", Arc::new(Rest::new(programs.clone())));
    table.register("featureset", Arc::new(FeatureSet));
    table.register("model", Arc::new(Model::new(programs)));
    table
}

/// Compute-on-read hooks run before the state when the feature is never
/// fresh, and after it otherwise so they only fill misses
pub(crate) fn compute_stage(fd: &FeatureDescriptor) -> Stage {
    if fd.freshness.is_zero() {
        Stage::PreGet
    } else {
        Stage::PostGet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_table_names() {
        let table = default_table(Arc::new(ProgramRegistry::new()));
        assert_eq!(
            table.names(),
            vec!["featureset", "headless", "model", "rest", "sourceless", "streaming"]
        );
    }

    #[test]
    fn test_compute_stage() {
        let fd = FeatureDescriptor::new("ns.a", kestrel_core::Primitive::Int);
        assert_eq!(compute_stage(&fd), Stage::PreGet);
        assert_eq!(compute_stage(&fd.with_freshness(Duration::from_secs(1))), Stage::PostGet);
    }
}
