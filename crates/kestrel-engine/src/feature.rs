//! A bound feature: its descriptor and the hooks its builder attached

use crate::pipeline::{Middleware, Pipeline, WriteOp};
use kestrel_core::FeatureDescriptor;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Where a hook runs relative to the state access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PreGet,
    PostGet,
    PreSet,
    PostSet,
}

/// Hooks collected while a feature is being bound
///
/// Entries are kept in insertion order and stably sorted by ascending
/// priority when the feature is frozen.
#[derive(Default, Clone)]
pub struct MiddlewareBundle {
    pre_get: Vec<(i32, Arc<dyn Middleware>)>,
    post_get: Vec<(i32, Arc<dyn Middleware>)>,
    pre_set: Vec<(i32, Arc<dyn Middleware>)>,
    post_set: Vec<(i32, Arc<dyn Middleware>)>,
}

impl fmt::Debug for MiddlewareBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |v: &[(i32, Arc<dyn Middleware>)]| -> Vec<String> {
            v.iter().map(|(p, m)| format!("{}:{}", p, m.name())).collect()
        };
        f.debug_struct("MiddlewareBundle")
            .field("pre_get", &names(&self.pre_get))
            .field("post_get", &names(&self.post_get))
            .field("pre_set", &names(&self.pre_set))
            .field("post_set", &names(&self.post_set))
            .finish()
    }
}

impl MiddlewareBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, stage: Stage, priority: i32, middleware: Arc<dyn Middleware>) {
        let list = match stage {
            Stage::PreGet => &mut self.pre_get,
            Stage::PostGet => &mut self.post_get,
            Stage::PreSet => &mut self.pre_set,
            Stage::PostSet => &mut self.post_set,
        };
        list.push((priority, middleware));
    }

    pub fn len(&self, stage: Stage) -> usize {
        self.stage(stage).len()
    }

    fn stage(&self, stage: Stage) -> &[(i32, Arc<dyn Middleware>)] {
        match stage {
            Stage::PreGet => &self.pre_get,
            Stage::PostGet => &self.post_get,
            Stage::PreSet => &self.pre_set,
            Stage::PostSet => &self.post_set,
        }
    }

    fn sorted(&self, stage: Stage) -> Vec<Arc<dyn Middleware>> {
        let mut entries: Vec<_> = self.stage(stage).to_vec();
        entries.sort_by_key(|(priority, _)| *priority);
        entries.into_iter().map(|(_, m)| m).collect()
    }
}

/// A feature as held by the registry
pub struct Feature {
    pub descriptor: Arc<FeatureDescriptor>,
    read: Pipeline,
    writes: HashMap<WriteOp, Pipeline>,
}

impl fmt::Debug for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feature")
            .field("fqn", &self.descriptor.fqn)
            .field("read", &self.read)
            .finish()
    }
}

impl Feature {
    /// Freezes the bundle into read and write pipelines
    pub(crate) fn new(
        descriptor: FeatureDescriptor,
        bundle: &MiddlewareBundle,
        get_from_state: Arc<dyn Middleware>,
        cache_post_get: Arc<dyn Middleware>,
        state_write: impl Fn(WriteOp) -> Arc<dyn Middleware>,
    ) -> Self {
        let mut read = bundle.sorted(Stage::PreGet);
        read.push(get_from_state);
        read.extend(bundle.sorted(Stage::PostGet));
        read.push(cache_post_get);

        let writes = WriteOp::ALL
            .into_iter()
            .map(|op| {
                let mut chain = bundle.sorted(Stage::PreSet);
                chain.push(state_write(op));
                chain.extend(bundle.sorted(Stage::PostSet));
                (op, Pipeline::new(chain))
            })
            .collect();

        Self {
            descriptor: Arc::new(descriptor),
            read: Pipeline::new(read),
            writes,
        }
    }

    pub fn fqn(&self) -> &str {
        &self.descriptor.fqn
    }

    pub fn read_pipeline(&self) -> &Pipeline {
        &self.read
    }

    pub fn write_pipeline(&self, op: WriteOp) -> Option<&Pipeline> {
        self.writes.get(&op)
    }
}
