//! Compute-on-read builders backed by user programs

use super::{compute_stage, FeatureBuilder};
use crate::engine::EngineHandle;
use crate::feature::MiddlewareBundle;
use crate::pipeline::{Exchange, Middleware, Next};
use async_trait::async_trait;
use kestrel_core::{Error, FeatureDescriptor, Payload, Result, SharedClock, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// What a program sees when it runs
pub struct ProgramInput<'a> {
    pub fd: &'a FeatureDescriptor,
    pub entity_id: &'a str,
    /// The in-flight value (the stored value, or the member map of a set)
    pub current: Option<&'a Value>,
    /// Decoded body of a REST callout
    pub response: Option<&'a serde_json::Value>,
    /// Read access to other features
    pub engine: &'a EngineHandle,
}

/// User logic computing a feature value
///
/// Returning `Ok(None)` leaves the in-flight value untouched.
#[async_trait]
pub trait Program: Send + Sync {
    async fn run(&self, input: ProgramInput<'_>) -> Result<Option<Payload>>;
}

/// A [`Program`] made from a synchronous closure
pub struct FnProgram<F>(pub F);

impl<F> FnProgram<F>
where
    F: Fn(&ProgramInput<'_>) -> Result<Option<Payload>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Program for FnProgram<F>
where
    F: Fn(&ProgramInput<'_>) -> Result<Option<Payload>> + Send + Sync,
{
    async fn run(&self, input: ProgramInput<'_>) -> Result<Option<Payload>> {
        (self.0)(&input)
    }
}

/// Programs keyed by the FQN they compute
#[derive(Default)]
pub struct ProgramRegistry {
    programs: RwLock<HashMap<String, Arc<dyn Program>>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, fqn: impl Into<String>, program: Arc<dyn Program>) {
        if let Ok(mut programs) = self.programs.write() {
            programs.insert(fqn.into(), program);
        }
    }

    pub fn remove(&self, fqn: &str) {
        if let Ok(mut programs) = self.programs.write() {
            programs.remove(fqn);
        }
    }

    pub fn get(&self, fqn: &str) -> Option<Arc<dyn Program>> {
        self.programs.read().ok()?.get(fqn).cloned()
    }

    pub fn contains(&self, fqn: &str) -> bool {
        self.get(fqn).is_some()
    }
}

/// Skips recomputation when the state already served a fresh value
pub(crate) fn served_fresh(ex: &Exchange) -> bool {
    ex.ctx.from_cache && ex.ctx.cache_fresh && !ex.fd.is_windowed()
}

/// Runs the feature's program and stores its output as a fresh value
pub(crate) async fn run_program(
    program: &dyn Program,
    ex: &mut Exchange,
    response: Option<&serde_json::Value>,
    engine: &EngineHandle,
    clock: &SharedClock,
) -> Result<()> {
    let input = ProgramInput {
        fd: &ex.fd,
        entity_id: &ex.entity_id,
        current: ex.value.as_ref(),
        response,
        engine,
    };
    let out = ex.ctx.guard(program.run(input)).await?;
    if let Some(payload) = out {
        ex.value = Some(Value::new(payload, clock.now()).fresh(true));
    }
    Ok(())
}

struct ComputeOnRead {
    name: &'static str,
    programs: Arc<ProgramRegistry>,
    engine: EngineHandle,
    clock: SharedClock,
    required: bool,
}

#[async_trait]
impl Middleware for ComputeOnRead {
    fn name(&self) -> &str {
        self.name
    }

    async fn handle(&self, ex: &mut Exchange, next: Next<'_>) -> Result<()> {
        if served_fresh(ex) {
            return next.run(ex).await;
        }
        match self.programs.get(&ex.fd.fqn) {
            Some(program) => run_program(program.as_ref(), ex, None, &self.engine, &self.clock).await?,
            None if self.required => {
                return Err(Error::InvalidPipelineContext(format!(
                    "no program registered for {}",
                    ex.fd.fqn
                )))
            }
            None => tracing::debug!(fqn = %ex.fd.fqn, "no program registered, passing through"),
        }
        next.run(ex).await
    }
}

fn attach(
    name: &'static str,
    programs: &Arc<ProgramRegistry>,
    fd: &FeatureDescriptor,
    bundle: &mut MiddlewareBundle,
    engine: &EngineHandle,
    required: bool,
) -> Result<()> {
    let clock = engine.upgrade()?.clock().clone();
    bundle.add(
        compute_stage(fd),
        0,
        Arc::new(ComputeOnRead {
            name,
            programs: programs.clone(),
            engine: engine.clone(),
            clock,
            required,
        }),
    );
    Ok(())
}

/// Values computed by a program, cached like any other feature
pub struct Sourceless {
    programs: Arc<ProgramRegistry>,
}

impl Sourceless {
    pub fn new(programs: Arc<ProgramRegistry>) -> Self {
        Self { programs }
    }
}

impl FeatureBuilder for Sourceless {
    fn apply(&self, fd: &FeatureDescriptor, bundle: &mut MiddlewareBundle, engine: &EngineHandle) -> Result<()> {
        attach("sourceless", &self.programs, fd, bundle, engine, false)
    }
}

/// Values computed by a program on every read and never stored
pub struct Headless {
    programs: Arc<ProgramRegistry>,
}

impl Headless {
    pub fn new(programs: Arc<ProgramRegistry>) -> Self {
        Self { programs }
    }
}

impl FeatureBuilder for Headless {
    fn apply(&self, fd: &FeatureDescriptor, bundle: &mut MiddlewareBundle, engine: &EngineHandle) -> Result<()> {
        if !self.programs.contains(&fd.fqn) {
            return Err(Error::invalid_feature(
                &fd.fqn,
                "headless features need a program registered before bind",
            ));
        }
        attach("headless", &self.programs, fd, bundle, engine, true)
    }
}
