//! Fan-out builders: feature sets and models
//!
//! Both read every member feature concurrently and return a
//! [`Payload::Set`] keyed by member selector. A model then hands that map to
//! its program. Neither accepts writes.

use super::compute::{run_program, served_fresh, ProgramRegistry};
use super::FeatureBuilder;
use crate::engine::EngineHandle;
use crate::feature::{MiddlewareBundle, Stage};
use crate::pipeline::{Exchange, Middleware, Next};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use kestrel_core::{Error, FeatureDescriptor, Payload, Result, SharedClock, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

fn members(fd: &FeatureDescriptor) -> Result<Vec<String>> {
    fd.set_members()?
        .ok_or_else(|| Error::invalid_feature(&fd.fqn, "not a feature set"))
}

pub struct FeatureSet;

impl FeatureBuilder for FeatureSet {
    fn apply(&self, fd: &FeatureDescriptor, bundle: &mut MiddlewareBundle, engine: &EngineHandle) -> Result<()> {
        bundle.add(
            Stage::PostGet,
            0,
            Arc::new(FanOut {
                members: members(fd)?,
                engine: engine.clone(),
                model: None,
            }),
        );
        bundle.add(Stage::PreSet, 0, Arc::new(RejectWrites));
        Ok(())
    }
}

pub struct Model {
    programs: Arc<ProgramRegistry>,
}

impl Model {
    pub fn new(programs: Arc<ProgramRegistry>) -> Self {
        Self { programs }
    }
}

impl FeatureBuilder for Model {
    fn apply(&self, fd: &FeatureDescriptor, bundle: &mut MiddlewareBundle, engine: &EngineHandle) -> Result<()> {
        let clock = engine.upgrade()?.clock().clone();
        bundle.add(
            Stage::PostGet,
            0,
            Arc::new(FanOut {
                members: members(fd)?,
                engine: engine.clone(),
                model: Some((self.programs.clone(), clock)),
            }),
        );
        bundle.add(Stage::PreSet, 0, Arc::new(RejectWrites));
        Ok(())
    }
}

struct FanOut {
    members: Vec<String>,
    engine: EngineHandle,
    model: Option<(Arc<ProgramRegistry>, SharedClock)>,
}

#[async_trait]
impl Middleware for FanOut {
    fn name(&self) -> &str {
        if self.model.is_some() {
            "model"
        } else {
            "featureset"
        }
    }

    async fn handle(&self, ex: &mut Exchange, next: Next<'_>) -> Result<()> {
        if served_fresh(ex) {
            return next.run(ex).await;
        }
        let engine = self.engine.upgrade()?;
        let reads = self.members.iter().map(|member| {
            let engine = engine.clone();
            let ctx = ex.ctx.child();
            let entity_id = ex.entity_id.clone();
            async move { (member, engine.get(ctx, member, &entity_id).await) }
        });

        let mut values = BTreeMap::new();
        let mut latest: Option<DateTime<Utc>> = None;
        let mut fresh = false;
        for (member, result) in join_all(reads).await {
            match result {
                Ok((Some(v), _)) => {
                    latest = Some(latest.map_or(v.timestamp, |t| t.max(v.timestamp)));
                    fresh |= v.fresh;
                    values.insert(member.clone(), v);
                }
                Ok((None, _)) => {}
                Err(e) => tracing::error!(fqn = %ex.fd.fqn, member = %member, error = %e, "failed to read member"),
            }
        }

        if let Some(ts) = latest {
            ex.value = Some(Value::new(Payload::Set(values), ts).fresh(fresh));
        }
        if let Some((programs, clock)) = &self.model {
            if let Some(program) = programs.get(&ex.fd.fqn) {
                run_program(program.as_ref(), ex, None, &self.engine, clock).await?;
            }
        }
        next.run(ex).await
    }
}

struct RejectWrites;

#[async_trait]
impl Middleware for RejectWrites {
    fn name(&self) -> &str {
        "reject-writes"
    }

    async fn handle(&self, ex: &mut Exchange, _next: Next<'_>) -> Result<()> {
        Err(Error::UnsupportedOperation(format!(
            "{} is computed from other features and cannot be written",
            ex.fd.fqn
        )))
    }
}
