//! The engine facade: bind features, read and write them
//!
//! An [`Engine`] owns the registry and the shared collaborators every
//! pipeline needs (state, notification sink, clock). It is cheap to clone.
//! Middlewares and builders that must call back into the engine get an
//! [`EngineHandle`] instead, which does not keep the engine alive.

use crate::builders::{self, BuilderTable, FeatureBuilder, ProgramRegistry};
use crate::context::RequestContext;
use crate::feature::{Feature, MiddlewareBundle};
use crate::middleware::{CachePostGet, GetFromState, StateWrite};
use crate::pipeline::{Exchange, WriteOp};
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use kestrel_core::fqn::{normalize_fqn, parse_selector};
use kestrel_core::{
    AggrFn, DescriptorLookup, Error, FeatureDescriptor, NotificationSink, Payload, Result, SharedClock, State,
    SystemClock, Value, WriteNotification,
};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Namespace used for selectors that omit one
    pub default_namespace: Option<String>,
    /// Rebinding an existing FQN replaces it instead of failing
    pub updates_allowed: bool,
}

struct EngineInner {
    config: EngineConfig,
    registry: Registry,
    state: Arc<dyn State>,
    sink: Arc<dyn NotificationSink>,
    clock: SharedClock,
    builders: BuilderTable,
    programs: Arc<ProgramRegistry>,
}

/// Feature engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// A non-owning reference to an [`Engine`]
#[derive(Clone)]
pub struct EngineHandle(Weak<EngineInner>);

impl EngineHandle {
    /// The engine, unless it has been dropped
    pub fn upgrade(&self) -> Result<Engine> {
        self.0
            .upgrade()
            .map(|inner| Engine { inner })
            .ok_or_else(|| Error::internal("engine is shut down"))
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("alive", &(self.0.strong_count() > 0))
            .finish()
    }
}

pub struct EngineBuilder {
    config: EngineConfig,
    state: Arc<dyn State>,
    sink: Arc<dyn NotificationSink>,
    clock: SharedClock,
    programs: Arc<ProgramRegistry>,
    extra_builders: Vec<(String, Arc<dyn FeatureBuilder>)>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn programs(mut self, programs: Arc<ProgramRegistry>) -> Self {
        self.programs = programs;
        self
    }

    /// Registers an additional builder, replacing a default of the same name
    pub fn builder(mut self, name: impl Into<String>, builder: Arc<dyn FeatureBuilder>) -> Self {
        self.extra_builders.push((name.into(), builder));
        self
    }

    pub fn build(self) -> Engine {
        let mut table = builders::default_table(self.programs.clone());
        for (name, builder) in self.extra_builders {
            table.register(name, builder);
        }
        Engine {
            inner: Arc::new(EngineInner {
                registry: Registry::new(self.config.updates_allowed),
                config: self.config,
                state: self.state,
                sink: self.sink,
                clock: self.clock,
                builders: table,
                programs: self.programs,
            }),
        }
    }
}

impl Engine {
    pub fn builder(state: Arc<dyn State>, sink: Arc<dyn NotificationSink>) -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            state,
            sink,
            clock: Arc::new(SystemClock),
            programs: Arc::new(ProgramRegistry::new()),
            extra_builders: Vec::new(),
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle(Arc::downgrade(&self.inner))
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    pub fn programs(&self) -> &Arc<ProgramRegistry> {
        &self.inner.programs
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Checks that the state is reachable
    pub async fn ping(&self) -> Result<()> {
        self.inner.state.ping().await
    }

    /// Splits a selector into its base FQN and window projection
    fn resolve(&self, selector: &str) -> Result<(String, Option<AggrFn>)> {
        let parsed = parse_selector(selector)?;
        let namespace = match (&parsed.namespace, &self.inner.config.default_namespace) {
            (Some(ns), _) => ns.clone(),
            (None, Some(default)) => default.to_lowercase(),
            (None, None) => return Err(Error::InvalidFqn(selector.to_string())),
        };
        Ok((parsed.fqn(&namespace), parsed.aggr))
    }

    /// Validates a descriptor, runs its builder and registers the result
    pub fn bind(&self, mut fd: FeatureDescriptor) -> Result<()> {
        fd.validate()?;
        fd.fqn = normalize_fqn(&fd.fqn, "")?;

        let builder = self
            .inner
            .builders
            .get(&fd.builder)
            .map_err(|_| Error::invalid_feature(&fd.fqn, format!("unknown builder '{}'", fd.builder)))?;
        let mut bundle = MiddlewareBundle::new();
        builder.apply(&fd, &mut bundle, &self.handle())?;

        let inner = &self.inner;
        let feature = Feature::new(
            fd,
            &bundle,
            Arc::new(GetFromState {
                state: inner.state.clone(),
                clock: inner.clock.clone(),
            }),
            Arc::new(CachePostGet { engine: self.handle() }),
            |op| {
                Arc::new(StateWrite {
                    op,
                    state: inner.state.clone(),
                    sink: inner.sink.clone(),
                })
            },
        );
        inner.registry.bind(feature)
    }

    pub fn unbind(&self, selector: &str) -> Result<()> {
        let (fqn, _) = self.resolve(selector)?;
        self.inner.registry.unbind(&fqn)
    }

    pub fn has(&self, selector: &str) -> bool {
        self.resolve(selector)
            .map(|(fqn, _)| self.inner.registry.has(&fqn))
            .unwrap_or(false)
    }

    pub fn metadata(&self, selector: &str) -> Result<FeatureDescriptor> {
        let (fqn, _) = self.resolve(selector)?;
        Ok((*self.inner.registry.get(&fqn)?.descriptor).clone())
    }

    /// Every bound descriptor, sorted by FQN
    pub fn descriptors(&self) -> Vec<FeatureDescriptor> {
        self.inner.registry.descriptors()
    }

    /// Reads a feature value for an entity
    ///
    /// A `+aggr` suffix projects a windowed feature to one aggregator;
    /// without it windowed features return the whole window map. `Ok((None,
    /// fd))` means nothing is stored and no builder produced a value.
    pub async fn get(
        &self,
        mut ctx: RequestContext,
        selector: &str,
        entity_id: &str,
    ) -> Result<(Option<Value>, Arc<FeatureDescriptor>)> {
        let (fqn, aggr) = self.resolve(selector)?;
        let run = async {
            if entity_id.is_empty() {
                return Err(Error::InvalidPipelineContext("entity id is empty".into()));
            }
            let feature = self.inner.registry.get(&fqn)?;
            let fd = feature.descriptor.clone();
            if let Some(aggr) = aggr {
                let derivable = aggr == AggrFn::Avg && fd.aggr.contains(&AggrFn::Sum) && fd.aggr.contains(&AggrFn::Count);
                if !fd.aggr.contains(&aggr) && !derivable {
                    return Err(Error::UnsupportedAggregator(format!("{} does not track {}", fd.fqn, aggr)));
                }
                ctx.aggregator = Some(aggr);
            }
            ctx.derate(fd.timeout);

            let value = feature
                .read_pipeline()
                .apply(Exchange::new(fd.clone(), entity_id, ctx))
                .await?;
            Ok((value, fd))
        };
        run.await.map_err(|e| e.in_pipeline("get", &fqn, entity_id))
    }

    /// Runs the write pipeline of `op`
    pub async fn write(
        &self,
        mut ctx: RequestContext,
        op: WriteOp,
        selector: &str,
        entity_id: &str,
        payload: Payload,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        let (fqn, aggr) = self.resolve(selector)?;
        let run = async {
            if entity_id.is_empty() {
                return Err(Error::InvalidPipelineContext("entity id is empty".into()));
            }
            if aggr.is_some() {
                return Err(Error::UnsupportedOperation("cannot write to a window projection".into()));
            }
            let feature = self.inner.registry.get(&fqn)?;
            let pipeline = feature
                .write_pipeline(op)
                .ok_or_else(|| Error::internal(format!("no {} pipeline", op)))?;
            ctx.derate(feature.descriptor.timeout);

            let ex = Exchange::new(feature.descriptor.clone(), entity_id, ctx).with_write(payload, ts);
            pipeline.apply(ex).await.map(|_| ())
        };
        run.await.map_err(|e| e.in_pipeline(op.as_str(), &fqn, entity_id))
    }

    pub async fn set(
        &self,
        ctx: RequestContext,
        selector: &str,
        entity_id: &str,
        payload: Payload,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        self.write(ctx, WriteOp::Set, selector, entity_id, payload, ts).await
    }

    pub async fn append(
        &self,
        ctx: RequestContext,
        selector: &str,
        entity_id: &str,
        payload: Payload,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        self.write(ctx, WriteOp::Append, selector, entity_id, payload, ts).await
    }

    pub async fn incr(
        &self,
        ctx: RequestContext,
        selector: &str,
        entity_id: &str,
        payload: Payload,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        self.write(ctx, WriteOp::Incr, selector, entity_id, payload, ts).await
    }

    pub async fn update(
        &self,
        ctx: RequestContext,
        selector: &str,
        entity_id: &str,
        payload: Payload,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        self.write(ctx, WriteOp::Update, selector, entity_id, payload, ts).await
    }

    /// Sends a value straight to the historical store, bypassing the state
    ///
    /// Used for backfills, so the staleness limit does not apply. Windowed
    /// features are rejected; their history is produced from buckets.
    pub fn write_historical(&self, selector: &str, entity_id: &str, payload: Payload, ts: DateTime<Utc>) -> Result<()> {
        let (fqn, _) = self.resolve(selector)?;
        let run = || {
            let fd = self.inner.registry.get(&fqn)?.descriptor.clone();
            if fd.is_windowed() {
                return Err(Error::UnsupportedOperation(
                    "historical writes are not supported for windowed features".into(),
                ));
            }
            if !fd.is_headless() {
                payload.conforms_to(fd.primitive)?;
            }
            self.inner
                .sink
                .add_write(WriteNotification::new(&fd.fqn, entity_id, Value::new(payload, ts)))
        };
        run().map_err(|e| e.in_pipeline("write historical", &fqn, entity_id))
    }
}

impl DescriptorLookup for Engine {
    fn descriptor(&self, fqn: &str) -> Result<FeatureDescriptor> {
        self.metadata(fqn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{CollectNotification, Primitive};
    use kestrel_providers::state::MemoryState;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        collects: Mutex<Vec<CollectNotification>>,
        writes: Mutex<Vec<WriteNotification>>,
    }

    impl NotificationSink for Recorder {
        fn add_collect(&self, notification: CollectNotification) -> Result<()> {
            self.collects.lock().unwrap().push(notification);
            Ok(())
        }

        fn add_write(&self, notification: WriteNotification) -> Result<()> {
            self.writes.lock().unwrap().push(notification);
            Ok(())
        }
    }

    fn engine(config: EngineConfig) -> (Engine, Arc<Recorder>) {
        let clock: SharedClock = Arc::new(SystemClock);
        let state = Arc::new(MemoryState::new(clock.clone(), Default::default()));
        let sink = Arc::new(Recorder::default());
        let engine = Engine::builder(state, sink.clone()).config(config).clock(clock).build();
        (engine, sink)
    }

    fn fd(fqn: &str) -> FeatureDescriptor {
        FeatureDescriptor::new(fqn, Primitive::Int)
            .with_freshness(Duration::from_secs(10))
            .with_staleness(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_missing_namespace_without_default() {
        let (engine, _) = engine(EngineConfig::default());
        engine.bind(fd("ns.a")).unwrap();
        let err = engine.get(RequestContext::new(), "a", "e1").await.unwrap_err();
        assert!(matches!(err, Error::InvalidFqn(_)));
    }

    #[tokio::test]
    async fn test_default_namespace_applies() {
        let (engine, _) = engine(EngineConfig {
            default_namespace: Some("ns".into()),
            ..Default::default()
        });
        engine.bind(fd("ns.a")).unwrap();
        assert!(engine.has("a"));
        assert_eq!(engine.metadata("A").unwrap().fqn, "ns.a");
    }

    #[tokio::test]
    async fn test_unknown_builder_is_invalid() {
        let (engine, _) = engine(EngineConfig::default());
        let err = engine.bind(fd("ns.a").with_builder("nope", serde_json::Value::Null)).unwrap_err();
        assert_eq!(err.kind(), kestrel_core::ErrorKind::InvalidFeature);
    }

    #[tokio::test]
    async fn test_write_historical_bypasses_state() {
        let (engine, sink) = engine(EngineConfig::default());
        engine.bind(fd("ns.a")).unwrap();
        let old = Utc::now() - chrono::TimeDelta::days(30);
        engine.write_historical("ns.a", "e1", Payload::from(5i64), old).unwrap();

        assert_eq!(sink.writes.lock().unwrap().len(), 1);
        assert!(sink.collects.lock().unwrap().is_empty());
        let (v, _) = engine.get(RequestContext::new(), "ns.a", "e1").await.unwrap();
        assert!(v.is_none());
    }

    #[tokio::test]
    async fn test_errors_carry_context() {
        let (engine, _) = engine(EngineConfig::default());
        let err = engine.get(RequestContext::new(), "ns.missing", "e1").await.unwrap_err();
        assert_eq!(err.kind(), kestrel_core::ErrorKind::FeatureNotFound);
        assert!(err.to_string().contains("ns.missing"));
        assert!(err.to_string().contains("e1"));
    }

    #[tokio::test]
    async fn test_handle_does_not_keep_engine_alive() {
        let (engine, _) = engine(EngineConfig::default());
        let handle = engine.handle();
        assert!(handle.upgrade().is_ok());
        drop(engine);
        assert!(handle.upgrade().is_err());
    }
}
