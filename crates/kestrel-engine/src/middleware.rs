//! Middlewares the engine places in every pipeline

use crate::context::RequestContext;
use crate::engine::EngineHandle;
use crate::pipeline::{Exchange, Middleware, Next, WriteOp};
use async_trait::async_trait;
use kestrel_core::state::is_expired;
use kestrel_core::window::bucket_name;
use kestrel_core::{
    CollectNotification, Error, NotificationSink, Payload, Result, Scalar, SharedClock, State, Value,
};
use std::sync::Arc;

/// Reads the state and, on a hit, replaces the in-flight value
pub struct GetFromState {
    pub state: Arc<dyn State>,
    pub clock: SharedClock,
}

#[async_trait]
impl Middleware for GetFromState {
    fn name(&self) -> &str {
        "get-from-state"
    }

    async fn handle(&self, ex: &mut Exchange, next: Next<'_>) -> Result<()> {
        let fd = ex.fd.clone();
        if fd.is_headless() {
            return next.run(ex).await;
        }

        let stored = ex.ctx.guard(self.state.get(&fd, &ex.entity_id)).await?;
        let Some(value) = stored else {
            return next.run(ex).await;
        };
        if !fd.is_windowed() && is_expired(&fd, value.timestamp, self.clock.now()) {
            return next.run(ex).await;
        }

        ex.ctx.from_cache = true;
        ex.ctx.cache_fresh = value.fresh;
        ex.value = Some(match (fd.is_windowed(), ex.ctx.aggregator) {
            (true, Some(aggr)) => {
                let map = value.payload.as_window().ok_or_else(|| {
                    Error::InvalidPipelineContext(format!("{} did not return a window result", fd.fqn))
                })?;
                let projected = map
                    .get(&aggr)
                    .copied()
                    .ok_or_else(|| Error::UnsupportedAggregator(format!("{} is not tracked by {}", aggr, fd.fqn)))?;
                Value {
                    payload: Payload::Scalar(Scalar::Float(projected)),
                    timestamp: value.timestamp,
                    fresh: value.fresh,
                }
            }
            _ => value,
        });
        next.run(ex).await
    }
}

/// Writes a freshly computed value back to the state in the background
pub struct CachePostGet {
    pub engine: EngineHandle,
}

#[async_trait]
impl Middleware for CachePostGet {
    fn name(&self) -> &str {
        "cache-post-get"
    }

    async fn handle(&self, ex: &mut Exchange, next: Next<'_>) -> Result<()> {
        let fd = &ex.fd;
        let refresh = match &ex.value {
            Some(v) => {
                v.fresh
                    && !fd.is_windowed()
                    && !fd.is_headless()
                    && ex.ctx.cache_post_get != Some(false)
                    && !ex.ctx.cache_fresh
                    && matches!(v.payload, Payload::Scalar(_) | Payload::List(_))
            }
            None => false,
        };

        if refresh {
            if let Some(v) = &ex.value {
                v.payload.conforms_to(fd.primitive)?;
            }
            if let (Some(value), Ok(engine)) = (ex.value.clone(), self.engine.upgrade()) {
                let fqn = fd.fqn.clone();
                let entity_id = ex.entity_id.clone();
                tokio::spawn(async move {
                    let ctx = RequestContext::new().without_cache_refresh();
                    if let Err(e) = engine
                        .write(ctx, WriteOp::Set, &fqn, &entity_id, value.payload, value.timestamp)
                        .await
                    {
                        tracing::error!(fqn = %fqn, entity_id = %entity_id, error = %e, "cache refresh failed");
                    }
                });
            }
        }
        next.run(ex).await
    }
}

/// Applies a write to the state and asks the historian to collect it
pub struct StateWrite {
    pub op: WriteOp,
    pub state: Arc<dyn State>,
    pub sink: Arc<dyn NotificationSink>,
}

#[async_trait]
impl Middleware for StateWrite {
    fn name(&self) -> &str {
        self.op.as_str()
    }

    async fn handle(&self, ex: &mut Exchange, next: Next<'_>) -> Result<()> {
        let fd = ex.fd.clone();
        let value = ex
            .value
            .clone()
            .ok_or_else(|| Error::InvalidPipelineContext("write pipeline has no value".into()))?;
        // headless features keep nothing; the write only runs the set hooks
        if fd.is_headless() {
            return next.run(ex).await;
        }
        value.payload.conforms_to(fd.primitive)?;
        if self.op == WriteOp::Append && matches!(&value.payload, Payload::List(items) if items.is_empty()) {
            return next.run(ex).await;
        }

        let write = async {
            match self.op {
                WriteOp::Set => self.state.set(&fd, &ex.entity_id, &value.payload, value.timestamp).await,
                WriteOp::Append => self.state.append(&fd, &ex.entity_id, &value.payload, value.timestamp).await,
                WriteOp::Incr => self.state.incr(&fd, &ex.entity_id, &value.payload, value.timestamp).await,
                WriteOp::Update => self.state.update(&fd, &ex.entity_id, &value.payload, value.timestamp).await,
            }
        };
        ex.ctx.guard(write).await?;

        let bucket = if fd.is_windowed() {
            bucket_name(value.timestamp, fd.freshness)
        } else {
            String::new()
        };
        if let Err(e) = self
            .sink
            .add_collect(CollectNotification::new(&fd.fqn, &ex.entity_id, bucket))
        {
            tracing::warn!(fqn = %fd.fqn, entity_id = %ex.entity_id, error = %e, "collect notification dropped");
        }
        next.run(ex).await
    }
}
