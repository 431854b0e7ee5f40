//! Middleware pipelines
//!
//! A pipeline is an ordered list of middlewares around one state access.
//! Each middleware receives the in-flight [`Exchange`] and a [`Next`] handle
//! for the rest of the chain; it may change the value, short-circuit by not
//! calling `next`, or fail.
//!
//! ```text
//!  read:   preGet.. ─► getFromState ─► postGet.. ─► cachePostGet
//!  write:  preSet.. ─► state-write(op) ─► postSet..
//! ```
//!
//! Every call to [`Next::run`] publishes the current value. When the request
//! carries a deadline the chain runs on its own task and, if the deadline
//! fires first, the caller gets the last published value with the
//! `DeadlineExceeded` error.

use crate::context::RequestContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kestrel_core::{Error, FeatureDescriptor, Payload, Result, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// The state operation a write pipeline performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOp {
    Set,
    Append,
    Incr,
    Update,
}

impl WriteOp {
    pub const ALL: [WriteOp; 4] = [WriteOp::Set, WriteOp::Append, WriteOp::Incr, WriteOp::Update];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Append => "append",
            Self::Incr => "incr",
            Self::Update => "update",
        }
    }
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WriteOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "set" => Ok(Self::Set),
            "append" => Ok(Self::Append),
            "incr" | "increment" => Ok(Self::Incr),
            "update" => Ok(Self::Update),
            other => Err(Error::UnsupportedOperation(format!("unknown write operation '{}'", other))),
        }
    }
}

/// Everything a middleware can see and change during one request
#[derive(Debug)]
pub struct Exchange {
    pub fd: Arc<FeatureDescriptor>,
    pub entity_id: String,
    pub value: Option<Value>,
    pub ctx: RequestContext,
    emitter: Option<watch::Sender<Option<Value>>>,
}

impl Exchange {
    pub fn new(fd: Arc<FeatureDescriptor>, entity_id: impl Into<String>, ctx: RequestContext) -> Self {
        Self {
            fd,
            entity_id: entity_id.into(),
            value: None,
            ctx,
            emitter: None,
        }
    }

    /// Seeds the exchange with a value to write
    pub fn with_write(mut self, payload: Payload, ts: DateTime<Utc>) -> Self {
        self.value = Some(Value::new(payload, ts));
        self
    }

    fn emit(&self) {
        if let Some(tx) = &self.emitter {
            tx.send_replace(self.value.clone());
        }
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    async fn handle(&self, ex: &mut Exchange, next: Next<'_>) -> Result<()>;
}

/// The remainder of a chain
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
}

impl Next<'_> {
    /// Publishes the current value and runs the rest of the chain
    pub async fn run(self, ex: &mut Exchange) -> Result<()> {
        ex.emit();
        match self.chain.split_first() {
            Some((head, rest)) => head.handle(ex, Next { chain: rest }).await,
            None => Ok(()),
        }
    }
}

/// A frozen middleware chain
#[derive(Clone)]
pub struct Pipeline {
    middlewares: Arc<[Arc<dyn Middleware>]>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.middlewares.iter().map(|m| m.name())).finish()
    }
}

impl Pipeline {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            middlewares: middlewares.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    /// Runs the chain and returns the final value
    pub async fn apply(&self, mut ex: Exchange) -> Result<Option<Value>> {
        let Some(deadline) = ex.ctx.deadline else {
            Next { chain: &self.middlewares }.run(&mut ex).await?;
            return Ok(ex.value);
        };

        let (tx, rx) = watch::channel(ex.value.clone());
        ex.emitter = Some(tx);
        ex.ctx.cancel = ex.ctx.cancel.child_token();
        let cancel = ex.ctx.cancel.clone();
        let middlewares = self.middlewares.clone();
        let mut worker = tokio::spawn(async move {
            Next { chain: &middlewares }.run(&mut ex).await?;
            Ok::<_, Error>(ex.value)
        });

        tokio::select! {
            joined = &mut worker => {
                joined.map_err(|e| Error::internal(format!("pipeline task failed: {}", e)))?
            }
            _ = tokio::time::sleep_until(deadline) => {
                // stop middlewares that watch for cancellation; the task is left to finish
                cancel.cancel();
                let partial = rx.borrow().clone();
                Err(Error::DeadlineExceeded { partial: partial.map(Box::new) })
            }
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::Primitive;
    use std::time::Duration;

    struct SetValue(i64);

    #[async_trait]
    impl Middleware for SetValue {
        fn name(&self) -> &str {
            "set-value"
        }

        async fn handle(&self, ex: &mut Exchange, next: Next<'_>) -> Result<()> {
            ex.value = Some(Value::new(Payload::from(self.0), Utc::now()));
            next.run(ex).await
        }
    }

    struct Sleep(Duration);

    #[async_trait]
    impl Middleware for Sleep {
        fn name(&self) -> &str {
            "sleep"
        }

        async fn handle(&self, ex: &mut Exchange, next: Next<'_>) -> Result<()> {
            tokio::time::sleep(self.0).await;
            next.run(ex).await
        }
    }

    struct Stop;

    #[async_trait]
    impl Middleware for Stop {
        fn name(&self) -> &str {
            "stop"
        }

        async fn handle(&self, _ex: &mut Exchange, _next: Next<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn mw(m: impl Middleware + 'static) -> Arc<dyn Middleware> {
        Arc::new(m)
    }

    fn exchange(ctx: RequestContext) -> Exchange {
        Exchange::new(Arc::new(FeatureDescriptor::new("ns.a", Primitive::Int)), "e1", ctx)
    }

    fn payload(v: Option<Value>) -> Option<Payload> {
        v.map(|v| v.payload)
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let p = Pipeline::new(vec![mw(SetValue(1)), mw(SetValue(2))]);
        let v = p.apply(exchange(RequestContext::new())).await.unwrap();
        assert_eq!(payload(v), Some(Payload::from(2i64)));
    }

    #[tokio::test]
    async fn test_short_circuit() {
        let p = Pipeline::new(vec![mw(SetValue(1)), mw(Stop), mw(SetValue(2))]);
        let v = p.apply(exchange(RequestContext::new())).await.unwrap();
        assert_eq!(payload(v), Some(Payload::from(1i64)));
        assert_eq!(p.names(), vec!["set-value", "stop", "set-value"]);
    }

    #[tokio::test]
    async fn test_deadline_returns_last_emitted_value() {
        let p = Pipeline::new(vec![
            mw(SetValue(7)),
            mw(Sleep(Duration::from_millis(500))),
            mw(SetValue(8)),
        ]);
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(30));
        let err = p.apply(exchange(ctx)).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded { .. }));
        assert_eq!(err.partial_value().map(|v| v.payload.clone()), Some(Payload::from(7i64)));
    }

    #[tokio::test]
    async fn test_deadline_not_hit() {
        let p = Pipeline::new(vec![mw(SetValue(3))]);
        let ctx = RequestContext::new().with_timeout(Duration::from_secs(5));
        let v = p.apply(exchange(ctx)).await.unwrap();
        assert_eq!(payload(v), Some(Payload::from(3i64)));
    }

    #[test]
    fn test_write_op_parse() {
        assert_eq!("INCR".parse::<WriteOp>().unwrap(), WriteOp::Incr);
        assert!("delete".parse::<WriteOp>().is_err());
    }
}
