//! Per-request flags threaded through a pipeline

use kestrel_core::{AggrFn, Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Request options and the flags middlewares leave for each other
///
/// Callers fill the first group; `from_cache` and `cache_fresh` are set by
/// the state read and observed by builders and the cache refresh.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Window projection selected with a `+aggr` suffix
    pub aggregator: Option<AggrFn>,
    /// `Some(false)` suppresses the write-back of a computed value
    pub cache_post_get: Option<bool>,
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,

    /// The in-flight value came from the state
    pub from_cache: bool,
    /// ... and that state value was fresh
    pub cache_fresh: bool,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn without_cache_refresh(mut self) -> Self {
        self.cache_post_get = Some(false);
        self
    }

    /// Tightens the deadline to `0.98 × timeout` from now when the feature has one
    pub fn derate(&mut self, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }
        let feature_deadline = Instant::now() + timeout.mul_f64(0.98);
        self.deadline = Some(match self.deadline {
            Some(d) => d.min(feature_deadline),
            None => feature_deadline,
        });
    }

    /// A context for a nested request: same deadline and cancellation,
    /// fresh flags and no projection
    pub fn child(&self) -> Self {
        Self {
            aggregator: None,
            cache_post_get: self.cache_post_get,
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
            from_cache: false,
            cache_fresh: false,
        }
    }

    /// Time left before the deadline, if any
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Runs `fut` unless the request is cancelled first
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            r = fut => r,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derate_keeps_earliest_deadline() {
        let mut ctx = RequestContext::new().with_timeout(Duration::from_millis(10));
        let outer = ctx.deadline.unwrap();
        ctx.derate(Duration::from_secs(5));
        assert_eq!(ctx.deadline.unwrap(), outer);

        let mut ctx = RequestContext::new();
        ctx.derate(Duration::from_millis(100));
        let left = ctx.remaining().unwrap();
        assert!(left <= Duration::from_millis(98));

        let mut ctx = RequestContext::new();
        ctx.derate(Duration::ZERO);
        assert!(ctx.deadline.is_none());
    }

    #[tokio::test]
    async fn test_guard_honors_cancellation() {
        let ctx = RequestContext::new();
        ctx.cancel.cancel();
        let r = ctx.guard(async { Ok(1) }).await;
        assert!(matches!(r, Err(Error::Cancelled)));
    }

    #[test]
    fn test_child_resets_flags() {
        let mut ctx = RequestContext::new();
        ctx.from_cache = true;
        ctx.aggregator = Some(AggrFn::Sum);
        let child = ctx.child();
        assert!(!child.from_cache);
        assert!(child.aggregator.is_none());
    }
}
