//! Application state shared across all HTTP handlers
//!
//! Handlers reach the engine and, on processes that run it, the historian
//! through this struct. It is wrapped in an `Arc` so axum can clone it per
//! request.

use kestrel_engine::{Engine, RequestContext};
use kestrel_historian::HistorianServer;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    engine: Engine,
    /// Kept in sync with the engine's registry by the admin routes
    historian: Option<HistorianServer>,
    /// Zero means requests are bounded only by feature timeouts
    request_timeout: Duration,
    start_time: Instant,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self::with_historian(engine, None)
    }

    pub fn with_historian(engine: Engine, historian: Option<HistorianServer>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                engine,
                historian,
                request_timeout: Duration::ZERO,
                start_time: Instant::now(),
            }),
        }
    }

    /// Sets the budget every HTTP request starts with
    ///
    /// Only valid before the state is shared.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.request_timeout = timeout;
        }
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    pub fn historian(&self) -> Option<&HistorianServer> {
        self.inner.historian.as_ref()
    }

    /// A fresh request context carrying the configured budget
    pub fn request_context(&self) -> RequestContext {
        let ctx = RequestContext::new();
        if self.inner.request_timeout.is_zero() {
            ctx
        } else {
            ctx.with_timeout(self.inner.request_timeout)
        }
    }

    /// Returns the server uptime in seconds
    pub fn uptime(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }
}
