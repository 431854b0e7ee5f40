//! Kestrel Server Library
//!
//! The `kestrel` binary's modules, exposed for integration testing.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kestrel_server::{app, config, runtime::Runtime};
//!
//! let config = config::load("kestrel.yaml")?;
//! let runtime = Runtime::build(&config).await?;
//! let router = app(runtime.app_state(&config), &config.accessor_http_prefix);
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod request_id;
pub mod runtime;
pub mod shutdown;
pub mod state;

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;

use crate::state::AppState;

const MAX_BODY_SIZE: usize = 1024 * 1024;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// The full HTTP surface: health checks at the root, accessor routes under `prefix`
pub fn app(state: AppState, prefix: &str) -> Router {
    let prefix = prefix.trim_end_matches('/');
    let router = Router::new()
        .route("/health", get(health::liveness))
        .route("/health/ready", get(health::readiness));
    let router = if prefix.is_empty() {
        router.merge(api::routes())
    } else {
        router.nest(prefix, api::routes())
    };

    router
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(axum::middleware::from_fn(request_id::request_id_middleware))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(HTTP_TIMEOUT))
        .with_state(state)
}
