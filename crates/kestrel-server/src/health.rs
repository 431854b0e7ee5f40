//! Health checks
//!
//! - `/health` - liveness, always succeeds if the server is up
//! - `/health/ready` - readiness, pings the state and reports historian backlog

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::state::AppState;

/// A state ping slower than this reports the state as degraded
const DEGRADED_LATENCY: Duration = Duration::from_millis(500);

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: ComponentStatus,
    pub uptime_seconds: u64,
    pub version: String,
    pub features: usize,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub state: ComponentHealth,
    pub historian: ComponentHealth,
}

/// Health status for a single component
#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
    NotConfigured,
}

impl ComponentHealth {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            status: ComponentStatus::Healthy,
            latency_ms: Some(latency_ms),
            message: None,
            details: None,
        }
    }

    pub fn healthy_with_details(details: serde_json::Value) -> Self {
        Self {
            status: ComponentStatus::Healthy,
            latency_ms: None,
            message: None,
            details: Some(details),
        }
    }

    pub fn degraded(message: &str, latency_ms: u64) -> Self {
        Self {
            status: ComponentStatus::Degraded,
            latency_ms: Some(latency_ms),
            message: Some(message.to_string()),
            details: None,
        }
    }

    pub fn unhealthy(message: &str) -> Self {
        Self {
            status: ComponentStatus::Unhealthy,
            latency_ms: None,
            message: Some(message.to_string()),
            details: None,
        }
    }

    pub fn not_configured() -> Self {
        Self {
            status: ComponentStatus::NotConfigured,
            latency_ms: None,
            message: Some("Component not configured".to_string()),
            details: None,
        }
    }
}

/// Liveness check
///
/// ## Endpoint
/// `GET /health`
///
/// ## Response
/// ```json
/// { "status": "ok", "uptime_seconds": 123, "version": "0.1.0" }
/// ```
pub async fn liveness(State(state): State<AppState>) -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "ok".to_string(),
        uptime_seconds: state.uptime(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check
///
/// Returns 503 when the state cannot be reached, 200 otherwise.
pub async fn readiness(State(state): State<AppState>) -> Response {
    let state_health = check_state(&state).await;
    let historian_health = match state.historian() {
        Some(historian) => ComponentHealth::healthy_with_details(serde_json::json!({
            "pending_collects": historian.pending_collects(),
            "pending_writes": historian.pending_writes(),
            "handled_buckets": historian.handled().len(),
        })),
        None => ComponentHealth::not_configured(),
    };

    let status = state_health.status;
    let body = ReadinessResponse {
        status,
        uptime_seconds: state.uptime(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        features: state.engine().descriptors().len(),
        checks: HealthChecks {
            state: state_health,
            historian: historian_health,
        },
    };

    let code = if status == ComponentStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(body)).into_response()
}

async fn check_state(state: &AppState) -> ComponentHealth {
    let start = Instant::now();
    match state.engine().ping().await {
        Ok(()) => {
            let latency = start.elapsed();
            let latency_ms = latency.as_millis() as u64;
            if latency > DEGRADED_LATENCY {
                ComponentHealth::degraded("state responded slowly", latency_ms)
            } else {
                ComponentHealth::healthy(latency_ms)
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "state ping failed");
            ComponentHealth::unhealthy(&e.to_string())
        }
    }
}
