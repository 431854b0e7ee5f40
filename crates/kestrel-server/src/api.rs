//! HTTP accessor handlers
//!
//! Thin adapters over the [`Engine`](kestrel_engine::Engine) operations.
//! Every read and write response echoes the request UUID, generating one
//! when the caller did not send it.
//!
//! | Method | Path | Operation |
//! |---|---|---|
//! | GET | `/features` | list bound descriptors |
//! | GET | `/features/:fqn` | metadata |
//! | GET | `/features/:fqn/:entity` | get |
//! | POST | `/features/:fqn/:entity` | set, append, incr or update |
//! | POST | `/admin/features` | bind |
//! | DELETE | `/admin/features/:fqn` | unbind |

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use kestrel_core::{Clock, FeatureDescriptor, Payload, Value};
use kestrel_engine::WriteOp;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::state::AppState;

/// Accessor routes, relative to the configured prefix
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/features", get(list_features))
        .route("/features/:fqn", get(metadata))
        .route("/features/:fqn/:entity", get(get_feature).post(write_feature))
        .route("/admin/features", post(bind_feature))
        .route("/admin/features/:fqn", delete(unbind_feature))
}

#[derive(Debug, Default, Deserialize)]
pub struct UuidQuery {
    pub uuid: Option<String>,
}

fn request_uuid(uuid: Option<String>) -> String {
    uuid.filter(|u| !u.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// A value as rendered on the wire
#[derive(Debug, Clone, Serialize)]
pub struct ValueBody {
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub fresh: bool,
}

impl From<&Value> for ValueBody {
    fn from(v: &Value) -> Self {
        Self {
            value: v.payload.to_json(),
            timestamp: v.timestamp,
            fresh: v.fresh,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FeatureValue {
    pub fqn: String,
    pub entity_id: String,
    #[serde(flatten)]
    pub value: ValueBody,
}

#[derive(Debug, Serialize)]
pub struct GetResponse {
    pub uuid: String,
    /// `null` when nothing is stored for the entity
    pub feature_value: Option<FeatureValue>,
    pub metadata: FeatureDescriptor,
}

#[derive(Debug, Serialize)]
pub struct MetadataResponse {
    pub uuid: String,
    pub metadata: FeatureDescriptor,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub features: Vec<FeatureDescriptor>,
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    #[serde(default)]
    pub uuid: Option<String>,
    pub value: serde_json::Value,
    /// Defaults to now
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub op: String,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub uuid: String,
}

/// `GET /features`
pub async fn list_features(State(state): State<AppState>) -> Json<ListResponse> {
    Json(ListResponse {
        features: state.engine().descriptors(),
    })
}

/// `GET /features/:fqn`
pub async fn metadata(
    State(state): State<AppState>,
    Path(fqn): Path<String>,
    Query(query): Query<UuidQuery>,
) -> Result<Json<MetadataResponse>> {
    let metadata = state.engine().metadata(&fqn)?;
    Ok(Json(MetadataResponse {
        uuid: request_uuid(query.uuid),
        metadata,
    }))
}

/// `GET /features/:fqn/:entity`
///
/// A `+aggr` suffix on the FQN projects a windowed feature to one aggregator.
pub async fn get_feature(
    State(state): State<AppState>,
    Path((fqn, entity_id)): Path<(String, String)>,
    Query(query): Query<UuidQuery>,
) -> Result<Json<GetResponse>> {
    let uuid = request_uuid(query.uuid);
    let (value, fd) = state.engine().get(state.request_context(), &fqn, &entity_id).await?;

    tracing::debug!(%uuid, fqn = %fqn, entity_id = %entity_id, hit = value.is_some(), "get");

    Ok(Json(GetResponse {
        uuid,
        feature_value: value.map(|v| FeatureValue {
            fqn: fqn.clone(),
            entity_id: entity_id.clone(),
            value: ValueBody::from(&v),
        }),
        metadata: (*fd).clone(),
    }))
}

/// `POST /features/:fqn/:entity`
///
/// ## Request
/// ```json
/// { "uuid": "…", "value": 3, "timestamp": "2024-05-01T10:00:00Z", "op": "incr" }
/// ```
pub async fn write_feature(
    State(state): State<AppState>,
    Path((fqn, entity_id)): Path<(String, String)>,
    Json(request): Json<WriteRequest>,
) -> Result<Json<WriteResponse>> {
    let uuid = request_uuid(request.uuid);
    let op: WriteOp = request.op.parse()?;
    let engine = state.engine();
    let fd = engine.metadata(&fqn)?;
    let payload = write_payload(op, &fd, &request.value)?;
    let ts = request.timestamp.unwrap_or_else(|| engine.clock().now());

    engine
        .write(state.request_context(), op, &fqn, &entity_id, payload, ts)
        .await?;

    tracing::debug!(%uuid, fqn = %fqn, entity_id = %entity_id, op = %op, "write");
    Ok(Json(WriteResponse { uuid }))
}

/// Reads the request value as the payload `op` expects for `fd`
///
/// Appending a single item to a list feature accepts the bare scalar.
fn write_payload(op: WriteOp, fd: &FeatureDescriptor, value: &serde_json::Value) -> Result<Payload> {
    if value.is_null() {
        return Err(AppError::BadRequest("value is required".to_string()));
    }
    if op == WriteOp::Append && fd.primitive.is_list() && !value.is_array() {
        let wrapped = serde_json::Value::Array(vec![value.clone()]);
        return Ok(Payload::from_json(&wrapped, fd.primitive)?);
    }
    Ok(Payload::from_json(value, fd.primitive)?)
}

/// `POST /admin/features`
///
/// Binds into the engine first, then into the historian. A historian
/// failure on a new binding rolls the engine binding back.
pub async fn bind_feature(
    State(state): State<AppState>,
    Json(fd): Json<FeatureDescriptor>,
) -> Result<(StatusCode, Json<FeatureDescriptor>)> {
    let engine = state.engine();
    let existed = engine.has(&fd.fqn);
    engine.bind(fd.clone())?;
    let bound = engine.metadata(&fd.fqn)?;

    if let Some(historian) = state.historian() {
        if let Err(e) = historian.bind(bound.clone()).await {
            if !existed {
                if let Err(rollback) = engine.unbind(&bound.fqn) {
                    tracing::error!(fqn = %bound.fqn, error = %rollback, "failed to roll back binding");
                }
            }
            return Err(e.into());
        }
    }

    tracing::info!(fqn = %bound.fqn, builder = %bound.builder, "feature bound");
    Ok((StatusCode::CREATED, Json(bound)))
}

/// `DELETE /admin/features/:fqn`
pub async fn unbind_feature(State(state): State<AppState>, Path(fqn): Path<String>) -> Result<StatusCode> {
    let engine = state.engine();
    let fd = engine.metadata(&fqn)?;
    engine.unbind(&fd.fqn)?;
    if let Some(historian) = state.historian() {
        historian.unbind(&fd.fqn);
    }

    tracing::info!(fqn = %fd.fqn, "feature unbound");
    Ok(StatusCode::NO_CONTENT)
}
