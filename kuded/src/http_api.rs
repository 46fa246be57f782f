//! HTTP API for object management and health endpoints.
//!
//! Provides:
//! - `/health` - Basic daemon health check
//! - `/ready` - Readiness probe (initial sync finished)
//! - `/apis/{kind}[/{namespace}/{name}]` - Object CRUD against the store
//! - `/events` - Recent reconciliation events

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use kude_common::{
    Bundle, BundleStatus, ListParams, ObjectKey, ObjectStore, Resource, RunRecord, StoreError,
    TrackedRepository, TrackedRepositoryStatus,
};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::events::EventRecorder;

const DEFAULT_EVENT_LIMIT: usize = 100;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub store: Arc<dyn ObjectStore>,
    pub recorder: Arc<EventRecorder>,
    /// Set once every existing object has been enqueued.
    pub ready: Arc<AtomicBool>,
    pub version: &'static str,
    pub started_at: Instant,
    pub pid: u32,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unknown resource kind '{0}'")]
    UnknownKind(String),

    #[error("{0} objects are read-only")]
    ReadOnly(&'static str),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::UnknownKind(_) => StatusCode::NOT_FOUND,
            Self::ReadOnly(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Self::Store(StoreError::AlreadyExists { .. } | StoreError::Conflict { .. }) => {
                StatusCode::CONFLICT
            }
            Self::Store(StoreError::Invalid { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Store(StoreError::Serialization(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Resource kinds addressable in URL paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApiKind {
    TrackedRepositories,
    Bundles,
    RunRecords,
}

impl ApiKind {
    fn parse(segment: &str) -> Result<Self, ApiError> {
        match segment {
            "trackedrepositories" => Ok(Self::TrackedRepositories),
            "bundles" => Ok(Self::Bundles),
            "runrecords" => Ok(Self::RunRecords),
            other => Err(ApiError::UnknownKind(other.to_string())),
        }
    }

    fn kind(self) -> &'static str {
        match self {
            Self::TrackedRepositories => TrackedRepository::KIND,
            Self::Bundles => Bundle::KIND,
            Self::RunRecords => RunRecord::KIND,
        }
    }

    /// Deserializes and validates a client-supplied object, dropping any
    /// status it carries.
    fn admit(self, body: Value) -> Result<Value, ApiError> {
        let admitted = match self {
            Self::TrackedRepositories => {
                let mut repo: TrackedRepository =
                    serde_json::from_value(body).map_err(invalid)?;
                repo.spec.validate().map_err(invalid)?;
                repo.status = TrackedRepositoryStatus::default();
                serde_json::to_value(repo)
            }
            Self::Bundles => {
                let mut bundle: Bundle = serde_json::from_value(body).map_err(invalid)?;
                bundle.spec.validate().map_err(invalid)?;
                bundle.status = BundleStatus::default();
                serde_json::to_value(bundle)
            }
            Self::RunRecords => return Err(ApiError::ReadOnly(RunRecord::KIND)),
        };
        admitted.map_err(|e| ApiError::Store(e.into()))
    }
}

fn invalid(err: impl std::fmt::Display) -> ApiError {
    ApiError::Invalid(err.to_string())
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

/// Create the HTTP router.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/events", get(events_handler))
        .route("/apis/{kind}", get(list_handler).post(create_handler))
        .route(
            "/apis/{kind}/{namespace}/{name}",
            get(get_handler).put(replace_handler).delete(delete_handler),
        )
        .with_state(Arc::new(state))
}

/// Handler for `/health` - Basic daemon health check.
async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": state.version,
        "pid": state.pid,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "store": state.store.backend_name(),
    }))
}

/// Handler for `/ready` - 503 until the initial sync has been queued.
async fn ready_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    if state.ready.load(Ordering::Acquire) {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "reason": "initial_sync_pending" })),
        )
    }
}

async fn events_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    Json(state.recorder.recent(query.limit.unwrap_or(DEFAULT_EVENT_LIMIT)))
}

async fn list_handler(
    State(state): State<Arc<HttpState>>,
    Path(kind): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let kind = ApiKind::parse(&kind)?;
    let params = ListParams {
        namespace: query.namespace,
        ..ListParams::default()
    };
    Ok(Json(state.store.list(kind.kind(), &params).await?))
}

async fn create_handler(
    State(state): State<Arc<HttpState>>,
    Path(kind): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let kind = ApiKind::parse(&kind)?;
    let object = kind.admit(body)?;
    let created = state.store.create(kind.kind(), object).await?;
    tracing::info!(kind = kind.kind(), key = %key_of(&created), "object created via API");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_handler(
    State(state): State<Arc<HttpState>>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
) -> Result<Json<Value>, ApiError> {
    let kind = ApiKind::parse(&kind)?;
    let key = ObjectKey::new(namespace, name);
    match state.store.get(kind.kind(), &key).await? {
        Some(object) => Ok(Json(object)),
        None => Err(StoreError::not_found(kind.kind(), key).into()),
    }
}

async fn replace_handler(
    State(state): State<Arc<HttpState>>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
    Json(mut body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let kind = ApiKind::parse(&kind)?;
    let metadata = body
        .get_mut("metadata")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| ApiError::Invalid("metadata is required".to_string()))?;
    for (field, expected) in [("namespace", &namespace), ("name", &name)] {
        match metadata.get(field).and_then(Value::as_str) {
            None | Some("") => {
                metadata.insert(field.to_string(), Value::String(expected.clone()));
            }
            Some(actual) if actual != expected => {
                return Err(ApiError::Invalid(format!(
                    "metadata.{field} '{actual}' does not match path '{expected}'"
                )));
            }
            Some(_) => {}
        }
    }
    let object = kind.admit(body)?;
    Ok(Json(state.store.replace(kind.kind(), object).await?))
}

async fn delete_handler(
    State(state): State<Arc<HttpState>>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let kind = ApiKind::parse(&kind)?;
    let key = ObjectKey::new(namespace, name);
    state.store.delete(kind.kind(), &key).await?;
    // Finalizers keep the object around until its reconciler drains them.
    if state.store.get(kind.kind(), &key).await?.is_some() {
        Ok((StatusCode::ACCEPTED, Json(json!({ "status": "deleting" }))))
    } else {
        Ok((StatusCode::OK, Json(json!({ "status": "deleted" }))))
    }
}

fn key_of(object: &Value) -> String {
    let meta = &object["metadata"];
    format!(
        "{}/{}",
        meta["namespace"].as_str().unwrap_or_default(),
        meta["name"].as_str().unwrap_or_default()
    )
}

/// Binds `addr` and serves the router until `shutdown` is cancelled.
pub async fn start_server(
    addr: SocketAddr,
    state: HttpState,
    shutdown: CancellationToken,
) -> std::io::Result<tokio::task::JoinHandle<std::io::Result<()>>> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    Ok(tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }))
}
