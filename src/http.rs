/// HTTP API for the synchronization engine.
///
/// Every scoring endpoint is bound to one namespace. An upstream auth layer
/// resolves it and stores a [`Namespace`] in the request extensions; when no
/// such layer is installed the `X-Namespace` header is used instead. A
/// request with neither is rejected with `401`.
///
/// # Example
///
/// ```ignore
/// use scorecard_sync::http::HttpServer;
/// use scorecard_sync::SyncEngine;
///
/// let engine = SyncEngine::start_in_memory().await?;
/// let server = HttpServer::new(engine);
/// server.bind("0.0.0.0:8080").await?;
/// ```
///
/// # API Endpoints
///
/// ## Sync
/// - `POST /v1/mutate` - Apply a mutation batch
/// - `GET /v1/sync?since=V&wait=S` - Pull changes after `V`, long-polling up to `S` seconds
/// - `GET /v1/events` - Server-sent stream of committed versions
///
/// ## Reads
/// - `GET /v1/entities/:type` - All entities of a type
/// - `GET /v1/entities/:type/:id` - One entity
///
/// ## Status
/// - `GET /v1/status` - Store and subscriber counts
/// - `GET /healthz` - Liveness probe
use crate::core::SyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::types::{Entity, MutateRequest, MutationOutcome, SyncResponse};
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequestParts, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Instant;
use tower::ServiceBuilder;

/// Header consulted when no auth layer has bound the request.
pub const NAMESPACE_HEADER: &str = "x-namespace";

/// HTTP server for the synchronization engine.
pub struct HttpServer {
    engine: SyncEngine,
}

impl HttpServer {
    /// Create a new HTTP server around `engine`.
    pub fn new(engine: SyncEngine) -> Self {
        Self { engine }
    }

    /// The router this server would serve.
    pub fn router(&self) -> Router {
        router(self.engine.clone())
    }

    /// Start the HTTP server on the given address and run until Ctrl-C.
    ///
    /// # Example
    ///
    /// ```ignore
    /// server.bind("0.0.0.0:8080").await?;
    /// ```
    pub async fn bind(self, addr: &str) -> SyncResult<()> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| SyncError::Config(format!("Invalid address '{}': {}", addr, e)))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| SyncError::StorageError(format!("Failed to bind {}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until Ctrl-C.
    pub async fn serve(self, listener: tokio::net::TcpListener) -> SyncResult<()> {
        if let Ok(local) = listener.local_addr() {
            tracing::info!("Scorecard sync listening on http://{}", local);
        }
        let app = self.router();

        // Event streams never finish on their own, so shutdown does not wait
        // for open connections to drain.
        tokio::select! {
            result = axum::serve(listener, app) => {
                result.map_err(|e| SyncError::StorageError(format!("Server error: {}", e)))
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
        }
    }
}

/// Create the router with all routes and request logging.
pub fn router(engine: SyncEngine) -> Router {
    Router::new()
        // Sync
        .route("/v1/mutate", post(handle_mutate))
        .route("/v1/sync", get(handle_sync))
        .route("/v1/events", get(handle_events))
        // Reads
        .route("/v1/entities/:type", get(handle_list_entities))
        .route("/v1/entities/:type/:id", get(handle_get_entity))
        // Status
        .route("/v1/status", get(handle_status))
        .route("/healthz", get(handle_health))
        .layer(ServiceBuilder::new().layer(middleware::from_fn(log_requests)))
        .with_state(engine)
}

/// Namespace a request is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Namespace
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(namespace) = parts.extensions.get::<Namespace>() {
            return Ok(namespace.clone());
        }
        parts
            .headers
            .get(NAMESPACE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Namespace(value.to_string()))
            .ok_or_else(|| SyncError::MissingNamespace.into())
    }
}

/// JSON body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// An error that renders as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::MissingNamespace => {
                Self::new(StatusCode::UNAUTHORIZED, "unauthorized", err.to_string())
            }
            err if err.is_client_error() => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_request", err.to_string())
            }
            err => {
                tracing::error!("Request failed: {}", err);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal server error",
                )
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Query string of `GET /v1/sync`.
#[derive(Debug, Default, Deserialize)]
struct SyncParams {
    since: Option<i64>,
    /// Seconds; clamped to the configured maximum
    wait: Option<i64>,
}

/// Response for `GET /v1/entities/:type`.
#[derive(Debug, Serialize)]
struct EntitiesResponse {
    #[serde(rename = "type")]
    entity_type: String,
    entities: Vec<Entity>,
}

/// Response for `GET /v1/status`.
#[derive(Debug, Serialize)]
struct StatusResponse {
    version: i64,
    entity_count: usize,
    changelog_count: usize,
    namespace_count: usize,
    subscribers: usize,
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    tracing::info!(
        "{} {} {} {}ms",
        method,
        path,
        response.status().as_u16(),
        start.elapsed().as_millis()
    );
    response
}

// Handler implementations

async fn handle_mutate(
    State(engine): State<SyncEngine>,
    Namespace(namespace): Namespace,
    payload: Result<Json<MutateRequest>, JsonRejection>,
) -> Result<Json<MutationOutcome>, ApiError> {
    let Json(request) = payload?;
    if request.client_id.trim().is_empty() {
        return Err(SyncError::InvalidRequest("missing client_id".to_string()).into());
    }

    let outcome = engine
        .mutate(&namespace, &request.client_id, request.mutations)
        .await?;
    Ok(Json(outcome))
}

async fn handle_sync(
    State(engine): State<SyncEngine>,
    Namespace(namespace): Namespace,
    params: Result<Query<SyncParams>, QueryRejection>,
) -> Result<Json<SyncResponse>, ApiError> {
    let Query(params) = params?;
    let since = params.since.unwrap_or(0);
    let wait = engine.config().clamp_wait(params.wait.unwrap_or(0));

    let response = engine.sync(&namespace, since, wait).await?;
    Ok(Json(response))
}

async fn handle_events(
    State(engine): State<SyncEngine>,
    Namespace(namespace): Namespace,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let greeting = stream::once(async { Ok::<_, Infallible>(Event::default().comment("connected")) });
    let versions = engine
        .events(&namespace)
        .map(|version| Ok::<_, Infallible>(Event::default().data(version.to_string())));

    Sse::new(greeting.chain(versions)).keep_alive(KeepAlive::default())
}

async fn handle_list_entities(
    State(engine): State<SyncEngine>,
    Namespace(namespace): Namespace,
    path: Result<Path<String>, PathRejection>,
) -> Result<Json<EntitiesResponse>, ApiError> {
    let Path(entity_type) = path?;
    let entities = engine.list_entities(&namespace, &entity_type).await?;
    Ok(Json(EntitiesResponse {
        entity_type,
        entities,
    }))
}

async fn handle_get_entity(
    State(engine): State<SyncEngine>,
    Namespace(namespace): Namespace,
    path: Result<Path<(String, String)>, PathRejection>,
) -> Result<Json<Entity>, ApiError> {
    let Path((entity_type, id)) = path?;
    match engine.get_entity(&namespace, &entity_type, &id).await? {
        Some(entity) => Ok(Json(entity)),
        None => Err(ApiError::not_found(format!("{}/{} not found", entity_type, id))),
    }
}

async fn handle_status(State(engine): State<SyncEngine>) -> Result<Json<StatusResponse>, ApiError> {
    let stats = engine.stats().await?;
    Ok(Json(StatusResponse {
        version: stats.store.current_version,
        entity_count: stats.store.entity_count,
        changelog_count: stats.store.changelog_count,
        namespace_count: stats.store.namespace_count,
        subscribers: stats.subscribers,
    }))
}

async fn handle_health() -> &'static str {
    "OK"
}
