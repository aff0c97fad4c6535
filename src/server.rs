//! Axum router construction.
//!
//! The [`app`] function wires the peer protocol, the membership routes and
//! the client data API to their handlers and returns a ready-to-serve
//! [`axum::Router`].  Everything under `/api/v1/cluster` sits behind the
//! internal token check when a token is configured.

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::debug;
use utoipa::OpenApi;

use crate::cluster::message::{Entry, EntryBatch};
use crate::cluster::messenger::{RegisterBody, INTERNAL_TOKEN_HEADER};
use crate::cluster::state::NodeStatus;
use crate::errors::{generate_request_id, ClusterError};
use crate::handlers;
use crate::handlers::cluster::{
    LeaderResponse, NodesResponse, RegisterQuery, RemoveQuery, StartQuery,
};
use crate::handlers::data::{ValueResponse, WriteResponse};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the kvraft HTTP API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "kvraft API",
        version = "0.1.0",
        description = "Replicated key/value front end"
    ),
    paths(
        health_check,
        // Membership
        crate::handlers::cluster::register,
        crate::handlers::cluster::start,
        crate::handlers::cluster::remove_node,
        crate::handlers::cluster::list_nodes,
        crate::handlers::cluster::leader,
        crate::handlers::cluster::status,
        // Replication and election
        crate::handlers::cluster::forwarded_write,
        crate::handlers::cluster::append_entries,
        crate::handlers::cluster::catch_up,
        crate::handlers::cluster::update_entry,
        crate::handlers::cluster::commit,
        crate::handlers::cluster::heartbeat,
        crate::handlers::cluster::election,
        // Data
        crate::handlers::data::put_data,
        crate::handlers::data::get_data,
    ),
    components(schemas(
        Entry,
        EntryBatch,
        RegisterBody,
        NodeStatus,
        NodesResponse,
        LeaderResponse,
        WriteResponse,
        ValueResponse,
    )),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Membership", description = "Node registration, start and status"),
        (name = "Replication", description = "Peer-to-peer log replication"),
        (name = "Election", description = "Leader election"),
        (name = "Data", description = "Client reads and writes"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with every route.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    let peer_routes = Router::new()
        .route(
            "/api/v1/cluster",
            post(handle_register)
                .put(handle_start)
                .get(handle_nodes)
                .delete(handle_remove),
        )
        .route("/api/v1/cluster/leader", get(handle_leader))
        .route("/api/v1/cluster/status", get(handle_status))
        .route("/api/v1/cluster/wal", post(handle_forwarded_write))
        .route("/api/v1/cluster/wal/leader", post(handle_append_entries))
        .route(
            "/api/v1/cluster/update",
            get(handle_catch_up).post(handle_update_entry),
        )
        .route("/api/v1/cluster/commit/:index", get(handle_commit))
        .route("/api/v1/cluster/heartbeat", get(handle_heartbeat))
        .route("/api/v1/cluster/election", get(handle_election))
        // route_layer: unmatched paths still 404 instead of 401.
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            internal_token_middleware,
        ));

    let mut router = Router::new()
        .route("/api/v1/data", post(handle_put_data))
        .route("/api/v1/data/:key", get(handle_get_data))
        .route("/openapi.json", get(openapi_json))
        .merge(peer_routes);
    if state.config.observability.health_check {
        router = router.route("/health", get(health_check));
    }
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(common_headers_middleware))
        // metrics_middleware is outer (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
}

// -- Common headers middleware -----------------------------------------------

/// Adds common response headers to every response:
/// - `x-request-id`: 16-character uppercase hex string
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `kvraft`
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Error responses already carry one.
    if !headers.contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("kvraft"));

    response
}

// -- Internal token middleware -----------------------------------------------

/// Rejects peer requests whose `x-internal-token` does not match the
/// configured token.  An empty token disables the check.
async fn internal_token_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ClusterError> {
    let expected = state.config.cluster.internal_token.as_bytes();
    if expected.is_empty() {
        return Ok(next.run(req).await);
    }
    let presented = req
        .headers()
        .get(INTERNAL_TOKEN_HEADER)
        .map(|v| v.as_bytes())
        .unwrap_or_default();
    if !bool::from(presented.ct_eq(expected)) {
        debug!(path = %req.uri().path(), "internal token rejected");
        return Err(ClusterError::Unauthorized);
    }
    Ok(next.run(req).await)
}

// -- Health check and documentation ------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// `GET /openapi.json`
async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

// -- Query parameter helper ---------------------------------------------------

fn query<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, ClusterError> {
    query
        .map(|Query(q)| q)
        .map_err(|rejection| ClusterError::invalid(rejection.body_text()))
}

// -- Membership dispatch ------------------------------------------------------

/// `POST /api/v1/cluster` -- registration
async fn handle_register(
    State(state): State<Arc<AppState>>,
    params: Result<Query<RegisterQuery>, QueryRejection>,
    body: Bytes,
) -> Result<Response, ClusterError> {
    handlers::cluster::register(state, query(params)?, &body).await
}

/// `PUT /api/v1/cluster` -- start
async fn handle_start(
    State(state): State<Arc<AppState>>,
    params: Result<Query<StartQuery>, QueryRejection>,
) -> Result<Response, ClusterError> {
    handlers::cluster::start(state, query(params)?).await
}

/// `DELETE /api/v1/cluster` -- forget a peer
async fn handle_remove(
    State(state): State<Arc<AppState>>,
    params: Result<Query<RemoveQuery>, QueryRejection>,
) -> Result<Response, ClusterError> {
    handlers::cluster::remove_node(state, query(params)?).await
}

/// `GET /api/v1/cluster` -- registered nodes
async fn handle_nodes(State(state): State<Arc<AppState>>) -> Result<Response, ClusterError> {
    handlers::cluster::list_nodes(state).await
}

/// `GET /api/v1/cluster/leader`
async fn handle_leader(State(state): State<Arc<AppState>>) -> Result<Response, ClusterError> {
    handlers::cluster::leader(state).await
}

/// `GET /api/v1/cluster/status`
async fn handle_status(State(state): State<Arc<AppState>>) -> Result<Response, ClusterError> {
    handlers::cluster::status(state).await
}

// -- Replication dispatch -----------------------------------------------------

/// `POST /api/v1/cluster/wal` -- write forwarded by a follower
async fn handle_forwarded_write(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ClusterError> {
    handlers::cluster::forwarded_write(state, &body).await
}

/// `POST /api/v1/cluster/wal/leader` -- AppendEntries
async fn handle_append_entries(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ClusterError> {
    handlers::cluster::append_entries(state, &headers, &body).await
}

/// `GET /api/v1/cluster/update` -- catch-up request
async fn handle_catch_up(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ClusterError> {
    handlers::cluster::catch_up(state, &headers).await
}

/// `POST /api/v1/cluster/update` -- catch-up entry
async fn handle_update_entry(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ClusterError> {
    handlers::cluster::update_entry(state, &headers, &body).await
}

/// `GET /api/v1/cluster/commit/:index`
async fn handle_commit(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ClusterError> {
    let index = index.parse().map_err(|_| {
        ClusterError::invalid(format!(
            "commit index must be an unsigned integer, got {index:?}"
        ))
    })?;
    handlers::cluster::commit(state, index, &headers).await
}

/// `GET /api/v1/cluster/heartbeat`
async fn handle_heartbeat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ClusterError> {
    handlers::cluster::heartbeat(state, &headers).await
}

/// `GET /api/v1/cluster/election` -- vote request
async fn handle_election(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ClusterError> {
    handlers::cluster::election(state, &headers).await
}

// -- Data dispatch ------------------------------------------------------------

/// `POST /api/v1/data`
async fn handle_put_data(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ClusterError> {
    handlers::data::put_data(state, &body).await
}

/// `GET /api/v1/data/:key`
async fn handle_get_data(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Response, ClusterError> {
    handlers::data::get_data(state, &key).await
}
