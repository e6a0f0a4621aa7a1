//! HTTP front end
//!
//! ## Overview
//! - Router assembly and middleware ordering
//! - Correlation ids and the stable response envelopes
//! - Write guard rejecting mutations on replica instances
//! - Unauthenticated health and master-check endpoints
//!
//! Middleware runs correlation → trace → write guard; rate limiting, token
//! authentication, and the admin check happen in the extractors declared by
//! each handler. Success bodies are `{data: …}`; failures are
//! `{error, message, request_id}`.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::header::{CONTENT_TYPE, HeaderValue, RETRY_AFTER};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, patch, post, put};
use serde::Serialize;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use crate::bundle::MAX_BUNDLE_BYTES;
use crate::error::ServiceError;
use crate::ratelimit::{Category, RateLimiter};
use crate::replicas::REPLICA_STALENESS;
use crate::store::Store;
use crate::token::TokenKey;
use crate::types::{MasterStatus, ReplicaRole};
use crate::{bundles, nodes, replicas};

/// Correlation header name; accepted inbound, echoed on every response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request deadline. Generous enough for a full-size bundle upload.
const REQUEST_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub token_key: TokenKey,
    pub limiter: Arc<RateLimiter>,
    pub mode: ReplicaRole,
    pub instance_id: Uuid,
    pub public_url: String,
}

/// Correlation id attached to the request extensions by the outermost
/// middleware.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

/// Success envelope.
#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

/// Wrap a payload in the success envelope.
pub fn ok<T: Serialize>(data: T) -> Json<ApiOk<T>> {
    Json(ApiOk { data })
}

/// Error details smuggled through response extensions so the correlation
/// middleware can render the final envelope with the request id.
#[derive(Debug, Clone)]
struct ErrorMeta {
    kind: &'static str,
    message: String,
    master_url: Option<String>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let meta = ErrorMeta {
            kind: self.kind(),
            message: self.to_string(),
            master_url: match &self {
                ServiceError::ReplicaReadOnly { master_url } => master_url.clone(),
                _ => None,
            },
        };

        let mut response = Response::new(Body::empty());
        *response.status_mut() = status;
        if let ServiceError::RateLimitExceeded {
            retry_after: Some(after),
        } = &self
        {
            if let Ok(value) = HeaderValue::from_str(&after.as_secs().max(1).to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response.extensions_mut().insert(meta);
        response
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope<'a> {
    error: &'a str,
    message: &'a str,
    request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    master_url: Option<&'a str>,
}

/// Outermost middleware: assign or propagate the correlation id, echo it on
/// the response, and render the failure envelope for error responses.
async fn correlation(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);
    req.extensions_mut().insert(RequestId(id));

    let mut response = next.run(req).await;

    if let Some(meta) = response.extensions().get::<ErrorMeta>().cloned() {
        let envelope = ErrorEnvelope {
            error: meta.kind,
            message: &meta.message,
            request_id: id.to_string(),
            master_url: meta.master_url.as_deref(),
        };
        let body = serde_json::to_vec(&envelope).unwrap_or_default();
        let (mut parts, _) = response.into_parts();
        parts
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response = Response::from_parts(parts, Body::from(body));
    }

    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Reject mutating methods on a replica instance, pointing the caller at
/// the current master when the registry knows one.
async fn write_guard(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let mutating = matches!(
        *req.method(),
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
    if state.mode == ReplicaRole::Replica && mutating {
        let master_url = state
            .store
            .fresh_master(REPLICA_STALENESS)
            .ok()
            .flatten()
            .map(|r| r.address);
        warn!(
            method = %req.method(),
            path = %req.uri().path(),
            "mutation rejected on replica instance"
        );
        return ServiceError::ReplicaReadOnly { master_url }.into_response();
    }
    next.run(req).await
}

#[derive(Debug, Serialize)]
struct LiveStatus {
    status: &'static str,
}

async fn health_live() -> Json<LiveStatus> {
    Json(LiveStatus { status: "ok" })
}

async fn health_ready(State(state): State<AppState>) -> Response {
    match state.store.ping() {
        Ok(()) => Json(LiveStatus { status: "ok" }).into_response(),
        Err(e) => {
            warn!(error = %e, "readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(LiveStatus { status: "unavailable" }),
            )
                .into_response()
        }
    }
}

async fn health_master(State(state): State<AppState>) -> Result<Json<MasterStatus>, ServiceError> {
    let master = state.store.fresh_master(REPLICA_STALENESS)?;
    Ok(Json(MasterStatus {
        master: state.mode == ReplicaRole::Master,
        master_url: master.map(|r| r.address),
    }))
}

/// Gate the unauthenticated health endpoints by client IP.
async fn health_rate_limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let ip = req
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    if let Err(e) = state.limiter.allow(Category::HealthCheck, &ip).check() {
        return e.into_response();
    }
    next.run(req).await
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/nodes", post(nodes::create_node).get(nodes::list_nodes))
        .route("/nodes/:id/mtu", patch(nodes::update_mtu))
        .route("/nodes/:id/token", post(nodes::rotate_node_token))
        .route("/nodes/:id", delete(nodes::delete_node))
        .route(
            "/routes",
            put(nodes::replace_routes).get(nodes::read_own_routes),
        )
        .route("/routes/cluster", get(nodes::read_cluster_routes))
        .route("/topology", get(nodes::read_topology))
        .route("/topology/lighthouse", post(nodes::set_lighthouse))
        .route("/topology/lighthouse/:id", delete(nodes::clear_lighthouse))
        .route("/topology/relay", post(nodes::set_relay))
        .route("/topology/relay/:id", delete(nodes::clear_relay))
        .route("/tokens/cluster/rotate", post(nodes::rotate_cluster_token))
        .route("/config/version", get(bundles::read_version))
        .route(
            "/config/bundle",
            get(bundles::download_bundle).post(bundles::upload_bundle),
        )
        .route("/replicas", get(replicas::list_replicas))
        .layer(middleware::from_fn_with_state(state.clone(), write_guard))
        .layer(DefaultBodyLimit::max(MAX_BUNDLE_BYTES + 4096));

    let health = Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/health/master", get(health_master))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            health_rate_limit,
        ));

    Router::new()
        .nest("/api/v1", api)
        .merge(health)
        .layer(TimeoutLayer::new(REQUEST_DEADLINE))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(correlation))
        .with_state(state)
}
