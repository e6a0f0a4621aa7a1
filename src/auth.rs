//! Request authentication and authorization
//!
//! ## Overview
//! - Extract and validate `X-Nebula-Node-Token` / `X-Nebula-Cluster-Token`
//! - Look identities up by HMAC digest, never by plaintext
//! - Gate admin-only routes behind a wrapping extractor
//!
//! Every failure surfaces as the same opaque 401 so clients cannot tell
//! which factor failed; the server-side WARN log carries the real reason.
//! Failed attempts feed the per-IP auth-failure bucket; successful ones are
//! gated by the per-identity request bucket.

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use std::net::SocketAddr;
use tracing::warn;
use uuid::Uuid;

use crate::api::AppState;
use crate::error::ServiceError;
use crate::ratelimit::Category;
use crate::token;

/// Header carrying a node secret.
pub const NODE_TOKEN_HEADER: &str = "x-nebula-node-token";
/// Header carrying a cluster secret.
pub const CLUSTER_TOKEN_HEADER: &str = "x-nebula-cluster-token";

/// Best-effort client IP for rate-limit keying. Requests arriving outside a
/// real socket (router unit tests) key under a fixed placeholder.
pub fn client_ip(parts: &Parts) -> String {
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn unauthorized(state: &AppState, parts: &Parts, reason: &str) -> ServiceError {
    let ip = client_ip(parts);
    warn!(
        ip = %ip,
        path = %parts.uri.path(),
        reason,
        "authentication failed"
    );
    // The failure key is the IP until a caller has proven an identity.
    let _ = state.limiter.allow(Category::AuthFailure, &ip);
    ServiceError::UnauthorizedGeneric
}

fn header_token<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

/// Identity attached to a request authenticated by a node token.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub tenant_id: Uuid,
    pub cluster_id: Uuid,
    pub node_id: Uuid,
    pub is_admin: bool,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for NodeIdentity {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let presented = header_token(parts, NODE_TOKEN_HEADER)
            .ok_or_else(|| unauthorized(state, parts, "missing node token header"))?;
        if token::validate_length(presented).is_err() {
            return Err(unauthorized(state, parts, "node token below minimum length"));
        }

        let digest = token::hash(presented, &state.token_key);
        let node = state
            .store
            .find_node_by_token_hash(&digest)
            .map_err(|e| {
                warn!(error = %e, "node lookup failed");
                ServiceError::Internal(e.to_string())
            })?
            .ok_or_else(|| unauthorized(state, parts, "no node matches token digest"))?;

        state
            .limiter
            .allow(Category::Request, &node.id.to_string())
            .check()?;

        Ok(NodeIdentity {
            tenant_id: node.tenant_id,
            cluster_id: node.cluster_id,
            node_id: node.id,
            is_admin: node.is_admin,
        })
    }
}

/// Identity attached to a request authenticated by a cluster token.
#[derive(Debug, Clone)]
pub struct ClusterIdentity {
    pub tenant_id: Uuid,
    pub cluster_id: Uuid,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for ClusterIdentity {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let presented = header_token(parts, CLUSTER_TOKEN_HEADER)
            .ok_or_else(|| unauthorized(state, parts, "missing cluster token header"))?;
        if token::validate_length(presented).is_err() {
            return Err(unauthorized(
                state,
                parts,
                "cluster token below minimum length",
            ));
        }

        let digest = token::hash(presented, &state.token_key);
        let cluster = state
            .store
            .get_cluster_by_token_hash(&digest)
            .map_err(|e| {
                warn!(error = %e, "cluster lookup failed");
                ServiceError::Internal(e.to_string())
            })?
            .ok_or_else(|| unauthorized(state, parts, "no cluster matches token digest"))?;

        state
            .limiter
            .allow(Category::Request, &cluster.id.to_string())
            .check()?;

        Ok(ClusterIdentity {
            tenant_id: cluster.tenant_id,
            cluster_id: cluster.id,
        })
    }
}

/// A `NodeIdentity` that has passed the admin check. Rejection is a 403
/// with the same opaque phrasing as the 401; the log tells them apart.
#[derive(Debug, Clone)]
pub struct AdminIdentity(pub NodeIdentity);

#[axum::async_trait]
impl FromRequestParts<AppState> for AdminIdentity {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let identity = NodeIdentity::from_request_parts(parts, state).await?;
        if !identity.is_admin {
            warn!(
                node_id = %identity.node_id,
                cluster_id = %identity.cluster_id,
                path = %parts.uri.path(),
                "admin-only route rejected for non-admin node"
            );
            return Err(ServiceError::Forbidden);
        }
        Ok(AdminIdentity(identity))
    }
}
