//! Node and topology management
//!
//! ## Overview
//! - Node lifecycle: create, list, MTU, token rotation, delete
//! - Route lists with CIDR validation
//! - Lighthouse and relay assignment
//! - Topology views with deterministic ordering
//!
//! Every mutation here bumps the cluster's `config_version` inside the
//! store transaction that performs it.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use uuid::Uuid;

use crate::api::{AppState, ok};
use crate::auth::{AdminIdentity, CLUSTER_TOKEN_HEADER, ClusterIdentity, NodeIdentity};
use crate::error::{Result, ServiceError};
use crate::replicas::REPLICA_STALENESS;
use crate::token;
use crate::types::{
    ClusterRoutes, ControlPlaneLighthouse, CreateNodeRequest, CreateNodeResponse, DEFAULT_MTU,
    LighthouseEntry, MTU_MAX, MTU_MIN, NodePage, NodeRoutes, NodeSummary, PageQuery, RelayEntry,
    ReplaceRoutesRequest, RotatedTokenResponse, SetLighthouseRequest, SetRelayRequest, Topology,
    UpdateMtuRequest,
};

/// Validate one CIDR text: address, slash, prefix length within the
/// family's bounds.
fn validate_cidr(text: &str) -> Result<()> {
    let bad = || ServiceError::BadRequest(format!("invalid CIDR: {text}"));
    let (addr, prefix) = text.split_once('/').ok_or_else(bad)?;
    let addr: std::net::IpAddr = addr.parse().map_err(|_| bad())?;
    let prefix: u8 = prefix.parse().map_err(|_| bad())?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(bad());
    }
    Ok(())
}

fn validate_mtu(mtu: u32) -> Result<()> {
    if !(MTU_MIN..=MTU_MAX).contains(&mtu) {
        return Err(ServiceError::BadRequest(format!(
            "mtu must be within [{MTU_MIN}, {MTU_MAX}], got {mtu}"
        )));
    }
    Ok(())
}

/// `POST /api/v1/nodes`: create a node and return its token once.
///
/// The response echoes the cluster token when the request presented a valid
/// one alongside the admin node token; plaintext cluster tokens are never
/// recoverable from the store.
pub async fn create_node(
    State(state): State<AppState>,
    AdminIdentity(admin): AdminIdentity,
    headers: HeaderMap,
    Json(req): Json<CreateNodeRequest>,
) -> Result<impl IntoResponse> {
    if req.name.trim().is_empty() {
        return Err(ServiceError::BadRequest("node name must not be empty".into()));
    }
    let mtu = req.mtu.unwrap_or(DEFAULT_MTU);
    validate_mtu(mtu)?;

    let node_token = token::generate();
    let digest = token::hash(&node_token, &state.token_key);
    let node = state.store.create_node(
        admin.tenant_id,
        admin.cluster_id,
        req.name.trim(),
        &digest,
        mtu,
        req.is_admin,
    )?;

    let cluster = state.store.get_cluster(admin.cluster_id)?;
    let cluster_token = headers
        .get(CLUSTER_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|presented| {
            token::validate(presented, &state.token_key, &cluster.cluster_token_hash)
        })
        .map(str::to_string);

    tracing::info!(
        node_id = %node.id,
        cluster_id = %admin.cluster_id,
        name = %node.name,
        "node created"
    );

    Ok((
        StatusCode::CREATED,
        ok(CreateNodeResponse {
            node_id: node.id,
            node_token,
            cluster_token: cluster_token.unwrap_or_default(),
            created_at: node.created_at,
        }),
    ))
}

/// `GET /api/v1/nodes`: paginated summaries.
pub async fn list_nodes(
    State(state): State<AppState>,
    AdminIdentity(admin): AdminIdentity,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    let (page, page_size) = query.resolve();
    let (nodes, total) = state.store.list_nodes(admin.cluster_id, page, page_size)?;
    Ok(ok(NodePage {
        nodes: nodes.iter().map(NodeSummary::from).collect(),
        page,
        page_size,
        total,
    }))
}

/// `PATCH /api/v1/nodes/{id}/mtu`
pub async fn update_mtu(
    State(state): State<AppState>,
    AdminIdentity(admin): AdminIdentity,
    Path(node_id): Path<Uuid>,
    Json(req): Json<UpdateMtuRequest>,
) -> Result<impl IntoResponse> {
    validate_mtu(req.mtu)?;
    let version = state
        .store
        .update_node_mtu(admin.cluster_id, node_id, req.mtu)?;
    tracing::info!(node_id = %node_id, mtu = req.mtu, version, "mtu updated");
    Ok(ok(serde_json::json!({ "node_id": node_id, "mtu": req.mtu })))
}

/// `POST /api/v1/nodes/{id}/token`: rotate, returning the plaintext once.
pub async fn rotate_node_token(
    State(state): State<AppState>,
    AdminIdentity(admin): AdminIdentity,
    Path(node_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let new_token = token::generate();
    let digest = token::hash(&new_token, &state.token_key);
    let version = state
        .store
        .rotate_node_token(admin.cluster_id, node_id, &digest)?;
    tracing::info!(node_id = %node_id, version, "node token rotated");
    Ok(ok(RotatedTokenResponse { token: new_token }))
}

/// `DELETE /api/v1/nodes/{id}`
pub async fn delete_node(
    State(state): State<AppState>,
    AdminIdentity(admin): AdminIdentity,
    Path(node_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let version = state.store.delete_node(admin.cluster_id, node_id)?;
    tracing::info!(node_id = %node_id, version, "node deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /api/v1/routes`: replace the caller's route list.
pub async fn replace_routes(
    State(state): State<AppState>,
    identity: NodeIdentity,
    Json(req): Json<ReplaceRoutesRequest>,
) -> Result<impl IntoResponse> {
    for route in &req.routes {
        validate_cidr(route)?;
    }
    let version = state
        .store
        .replace_routes(identity.cluster_id, identity.node_id, &req.routes)?;
    tracing::info!(
        node_id = %identity.node_id,
        routes = req.routes.len(),
        version,
        "routes replaced"
    );
    Ok(ok(NodeRoutes {
        node_id: identity.node_id,
        routes: req.routes,
    }))
}

/// `GET /api/v1/routes`: the caller's own routes.
pub async fn read_own_routes(
    State(state): State<AppState>,
    identity: NodeIdentity,
) -> Result<impl IntoResponse> {
    let node = state.store.get_node(identity.cluster_id, identity.node_id)?;
    Ok(ok(NodeRoutes {
        node_id: node.id,
        routes: node.routes,
    }))
}

/// `GET /api/v1/routes/cluster`: all routes, grouped by node in creation
/// order.
pub async fn read_cluster_routes(
    State(state): State<AppState>,
    identity: NodeIdentity,
) -> Result<impl IntoResponse> {
    let nodes = state.store.nodes_in_creation_order(identity.cluster_id)?;
    let routes = nodes
        .into_iter()
        .map(|n| NodeRoutes {
            node_id: n.id,
            routes: n.routes,
        })
        .collect();
    Ok(ok(ClusterRoutes { routes }))
}

/// `GET /api/v1/topology`
///
/// Lighthouses and relays come out ordered by node name, control-plane
/// lighthouses by address, so every replica renders identical bytes.
pub async fn read_topology(
    State(state): State<AppState>,
    identity: ClusterIdentity,
) -> Result<impl IntoResponse> {
    let cluster = state.store.get_cluster(identity.cluster_id)?;
    let nodes = state.store.nodes_by_name(identity.cluster_id)?;

    let lighthouses = nodes
        .iter()
        .filter(|n| n.is_lighthouse)
        .map(|n| LighthouseEntry {
            node_id: n.id,
            name: n.name.clone(),
            public_ip: n.lighthouse_public_ip.clone().unwrap_or_default(),
            port: n.lighthouse_port.unwrap_or(cluster.lighthouse_port),
        })
        .collect();

    let relays = nodes
        .iter()
        .filter(|n| n.is_relay)
        .map(|n| RelayEntry {
            node_id: n.id,
            name: n.name.clone(),
        })
        .collect();

    let mut control_plane_lighthouses = Vec::new();
    if cluster.provide_lighthouse {
        let now = Utc::now();
        for replica in state.store.list_replicas()? {
            let age = now.signed_duration_since(replica.last_seen_at);
            if age.to_std().map(|d| d <= REPLICA_STALENESS).unwrap_or(true) {
                control_plane_lighthouses.push(ControlPlaneLighthouse {
                    instance_id: replica.id,
                    address: replica.address,
                    port: cluster.lighthouse_port,
                });
            }
        }
        control_plane_lighthouses.sort_by(|a, b| a.address.cmp(&b.address));
    }

    Ok(ok(Topology {
        lighthouses,
        relays,
        control_plane_lighthouses,
    }))
}

/// `POST /api/v1/topology/lighthouse`
pub async fn set_lighthouse(
    State(state): State<AppState>,
    identity: ClusterIdentity,
    Json(req): Json<SetLighthouseRequest>,
) -> Result<impl IntoResponse> {
    let _: std::net::IpAddr = req
        .public_ip
        .parse()
        .map_err(|_| ServiceError::BadRequest(format!("invalid public IP: {}", req.public_ip)))?;
    if req.port == 0 {
        return Err(ServiceError::BadRequest("lighthouse port must be non-zero".into()));
    }
    let version =
        state
            .store
            .set_lighthouse(identity.cluster_id, req.node_id, &req.public_ip, req.port)?;
    tracing::info!(node_id = %req.node_id, version, "lighthouse assigned");
    Ok(ok(serde_json::json!({ "node_id": req.node_id })))
}

/// `DELETE /api/v1/topology/lighthouse/{id}`
pub async fn clear_lighthouse(
    State(state): State<AppState>,
    identity: ClusterIdentity,
    Path(node_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let version = state.store.clear_lighthouse(identity.cluster_id, node_id)?;
    tracing::info!(node_id = %node_id, version, "lighthouse cleared");
    Ok(ok(serde_json::json!({ "node_id": node_id })))
}

/// `POST /api/v1/topology/relay`
pub async fn set_relay(
    State(state): State<AppState>,
    identity: ClusterIdentity,
    Json(req): Json<SetRelayRequest>,
) -> Result<impl IntoResponse> {
    let version = state.store.set_relay(identity.cluster_id, req.node_id, true)?;
    tracing::info!(node_id = %req.node_id, version, "relay assigned");
    Ok(ok(serde_json::json!({ "node_id": req.node_id })))
}

/// `DELETE /api/v1/topology/relay/{id}`
pub async fn clear_relay(
    State(state): State<AppState>,
    identity: ClusterIdentity,
    Path(node_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let version = state.store.set_relay(identity.cluster_id, node_id, false)?;
    tracing::info!(node_id = %node_id, version, "relay cleared");
    Ok(ok(serde_json::json!({ "node_id": node_id })))
}

/// `POST /api/v1/tokens/cluster/rotate`: mint and return the new cluster
/// token once; the old one stops authenticating at commit.
pub async fn rotate_cluster_token(
    State(state): State<AppState>,
    identity: ClusterIdentity,
) -> Result<impl IntoResponse> {
    let new_token = token::generate();
    let digest = token::hash(&new_token, &state.token_key);
    let version = state.store.rotate_cluster_token(identity.cluster_id, &digest)?;
    tracing::info!(cluster_id = %identity.cluster_id, version, "cluster token rotated");
    Ok(ok(RotatedTokenResponse { token: new_token }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_validation() {
        assert!(validate_cidr("10.0.0.0/24").is_ok());
        assert!(validate_cidr("192.168.1.0/32").is_ok());
        assert!(validate_cidr("fd00::/8").is_ok());
        assert!(validate_cidr("not-a-cidr").is_err());
        assert!(validate_cidr("10.0.0.0/33").is_err());
        assert!(validate_cidr("fd00::/129").is_err());
        assert!(validate_cidr("10.0.0.0").is_err());
    }

    #[test]
    fn mtu_bounds() {
        assert!(validate_mtu(1280).is_ok());
        assert!(validate_mtu(9000).is_ok());
        assert!(validate_mtu(1279).is_err());
        assert!(validate_mtu(9001).is_err());
    }
}
