//! Entity and wire types for the control-plane API
//!
//! ## Overview
//! - Store entities: tenants, clusters, nodes, replicas, bundles
//! - Request and response bodies for every endpoint
//! - Topology views with deterministic ordering

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Default MTU assigned to a node when the create request omits one.
pub const DEFAULT_MTU: u32 = 1300;
/// Inclusive MTU bounds accepted by the MTU update operation.
pub const MTU_MIN: u32 = 1280;
pub const MTU_MAX: u32 = 9000;

/// Default and maximum page sizes for node listings.
pub const PAGE_SIZE_DEFAULT: u32 = 50;
pub const PAGE_SIZE_MAX: u32 = 500;

/// A tenant owns clusters; deleting it cascades to everything below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A cluster is one overlay network: the scope of versioned configuration
/// and node membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    /// HMAC digest of the cluster token; the plaintext is returned exactly
    /// once, at creation or rotation.
    #[serde(skip_serializing)]
    pub cluster_token_hash: String,
    /// When true, every control-plane instance runs a lighthouse child for
    /// this cluster.
    pub provide_lighthouse: bool,
    pub lighthouse_port: u16,
    /// Monotonic, bumped inside the same transaction as every externally
    /// visible change.
    pub config_version: i64,
    pub created_at: DateTime<Utc>,
}

/// PKI material carried on the cluster row. Opaque to the control plane;
/// written to disk verbatim by the lighthouse supervisor.
#[derive(Debug, Clone, Default)]
pub struct ClusterPki {
    pub ca_cert: Vec<u8>,
    pub ca_key: Vec<u8>,
    pub crl: Vec<u8>,
    pub host_cert: Vec<u8>,
    pub host_key: Vec<u8>,
}

/// Per-(cluster, instance) record of the configuration version the local
/// lighthouse child is actually running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterState {
    pub cluster_id: Uuid,
    pub instance_id: Uuid,
    pub running_config_version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Declared role of a control-plane instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaRole {
    Master,
    Replica,
}

impl ReplicaRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaRole::Master => "master",
            ReplicaRole::Replica => "replica",
        }
    }
}

impl std::str::FromStr for ReplicaRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(ReplicaRole::Master),
            "replica" => Ok(ReplicaRole::Replica),
            other => Err(format!("unknown replica role: {other}")),
        }
    }
}

/// One control-plane instance as registered in the replica registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replica {
    pub id: Uuid,
    /// URL other peers reach this instance by.
    pub address: String,
    pub role: ReplicaRole,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// A managed overlay node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub cluster_id: Uuid,
    pub name: String,
    pub is_admin: bool,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub mtu: u32,
    /// CIDR texts, preserved in creation order.
    pub routes: Vec<String>,
    pub routes_updated_at: Option<DateTime<Utc>>,
    pub is_lighthouse: bool,
    pub lighthouse_public_ip: Option<String>,
    pub lighthouse_port: Option<u16>,
    pub is_relay: bool,
    pub lighthouse_relay_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Listing view of a node: everything except secrets and route bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: Uuid,
    pub name: String,
    pub is_admin: bool,
    pub mtu: u32,
    pub is_lighthouse: bool,
    pub is_relay: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Node> for NodeSummary {
    fn from(n: &Node) -> Self {
        NodeSummary {
            id: n.id,
            name: n.name.clone(),
            is_admin: n.is_admin,
            mtu: n.mtu,
            is_lighthouse: n.is_lighthouse,
            is_relay: n.is_relay,
            created_at: n.created_at,
        }
    }
}

/// A stored configuration bundle. `data` is the raw gzipped tar.
#[derive(Debug, Clone)]
pub struct BundleRecord {
    pub tenant_id: Uuid,
    pub cluster_id: Uuid,
    pub version: i64,
    pub data: Vec<u8>,
    /// Uploading node; nulled if that node is later deleted.
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

/// Body of `POST /api/v1/nodes`.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct CreateNodeRequest {
    #[builder(setter(into))]
    pub name: String,
    /// Defaults to 1300 when omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub mtu: Option<u32>,
    /// Grant admin within the cluster. Only honored when the creating
    /// identity is itself an admin.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    #[builder(default)]
    pub is_admin: bool,
}

/// Body of `PATCH /api/v1/nodes/{id}/mtu`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMtuRequest {
    pub mtu: u32,
}

/// Body of `PUT /api/v1/routes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceRoutesRequest {
    pub routes: Vec<String>,
}

/// Body of `POST /api/v1/topology/lighthouse`.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct SetLighthouseRequest {
    pub node_id: Uuid,
    #[builder(setter(into))]
    pub public_ip: String,
    pub port: u16,
}

/// Body of `POST /api/v1/topology/relay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetRelayRequest {
    pub node_id: Uuid,
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

/// Response of `POST /api/v1/nodes`. Carries both secrets exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNodeResponse {
    pub node_id: Uuid,
    pub node_token: String,
    pub cluster_token: String,
    pub created_at: DateTime<Utc>,
}

/// Response of the node and cluster token rotation endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotatedTokenResponse {
    pub token: String,
}

/// Paginated node listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePage {
    pub nodes: Vec<NodeSummary>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

/// Routes scoped to one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRoutes {
    pub node_id: Uuid,
    pub routes: Vec<String>,
}

/// All routes across the cluster, grouped by node in creation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRoutes {
    pub routes: Vec<NodeRoutes>,
}

/// One lighthouse as seen in the topology view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LighthouseEntry {
    pub node_id: Uuid,
    pub name: String,
    pub public_ip: String,
    pub port: u16,
}

/// A lighthouse served by the control plane itself, synthesized from the
/// replica registry when the cluster opts in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneLighthouse {
    pub instance_id: Uuid,
    pub address: String,
    pub port: u16,
}

/// One relay as seen in the topology view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEntry {
    pub node_id: Uuid,
    pub name: String,
}

/// Response of `GET /api/v1/topology`.
///
/// Ordering is stable: lighthouses and relays by node name, control-plane
/// lighthouses by address. Replicas rendering bundles from this view must
/// produce identical bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub lighthouses: Vec<LighthouseEntry>,
    pub relays: Vec<RelayEntry>,
    pub control_plane_lighthouses: Vec<ControlPlaneLighthouse>,
}

/// Response of `GET /api/v1/config/version`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: i64,
}

/// Response of `POST /api/v1/config/bundle`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UploadBundleResponse {
    pub version: i64,
}

/// Response of `GET /health/master`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterStatus {
    pub master: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_url: Option<String>,
}

/// Pagination query for `GET /api/v1/nodes`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl PageQuery {
    /// Resolve to concrete (page, page_size), clamping to the allowed range.
    pub fn resolve(&self) -> (u32, u32) {
        let page = self.page.unwrap_or(1).max(1);
        let size = self
            .page_size
            .unwrap_or(PAGE_SIZE_DEFAULT)
            .clamp(1, PAGE_SIZE_MAX);
        (page, size)
    }
}
