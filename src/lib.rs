//! Multi-tenant control plane and node agent for Nebula overlay networks
//!
//! `nebula-fleet` manages fleets of [Nebula](https://github.com/slackhq/nebula)
//! nodes: it authenticates them, distributes versioned configuration
//! bundles, tracks overlay topology (routes, lighthouses, relays), and
//! supervises lighthouse processes on every control-plane instance. A
//! companion agent on each node polls the control plane, swaps
//! configuration on disk atomically, and supervises the Nebula process it
//! manages.
//!
//! # Components
//!
//! Two binaries share this library:
//!
//! - **`fleetd`**, the control-plane server. One instance runs as the
//!   single writer (master); any number of read-only replicas serve reads
//!   and lighthouses. See [`api`], [`nodes`], [`bundles`], [`replicas`],
//!   [`lighthouse`].
//! - **`fleet-agent`**, the node-side daemon. One worker per managed
//!   cluster composes a poller, an atomic bundle applier, a process
//!   supervisor, and a health monitor. See [`agent`], [`poller`],
//!   [`applier`], [`supervisor`], [`health`].
//!
//! # The configuration version
//!
//! Every cluster carries a monotonic `config_version`. Every mutation that
//! changes what nodes observe (node membership, MTU, routes, token
//! rotations, lighthouse/relay assignment, PKI rotation, bundle upload)
//! bumps it inside the same store transaction as the change itself.
//! Consumers never diff state; they compare versions:
//!
//! - the agent's poller re-fetches the bundle when the served version
//!   passes the one it remembers;
//! - the lighthouse supervisor on each instance rebuilds its child when
//!   the cluster version passes the instance's recorded running version.
//!
//! # Authentication
//!
//! Nodes and clusters hold long-lived random tokens, presented via the
//! `X-Nebula-Node-Token` / `X-Nebula-Cluster-Token` headers. The store
//! keeps only HMAC-SHA256 digests under a process-wide key; lookups are by
//! digest and comparisons are constant-time. See [`token`] and [`auth`].
//!
//! # Quick start (agent side)
//!
//! ```no_run
//! use nebula_fleet::client::{ControlPlaneClient, ConfigHandler, BundleFetch};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ControlPlaneClient::builder()
//!     .base_url("http://cp-1.internal:8080")
//!     .node_token("node-token-from-provisioning")
//!     .build()?;
//!
//! let config = ConfigHandler::new(client);
//! let version = config.version().await?;
//! match config.bundle(Some(version - 1)).await? {
//!     BundleFetch::NotModified { version } => println!("still at v{version}"),
//!     BundleFetch::Fetched { version, data } => {
//!         println!("fetched v{version}: {} bytes", data.len())
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Error handling
//!
//! Server-side failures map to the stable envelope
//! `{error, message, request_id}`; see [`error::ServiceError`]. The client
//! mirrors the taxonomy in [`client::ClientError`] with predicate helpers:
//!
//! ```no_run
//! use nebula_fleet::client::{ClientError, ControlPlaneClient, ConfigHandler};
//!
//! # async fn example(client: ControlPlaneClient) {
//! match ConfigHandler::new(client).version().await {
//!     Ok(v) => println!("config version {v}"),
//!     Err(ClientError::ReplicaReadOnly { master_url }) => {
//!         println!("retry against {master_url:?}")
//!     }
//!     Err(e) if e.is_retryable() => println!("transient: {e}"),
//!     Err(e) => println!("hard failure: {e}"),
//! }
//! # }
//! ```

#[macro_use]
mod macros;

pub mod agent;
pub mod api;
pub mod applier;
pub mod auth;
pub mod bundle;
pub mod bundles;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod lighthouse;
pub mod nodes;
pub mod poller;
pub mod ratelimit;
pub mod replicas;
pub mod store;
pub mod supervisor;
pub mod token;
pub mod types;

// Core error type
pub use error::{Result, ServiceError};

// Store and entities
pub use store::Store;
pub use types::{
    BundleRecord, Cluster, ClusterPki, ClusterState, CreateNodeRequest, CreateNodeResponse,
    MasterStatus, Node, NodePage, NodeSummary, Replica, ReplicaRole, Tenant, Topology,
    VersionResponse,
};

// Token primitive
pub use token::{TokenKey, generate as generate_token};

// Server assembly
pub use api::{AppState, router};
pub use config::{AgentConfig, LogFormat, ServerConfig, ServerOpts};

// Agent-side client
pub use client::{BundleFetch, ClientError, ConfigHandler, ControlPlaneClient, ReplicaHandler};
