//! Configuration surfaces for the server and the agent
//!
//! ## Overview
//! - `ServerOpts`: flags/environment for `fleetd`, validated into `ServerConfig`
//! - `AgentConfig`: YAML file consumed by `fleet-agent`
//!
//! Configuration errors map to exit code 1 in both binaries.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::ratelimit::Capacities;
use crate::token::{TokenError, TokenKey};
use crate::types::ReplicaRole;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("exactly one of --master / --replica must be set")]
    ModeMissingOrAmbiguous,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("cannot read agent config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse agent config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("agent config needs at least one control plane URL")]
    NoControlPlaneUrls,

    #[error("agent config needs at least one cluster entry")]
    NoClusters,
}

/// Log output flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Command-line and environment surface of `fleetd`.
#[derive(Parser, Debug, Clone)]
#[command(name = "fleetd", about = "Nebula fleet control plane")]
pub struct ServerOpts {
    /// Run as the single writer.
    #[arg(long, env = "FLEETD_MASTER")]
    pub master: bool,

    /// Run as a read-only replica.
    #[arg(long, env = "FLEETD_REPLICA")]
    pub replica: bool,

    /// Bind address for the HTTP listener.
    #[arg(long, env = "FLEETD_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    /// Path to the embedded store.
    #[arg(long, env = "FLEETD_DB_PATH", default_value = "fleetd.db")]
    pub db_path: PathBuf,

    /// Process-wide HMAC key for token hashing; at least 32 bytes.
    #[arg(long, env = "FLEETD_HMAC_SECRET", hide_env_values = true)]
    pub hmac_secret: String,

    /// Stable instance id; auto-generated and persisted when unset.
    #[arg(long, env = "FLEETD_INSTANCE_ID")]
    pub instance_id: Option<Uuid>,

    /// URL this instance advertises in the replica registry.
    #[arg(long, env = "FLEETD_PUBLIC_URL")]
    pub public_url: Url,

    /// Directory the lighthouse supervisor writes per-cluster trees under.
    #[arg(
        long,
        env = "FLEETD_LIGHTHOUSE_BASE_PATH",
        default_value = "/var/lib/fleetd/lighthouse"
    )]
    pub lighthouse_base_path: PathBuf,

    /// Overlay binary used for lighthouse children.
    #[arg(long, env = "FLEETD_OVERLAY_BINARY", default_value = "nebula")]
    pub overlay_binary: PathBuf,

    /// Lighthouse supervisor tick interval, seconds.
    #[arg(long, env = "FLEETD_CONFIG_CHECK_INTERVAL", default_value_t = 5)]
    pub config_check_interval: u64,

    /// Auth-failure bucket capacity per IP, per minute.
    #[arg(long, env = "FLEETD_RATE_AUTH_FAILURE", default_value_t = 10)]
    pub rate_auth_failure: u32,

    /// Request bucket capacity per node, per minute.
    #[arg(long, env = "FLEETD_RATE_REQUEST", default_value_t = 100)]
    pub rate_request: u32,

    /// Bundle-upload bucket capacity per cluster, per minute.
    #[arg(long, env = "FLEETD_RATE_BUNDLE_UPLOAD", default_value_t = 10)]
    pub rate_bundle_upload: u32,

    /// Health-check bucket capacity per IP, per minute.
    #[arg(long, env = "FLEETD_RATE_HEALTH_CHECK", default_value_t = 30)]
    pub rate_health_check: u32,

    /// Tracing filter, e.g. `info` or `nebula_fleet=debug`.
    #[arg(long, env = "FLEETD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "FLEETD_LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// First-run convenience: create this tenant if the store is empty.
    #[arg(long)]
    pub bootstrap_tenant: Option<String>,

    /// First-run convenience: create this cluster under the bootstrap
    /// tenant and print its token once.
    #[arg(long, requires = "bootstrap_tenant")]
    pub bootstrap_cluster: Option<String>,
}

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub mode: ReplicaRole,
    pub listen_addr: SocketAddr,
    pub db_path: PathBuf,
    pub token_key: TokenKey,
    pub instance_id: Option<Uuid>,
    pub public_url: Url,
    pub lighthouse_base_path: PathBuf,
    pub overlay_binary: PathBuf,
    pub config_check_interval: Duration,
    pub capacities: Capacities,
    pub bootstrap_tenant: Option<String>,
    pub bootstrap_cluster: Option<String>,
}

impl ServerOpts {
    /// Check cross-field constraints and produce the runtime config.
    pub fn validate(self) -> Result<ServerConfig, ConfigError> {
        let mode = match (self.master, self.replica) {
            (true, false) => ReplicaRole::Master,
            (false, true) => ReplicaRole::Replica,
            _ => return Err(ConfigError::ModeMissingOrAmbiguous),
        };
        let token_key = TokenKey::new(self.hmac_secret.into_bytes())?;
        Ok(ServerConfig {
            mode,
            listen_addr: self.listen_addr,
            db_path: self.db_path,
            token_key,
            instance_id: self.instance_id,
            public_url: self.public_url,
            lighthouse_base_path: self.lighthouse_base_path,
            overlay_binary: self.overlay_binary,
            config_check_interval: Duration::from_secs(self.config_check_interval.max(1)),
            capacities: Capacities {
                auth_failure: self.rate_auth_failure,
                request: self.rate_request,
                bundle_upload: self.rate_bundle_upload,
                health_check: self.rate_health_check,
            },
            bootstrap_tenant: self.bootstrap_tenant,
            bootstrap_cluster: self.bootstrap_cluster,
        })
    }
}

/// Install the process-wide tracing subscriber. `level` is an env-filter
/// directive; bad directives fall back to `info`.
pub fn init_tracing(level: &str, format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_shutdown_deadline() -> u64 {
    30
}

fn default_overlay_binary() -> PathBuf {
    PathBuf::from("nebula")
}

/// One managed cluster on this node.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentClusterConfig {
    pub cluster_id: Uuid,
    pub node_id: Uuid,
    pub node_token: String,
    pub cluster_token: String,
    /// Directory the applier swaps bundles into; the supervisor runs
    /// `nebula -config <config_dir>/config.yml`.
    pub config_dir: PathBuf,
}

/// YAML configuration of `fleet-agent`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Control-plane base URLs in preference order.
    pub control_plane_urls: Vec<String>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_overlay_binary")]
    pub overlay_binary_path: PathBuf,

    #[serde(default = "default_shutdown_deadline")]
    pub shutdown_deadline_secs: u64,

    pub clusters: Vec<AgentClusterConfig>,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AgentConfig =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.control_plane_urls.is_empty() {
            return Err(ConfigError::NoControlPlaneUrls);
        }
        if self.clusters.is_empty() {
            return Err(ConfigError::NoClusters);
        }
        Ok(self)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs.max(1))
    }
}
