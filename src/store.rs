//! Embedded persistent store
//!
//! ## Overview
//! - SQLite (WAL) schema for tenants, clusters, nodes, bundles, replicas
//! - Typed operations; every statement is parameterized
//! - Per-cluster `config_version` bump inside the caller's transaction
//!
//! The store assumes a single writer per database file. Write transactions
//! use `BEGIN IMMEDIATE` and retry up to three times on a busy database with
//! a 10 ms backoff before surfacing the error.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use uuid::Uuid;

use crate::error::{Result, ServiceError};
use crate::types::{
    BundleRecord, Cluster, ClusterPki, ClusterState, Node, Replica, ReplicaRole, Tenant,
};

const WRITE_RETRIES: u32 = 3;
const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(10);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS clusters (
    id                  TEXT PRIMARY KEY,
    tenant_id           TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    name                TEXT NOT NULL,
    cluster_token_hash  TEXT NOT NULL,
    provide_lighthouse  INTEGER NOT NULL DEFAULT 0,
    lighthouse_port     INTEGER NOT NULL DEFAULT 4242,
    config_version      INTEGER NOT NULL DEFAULT 1,
    pki_ca_cert         BLOB,
    pki_ca_key          BLOB,
    pki_crl             BLOB,
    pki_host_cert       BLOB,
    pki_host_key        BLOB,
    created_at          TEXT NOT NULL,
    UNIQUE (tenant_id, name)
);

CREATE TABLE IF NOT EXISTS cluster_state (
    cluster_id              TEXT NOT NULL REFERENCES clusters(id) ON DELETE CASCADE,
    instance_id             TEXT NOT NULL,
    running_config_version  INTEGER NOT NULL DEFAULT 0,
    updated_at              TEXT NOT NULL,
    PRIMARY KEY (cluster_id, instance_id)
);

CREATE TABLE IF NOT EXISTS replicas (
    id            TEXT PRIMARY KEY,
    address       TEXT NOT NULL UNIQUE,
    role          TEXT NOT NULL CHECK (role IN ('master', 'replica')),
    created_at    TEXT NOT NULL,
    last_seen_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS nodes (
    id                           TEXT PRIMARY KEY,
    tenant_id                    TEXT NOT NULL,
    cluster_id                   TEXT NOT NULL REFERENCES clusters(id) ON DELETE CASCADE,
    name                         TEXT NOT NULL,
    is_admin                     INTEGER NOT NULL DEFAULT 0,
    token_hash                   TEXT NOT NULL,
    mtu                          INTEGER NOT NULL DEFAULT 1300,
    routes                       TEXT NOT NULL DEFAULT '[]',
    routes_updated_at            TEXT,
    is_lighthouse                INTEGER NOT NULL DEFAULT 0,
    lighthouse_public_ip         TEXT,
    lighthouse_port              INTEGER,
    is_relay                     INTEGER NOT NULL DEFAULT 0,
    lighthouse_relay_updated_at  TEXT,
    created_at                   TEXT NOT NULL,
    UNIQUE (tenant_id, cluster_id, name)
);

CREATE INDEX IF NOT EXISTS idx_nodes_token_hash ON nodes (token_hash);
CREATE INDEX IF NOT EXISTS idx_nodes_cluster ON nodes (cluster_id, name);

CREATE TABLE IF NOT EXISTS bundles (
    tenant_id   TEXT NOT NULL,
    cluster_id  TEXT NOT NULL REFERENCES clusters(id) ON DELETE CASCADE,
    version     INTEGER NOT NULL,
    data        BLOB NOT NULL,
    created_by  TEXT REFERENCES nodes(id) ON DELETE SET NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (tenant_id, cluster_id, version)
);

CREATE TABLE IF NOT EXISTS meta (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);
"#;

/// Timestamps are stored as fixed-width RFC 3339 text (microseconds, Z)
/// so lexicographic comparison in SQL matches chronological order.
fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn opt_ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|d| Some(d.with_timezone(&Utc)))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            }),
    }
}

fn uuid_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn opt_uuid_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        None => Ok(None),
        Some(s) => Uuid::parse_str(&s).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

const CLUSTER_COLS: &str = "id, tenant_id, name, cluster_token_hash, provide_lighthouse, \
     lighthouse_port, config_version, created_at";

fn row_to_cluster(row: &rusqlite::Row<'_>) -> rusqlite::Result<Cluster> {
    Ok(Cluster {
        id: uuid_col(row, 0)?,
        tenant_id: uuid_col(row, 1)?,
        name: row.get(2)?,
        cluster_token_hash: row.get(3)?,
        provide_lighthouse: row.get(4)?,
        lighthouse_port: row.get(5)?,
        config_version: row.get(6)?,
        created_at: ts_col(row, 7)?,
    })
}

const NODE_COLS: &str = "id, tenant_id, cluster_id, name, is_admin, token_hash, mtu, routes, \
     routes_updated_at, is_lighthouse, lighthouse_public_ip, lighthouse_port, is_relay, \
     lighthouse_relay_updated_at, created_at";

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<Node> {
    let routes_json: String = row.get(7)?;
    let routes: Vec<String> = serde_json::from_str(&routes_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Node {
        id: uuid_col(row, 0)?,
        tenant_id: uuid_col(row, 1)?,
        cluster_id: uuid_col(row, 2)?,
        name: row.get(3)?,
        is_admin: row.get(4)?,
        token_hash: row.get(5)?,
        mtu: row.get(6)?,
        routes,
        routes_updated_at: opt_ts_col(row, 8)?,
        is_lighthouse: row.get(9)?,
        lighthouse_public_ip: row.get(10)?,
        lighthouse_port: row.get(11)?,
        is_relay: row.get(12)?,
        lighthouse_relay_updated_at: opt_ts_col(row, 13)?,
        created_at: ts_col(row, 14)?,
    })
}

fn row_to_replica(row: &rusqlite::Row<'_>) -> rusqlite::Result<Replica> {
    let role: String = row.get(2)?;
    Ok(Replica {
        id: uuid_col(row, 0)?,
        address: row.get(1)?,
        role: role.parse::<ReplicaRole>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        created_at: ts_col(row, 3)?,
        last_seen_at: ts_col(row, 4)?,
    })
}

/// Handle to the embedded store. Cheap to clone; all clones share one
/// connection behind a mutex. Operations are synchronous and short; the
/// guard is never held across an await point.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if necessary) the database at `path` and apply the
    /// schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(ServiceError::from)?;
        Self::init(conn)
    }

    /// In-memory store, used by tests and the readiness probe harness.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(ServiceError::from)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(ServiceError::from)?;
        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))
            .map_err(ServiceError::from)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(ServiceError::from)?;
        conn.execute_batch(SCHEMA).map_err(ServiceError::from)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Cheap liveness probe for the readiness endpoint.
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(ServiceError::from)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction, retrying a busy
    /// database up to three times at the begin/commit boundaries. Mutating
    /// services do their change and the version bump in one such
    /// transaction; service-level errors from `f` roll back and surface
    /// immediately.
    pub fn write<T>(&self, f: impl Fn(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let mut attempt = 0;
        loop {
            let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
                Ok(tx) => tx,
                Err(e) if is_busy(&e) && attempt < WRITE_RETRIES => {
                    attempt += 1;
                    std::thread::sleep(WRITE_RETRY_BACKOFF);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let value = f(&tx)?;
            match tx.commit() {
                Ok(()) => return Ok(value),
                Err(e) if is_busy(&e) && attempt < WRITE_RETRIES => {
                    attempt += 1;
                    std::thread::sleep(WRITE_RETRY_BACKOFF);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(ServiceError::from)
    }

    // -- meta ---------------------------------------------------------------

    /// Return the persisted instance id, minting and storing one on first
    /// call. An explicitly configured id always wins and is persisted.
    pub fn instance_id(&self, configured: Option<Uuid>) -> Result<Uuid> {
        self.write(|tx| {
            if let Some(id) = configured {
                tx.execute(
                    "INSERT INTO meta (key, value) VALUES ('instance_id', ?1)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![id.to_string()],
                )?;
                return Ok(id);
            }
            let existing: Option<String> = tx
                .query_row(
                    "SELECT value FROM meta WHERE key = 'instance_id'",
                    [],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(s) = existing {
                return Uuid::parse_str(&s)
                    .map_err(|e| ServiceError::Internal(e.to_string()));
            }
            let id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO meta (key, value) VALUES ('instance_id', ?1)",
                params![id.to_string()],
            )?;
            Ok(id)
        })
    }

    // -- tenants & clusters -------------------------------------------------

    pub fn create_tenant(&self, name: &str) -> Result<Tenant> {
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.write(|tx| {
            tx.execute(
                "INSERT INTO tenants (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![
                    tenant.id.to_string(),
                    tenant.name,
                    fmt_ts(tenant.created_at)
                ],
            )?;
            Ok(())
        })?;
        Ok(tenant)
    }

    pub fn create_cluster(
        &self,
        tenant_id: Uuid,
        name: &str,
        token_hash: &str,
        provide_lighthouse: bool,
        lighthouse_port: u16,
    ) -> Result<Cluster> {
        let cluster = Cluster {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            cluster_token_hash: token_hash.to_string(),
            provide_lighthouse,
            lighthouse_port,
            config_version: 1,
            created_at: Utc::now(),
        };
        self.write(|tx| {
            tx.execute(
                "INSERT INTO clusters (id, tenant_id, name, cluster_token_hash, \
                 provide_lighthouse, lighthouse_port, config_version, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
                params![
                    cluster.id.to_string(),
                    cluster.tenant_id.to_string(),
                    cluster.name,
                    cluster.cluster_token_hash,
                    cluster.provide_lighthouse,
                    cluster.lighthouse_port,
                    fmt_ts(cluster.created_at)
                ],
            )?;
            Ok(())
        })?;
        Ok(cluster)
    }

    pub fn get_cluster(&self, id: Uuid) -> Result<Cluster> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {CLUSTER_COLS} FROM clusters WHERE id = ?1"),
                params![id.to_string()],
                row_to_cluster,
            )
        })
    }

    /// Lookup used by cluster-token authentication.
    pub fn get_cluster_by_token_hash(&self, token_hash: &str) -> Result<Option<Cluster>> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {CLUSTER_COLS} FROM clusters WHERE cluster_token_hash = ?1"),
                params![token_hash],
                row_to_cluster,
            )
            .optional()
        })
    }

    /// Clusters the lighthouse supervisor has to serve on this instance.
    pub fn lighthouse_clusters(&self) -> Result<Vec<Cluster>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CLUSTER_COLS} FROM clusters WHERE provide_lighthouse = 1 ORDER BY id"
            ))?;
            let rows = stmt.query_map([], row_to_cluster)?;
            rows.collect()
        })
    }

    pub fn config_version(&self, cluster_id: Uuid) -> Result<i64> {
        self.read(|conn| {
            conn.query_row(
                "SELECT config_version FROM clusters WHERE id = ?1",
                params![cluster_id.to_string()],
                |r| r.get(0),
            )
        })
    }

    /// Replace the cluster token hash; bumps the version in-transaction.
    pub fn rotate_cluster_token(&self, cluster_id: Uuid, new_hash: &str) -> Result<i64> {
        self.write(|tx| {
            let n = tx.execute(
                "UPDATE clusters SET cluster_token_hash = ?1 WHERE id = ?2",
                params![new_hash, cluster_id.to_string()],
            )?;
            if n == 0 {
                return Err(ServiceError::NotFound);
            }
            bump_config_version(tx, cluster_id)
        })
    }

    /// Replace the cluster's PKI material; bumps the version in-transaction.
    pub fn set_cluster_pki(&self, cluster_id: Uuid, pki: &ClusterPki) -> Result<i64> {
        self.write(|tx| {
            let n = tx.execute(
                "UPDATE clusters SET pki_ca_cert = ?1, pki_ca_key = ?2, pki_crl = ?3, \
                 pki_host_cert = ?4, pki_host_key = ?5 WHERE id = ?6",
                params![
                    pki.ca_cert,
                    pki.ca_key,
                    pki.crl,
                    pki.host_cert,
                    pki.host_key,
                    cluster_id.to_string()
                ],
            )?;
            if n == 0 {
                return Err(ServiceError::NotFound);
            }
            bump_config_version(tx, cluster_id)
        })
    }

    pub fn get_cluster_pki(&self, cluster_id: Uuid) -> Result<ClusterPki> {
        self.read(|conn| {
            conn.query_row(
                "SELECT pki_ca_cert, pki_ca_key, pki_crl, pki_host_cert, pki_host_key \
                 FROM clusters WHERE id = ?1",
                params![cluster_id.to_string()],
                |row| {
                    Ok(ClusterPki {
                        ca_cert: row.get::<_, Option<Vec<u8>>>(0)?.unwrap_or_default(),
                        ca_key: row.get::<_, Option<Vec<u8>>>(1)?.unwrap_or_default(),
                        crl: row.get::<_, Option<Vec<u8>>>(2)?.unwrap_or_default(),
                        host_cert: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
                        host_key: row.get::<_, Option<Vec<u8>>>(4)?.unwrap_or_default(),
                    })
                },
            )
        })
    }

    // -- nodes --------------------------------------------------------------

    /// Insert a node and bump the cluster version in one transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn create_node(
        &self,
        tenant_id: Uuid,
        cluster_id: Uuid,
        name: &str,
        token_hash: &str,
        mtu: u32,
        is_admin: bool,
    ) -> Result<Node> {
        let node = Node {
            id: Uuid::new_v4(),
            tenant_id,
            cluster_id,
            name: name.to_string(),
            is_admin,
            token_hash: token_hash.to_string(),
            mtu,
            routes: Vec::new(),
            routes_updated_at: None,
            is_lighthouse: false,
            lighthouse_public_ip: None,
            lighthouse_port: None,
            is_relay: false,
            lighthouse_relay_updated_at: None,
            created_at: Utc::now(),
        };
        self.write(|tx| {
            tx.execute(
                "INSERT INTO nodes (id, tenant_id, cluster_id, name, is_admin, token_hash, \
                 mtu, routes, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '[]', ?8)",
                params![
                    node.id.to_string(),
                    node.tenant_id.to_string(),
                    node.cluster_id.to_string(),
                    node.name,
                    node.is_admin,
                    node.token_hash,
                    node.mtu,
                    fmt_ts(node.created_at)
                ],
            )?;
            bump_config_version(tx, cluster_id)?;
            Ok(())
        })?;
        Ok(node)
    }

    pub fn get_node(&self, cluster_id: Uuid, node_id: Uuid) -> Result<Node> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {NODE_COLS} FROM nodes WHERE cluster_id = ?1 AND id = ?2"),
                params![cluster_id.to_string(), node_id.to_string()],
                row_to_node,
            )
        })
    }

    /// Lookup used by node-token authentication when the cluster scope is
    /// already known.
    pub fn get_node_by_token_hash(
        &self,
        cluster_id: Uuid,
        token_hash: &str,
    ) -> Result<Option<Node>> {
        self.read(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {NODE_COLS} FROM nodes WHERE cluster_id = ?1 AND token_hash = ?2"
                ),
                params![cluster_id.to_string(), token_hash],
                row_to_node,
            )
            .optional()
        })
    }

    /// Global lookup by token hash; the hash itself pins the node (and with
    /// it the cluster scope) because hashes are unique per token.
    pub fn find_node_by_token_hash(&self, token_hash: &str) -> Result<Option<Node>> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {NODE_COLS} FROM nodes WHERE token_hash = ?1"),
                params![token_hash],
                row_to_node,
            )
            .optional()
        })
    }

    pub fn list_nodes(&self, cluster_id: Uuid, page: u32, page_size: u32) -> Result<(Vec<Node>, u64)> {
        self.read(|conn| {
            let total: u64 = conn.query_row(
                "SELECT COUNT(*) FROM nodes WHERE cluster_id = ?1",
                params![cluster_id.to_string()],
                |r| r.get(0),
            )?;
            let offset = u64::from(page.saturating_sub(1)) * u64::from(page_size);
            let mut stmt = conn.prepare(&format!(
                "SELECT {NODE_COLS} FROM nodes WHERE cluster_id = ?1 \
                 ORDER BY name LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt.query_map(
                params![cluster_id.to_string(), page_size, offset],
                row_to_node,
            )?;
            Ok((rows.collect::<rusqlite::Result<Vec<_>>>()?, total))
        })
    }

    /// All nodes in creation order; feeds the cluster-wide route view.
    pub fn nodes_in_creation_order(&self, cluster_id: Uuid) -> Result<Vec<Node>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {NODE_COLS} FROM nodes WHERE cluster_id = ?1 ORDER BY created_at, id"
            ))?;
            let rows = stmt.query_map(params![cluster_id.to_string()], row_to_node)?;
            rows.collect()
        })
    }

    /// Lighthouse/relay flag carriers, ordered by node name for stable
    /// topology output.
    pub fn nodes_by_name(&self, cluster_id: Uuid) -> Result<Vec<Node>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {NODE_COLS} FROM nodes WHERE cluster_id = ?1 ORDER BY name"
            ))?;
            let rows = stmt.query_map(params![cluster_id.to_string()], row_to_node)?;
            rows.collect()
        })
    }

    pub fn rotate_node_token(&self, cluster_id: Uuid, node_id: Uuid, new_hash: &str) -> Result<i64> {
        self.write(|tx| {
            let n = tx.execute(
                "UPDATE nodes SET token_hash = ?1 WHERE cluster_id = ?2 AND id = ?3",
                params![new_hash, cluster_id.to_string(), node_id.to_string()],
            )?;
            if n == 0 {
                return Err(ServiceError::NotFound);
            }
            bump_config_version(tx, cluster_id)
        })
    }

    pub fn update_node_mtu(&self, cluster_id: Uuid, node_id: Uuid, mtu: u32) -> Result<i64> {
        self.write(|tx| {
            let n = tx.execute(
                "UPDATE nodes SET mtu = ?1 WHERE cluster_id = ?2 AND id = ?3",
                params![mtu, cluster_id.to_string(), node_id.to_string()],
            )?;
            if n == 0 {
                return Err(ServiceError::NotFound);
            }
            bump_config_version(tx, cluster_id)
        })
    }

    /// Delete a node. Historical bundles keep their rows; `created_by` is
    /// nulled by the foreign key action.
    pub fn delete_node(&self, cluster_id: Uuid, node_id: Uuid) -> Result<i64> {
        self.write(|tx| {
            let n = tx.execute(
                "DELETE FROM nodes WHERE cluster_id = ?1 AND id = ?2",
                params![cluster_id.to_string(), node_id.to_string()],
            )?;
            if n == 0 {
                return Err(ServiceError::NotFound);
            }
            bump_config_version(tx, cluster_id)
        })
    }

    pub fn set_lighthouse(
        &self,
        cluster_id: Uuid,
        node_id: Uuid,
        public_ip: &str,
        port: u16,
    ) -> Result<i64> {
        self.write(|tx| {
            let n = tx.execute(
                "UPDATE nodes SET is_lighthouse = 1, lighthouse_public_ip = ?1, \
                 lighthouse_port = ?2, lighthouse_relay_updated_at = ?3 \
                 WHERE cluster_id = ?4 AND id = ?5",
                params![
                    public_ip,
                    port,
                    fmt_ts(Utc::now()),
                    cluster_id.to_string(),
                    node_id.to_string()
                ],
            )?;
            if n == 0 {
                return Err(ServiceError::NotFound);
            }
            bump_config_version(tx, cluster_id)
        })
    }

    pub fn clear_lighthouse(&self, cluster_id: Uuid, node_id: Uuid) -> Result<i64> {
        self.write(|tx| {
            let n = tx.execute(
                "UPDATE nodes SET is_lighthouse = 0, lighthouse_public_ip = NULL, \
                 lighthouse_port = NULL, lighthouse_relay_updated_at = ?1 \
                 WHERE cluster_id = ?2 AND id = ?3",
                params![fmt_ts(Utc::now()), cluster_id.to_string(), node_id.to_string()],
            )?;
            if n == 0 {
                return Err(ServiceError::NotFound);
            }
            bump_config_version(tx, cluster_id)
        })
    }

    pub fn set_relay(&self, cluster_id: Uuid, node_id: Uuid, is_relay: bool) -> Result<i64> {
        self.write(|tx| {
            let n = tx.execute(
                "UPDATE nodes SET is_relay = ?1, lighthouse_relay_updated_at = ?2 \
                 WHERE cluster_id = ?3 AND id = ?4",
                params![
                    is_relay,
                    fmt_ts(Utc::now()),
                    cluster_id.to_string(),
                    node_id.to_string()
                ],
            )?;
            if n == 0 {
                return Err(ServiceError::NotFound);
            }
            bump_config_version(tx, cluster_id)
        })
    }

    pub fn replace_routes(&self, cluster_id: Uuid, node_id: Uuid, routes: &[String]) -> Result<i64> {
        let routes_json = serde_json::to_string(routes)?;
        self.write(|tx| {
            let n = tx.execute(
                "UPDATE nodes SET routes = ?1, routes_updated_at = ?2 \
                 WHERE cluster_id = ?3 AND id = ?4",
                params![
                    routes_json,
                    fmt_ts(Utc::now()),
                    cluster_id.to_string(),
                    node_id.to_string()
                ],
            )?;
            if n == 0 {
                return Err(ServiceError::NotFound);
            }
            bump_config_version(tx, cluster_id)
        })
    }

    // -- bundles ------------------------------------------------------------

    /// Insert a bundle with `version = max + 1` and bump the cluster's
    /// config version, all in one transaction. Returns the new config
    /// version, which is what the upload response carries.
    pub fn insert_bundle(
        &self,
        tenant_id: Uuid,
        cluster_id: Uuid,
        data: &[u8],
        created_by: Option<Uuid>,
    ) -> Result<i64> {
        self.write(|tx| {
            let next: i64 = tx.query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM bundles \
                 WHERE tenant_id = ?1 AND cluster_id = ?2",
                params![tenant_id.to_string(), cluster_id.to_string()],
                |r| r.get(0),
            )?;
            tx.execute(
                "INSERT INTO bundles (tenant_id, cluster_id, version, data, created_by, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    tenant_id.to_string(),
                    cluster_id.to_string(),
                    next,
                    data,
                    created_by.map(|id| id.to_string()),
                    fmt_ts(Utc::now())
                ],
            )?;
            bump_config_version(tx, cluster_id)
        })
    }

    pub fn latest_bundle(&self, cluster_id: Uuid) -> Result<Option<BundleRecord>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT tenant_id, cluster_id, version, data, created_by, created_at \
                 FROM bundles WHERE cluster_id = ?1 ORDER BY version DESC LIMIT 1",
                params![cluster_id.to_string()],
                |row| {
                    Ok(BundleRecord {
                        tenant_id: uuid_col(row, 0)?,
                        cluster_id: uuid_col(row, 1)?,
                        version: row.get(2)?,
                        data: row.get(3)?,
                        created_by: opt_uuid_col(row, 4)?,
                        created_at: ts_col(row, 5)?,
                    })
                },
            )
            .optional()
        })
    }

    // -- replicas -----------------------------------------------------------

    /// Insert or refresh this instance's registry row. Last write wins on
    /// the address.
    pub fn upsert_replica(&self, id: Uuid, address: &str, role: ReplicaRole) -> Result<()> {
        let now = fmt_ts(Utc::now());
        self.write(|tx| {
            tx.execute(
                "INSERT INTO replicas (id, address, role, created_at, last_seen_at) \
                 VALUES (?1, ?2, ?3, ?4, ?4) \
                 ON CONFLICT(id) DO UPDATE SET address = excluded.address, \
                 role = excluded.role, last_seen_at = excluded.last_seen_at",
                params![id.to_string(), address, role.as_str(), now],
            )?;
            Ok(())
        })
    }

    pub fn heartbeat_replica(&self, id: Uuid) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "UPDATE replicas SET last_seen_at = ?1 WHERE id = ?2",
                params![fmt_ts(Utc::now()), id.to_string()],
            )?;
            Ok(())
        })
    }

    /// Delete rows not seen within `staleness`. Returns how many were
    /// removed.
    pub fn prune_replicas(&self, staleness: Duration) -> Result<usize> {
        let cutoff = fmt_ts(Utc::now() - chrono::Duration::from_std(staleness).unwrap_or_default());
        self.write(|tx| {
            let n = tx.execute(
                "DELETE FROM replicas WHERE last_seen_at < ?1",
                params![cutoff],
            )?;
            Ok(n)
        })
    }

    pub fn list_replicas(&self) -> Result<Vec<Replica>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, address, role, created_at, last_seen_at FROM replicas \
                 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([], row_to_replica)?;
            rows.collect()
        })
    }

    /// The current master: the freshest `master` row within `staleness`,
    /// earliest `created_at` (then id) breaking ties.
    pub fn fresh_master(&self, staleness: Duration) -> Result<Option<Replica>> {
        let cutoff = fmt_ts(Utc::now() - chrono::Duration::from_std(staleness).unwrap_or_default());
        self.read(|conn| {
            conn.query_row(
                "SELECT id, address, role, created_at, last_seen_at FROM replicas \
                 WHERE role = 'master' AND last_seen_at >= ?1 \
                 ORDER BY created_at, id LIMIT 1",
                params![cutoff],
                row_to_replica,
            )
            .optional()
        })
    }

    // -- cluster state ------------------------------------------------------

    pub fn upsert_cluster_state(
        &self,
        cluster_id: Uuid,
        instance_id: Uuid,
        running_config_version: i64,
    ) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO cluster_state (cluster_id, instance_id, running_config_version, \
                 updated_at) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(cluster_id, instance_id) DO UPDATE SET \
                 running_config_version = excluded.running_config_version, \
                 updated_at = excluded.updated_at",
                params![
                    cluster_id.to_string(),
                    instance_id.to_string(),
                    running_config_version,
                    fmt_ts(Utc::now())
                ],
            )?;
            Ok(())
        })
    }

    /// The version this instance's lighthouse child is running; absent row
    /// reads as 0.
    pub fn running_config_version(&self, cluster_id: Uuid, instance_id: Uuid) -> Result<i64> {
        self.read(|conn| {
            conn.query_row(
                "SELECT running_config_version FROM cluster_state \
                 WHERE cluster_id = ?1 AND instance_id = ?2",
                params![cluster_id.to_string(), instance_id.to_string()],
                |r| r.get(0),
            )
            .optional()
            .map(|v| v.unwrap_or(0))
        })
    }

    pub fn get_cluster_state(
        &self,
        cluster_id: Uuid,
        instance_id: Uuid,
    ) -> Result<Option<ClusterState>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT cluster_id, instance_id, running_config_version, updated_at \
                 FROM cluster_state WHERE cluster_id = ?1 AND instance_id = ?2",
                params![cluster_id.to_string(), instance_id.to_string()],
                |row| {
                    Ok(ClusterState {
                        cluster_id: uuid_col(row, 0)?,
                        instance_id: uuid_col(row, 1)?,
                        running_config_version: row.get(2)?,
                        updated_at: ts_col(row, 3)?,
                    })
                },
            )
            .optional()
        })
    }
}

/// Read-then-write bump of the per-cluster monotonic version, inside the
/// caller's transaction. `BEGIN IMMEDIATE` holds the write lock until
/// commit, so concurrent writers serialize here.
pub fn bump_config_version(tx: &Transaction<'_>, cluster_id: Uuid) -> Result<i64> {
    let current: i64 = tx.query_row(
        "SELECT config_version FROM clusters WHERE id = ?1",
        params![cluster_id.to_string()],
        |r| r.get(0),
    )?;
    let next = current + 1;
    tx.execute(
        "UPDATE clusters SET config_version = ?1 WHERE id = ?2",
        params![next, cluster_id.to_string()],
    )?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{self, TokenKey};

    fn seeded() -> (Store, Tenant, Cluster) {
        let store = Store::open_in_memory().unwrap();
        let tenant = store.create_tenant("acme").unwrap();
        let key = TokenKey::new(vec![1u8; 32]).unwrap();
        let hash = token::hash(&token::generate(), &key);
        let cluster = store
            .create_cluster(tenant.id, "edge", &hash, true, 4242)
            .unwrap();
        (store, tenant, cluster)
    }

    fn seeded_node(store: &Store, tenant: &Tenant, cluster: &Cluster, name: &str) -> Node {
        store
            .create_node(tenant.id, cluster.id, name, &format!("hash-{name}"), 1300, false)
            .unwrap()
    }

    #[test]
    fn config_version_is_strictly_increasing_across_mutations() {
        let (store, tenant, cluster) = seeded();
        let mut seen = vec![store.config_version(cluster.id).unwrap()];

        let node = seeded_node(&store, &tenant, &cluster, "n1");
        seen.push(store.config_version(cluster.id).unwrap());

        store.update_node_mtu(cluster.id, node.id, 1400).unwrap();
        seen.push(store.config_version(cluster.id).unwrap());

        store
            .replace_routes(cluster.id, node.id, &["10.0.0.0/24".to_string()])
            .unwrap();
        seen.push(store.config_version(cluster.id).unwrap());

        store.set_relay(cluster.id, node.id, true).unwrap();
        seen.push(store.config_version(cluster.id).unwrap());

        store.rotate_cluster_token(cluster.id, "new-hash").unwrap();
        seen.push(store.config_version(cluster.id).unwrap());

        store.delete_node(cluster.id, node.id).unwrap();
        seen.push(store.config_version(cluster.id).unwrap());

        for pair in seen.windows(2) {
            assert!(pair[1] > pair[0], "versions not increasing: {seen:?}");
        }
    }

    #[test]
    fn bundle_insert_bumps_and_returns_config_version() {
        let (store, tenant, cluster) = seeded();
        let before = store.config_version(cluster.id).unwrap();
        let v = store
            .insert_bundle(tenant.id, cluster.id, b"blob-1", None)
            .unwrap();
        assert_eq!(v, before + 1);
        assert_eq!(store.config_version(cluster.id).unwrap(), v);

        let rec = store.latest_bundle(cluster.id).unwrap().unwrap();
        assert_eq!(rec.version, 1);
        assert_eq!(rec.data, b"blob-1");

        store
            .insert_bundle(tenant.id, cluster.id, b"blob-2", None)
            .unwrap();
        let rec = store.latest_bundle(cluster.id).unwrap().unwrap();
        assert_eq!(rec.version, 2);
        assert_eq!(rec.data, b"blob-2");
    }

    #[test]
    fn deleting_a_node_nulls_bundle_created_by_but_keeps_history() {
        let (store, tenant, cluster) = seeded();
        let node = seeded_node(&store, &tenant, &cluster, "uploader");
        store
            .insert_bundle(tenant.id, cluster.id, b"blob", Some(node.id))
            .unwrap();

        store.delete_node(cluster.id, node.id).unwrap();

        let rec = store.latest_bundle(cluster.id).unwrap().unwrap();
        assert_eq!(rec.created_by, None);
        assert_eq!(rec.data, b"blob");
    }

    #[test]
    fn duplicate_node_name_in_cluster_conflicts() {
        let (store, tenant, cluster) = seeded();
        seeded_node(&store, &tenant, &cluster, "dup");
        let err = store
            .create_node(tenant.id, cluster.id, "dup", "other-hash", 1300, false)
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn replica_prune_and_heartbeat_round_trip() {
        let (store, ..) = seeded();
        let id = Uuid::new_v4();
        store
            .upsert_replica(id, "http://10.0.0.1:8000", ReplicaRole::Replica)
            .unwrap();

        // Fresh row survives a 60 s prune.
        assert_eq!(store.prune_replicas(Duration::from_secs(60)).unwrap(), 0);

        // A zero-staleness prune treats it as stale.
        assert_eq!(store.prune_replicas(Duration::from_secs(0)).unwrap(), 1);
        assert!(store.list_replicas().unwrap().is_empty());

        // Heartbeat after reintroduction restores it.
        store
            .upsert_replica(id, "http://10.0.0.1:8000", ReplicaRole::Replica)
            .unwrap();
        store.heartbeat_replica(id).unwrap();
        assert_eq!(store.list_replicas().unwrap().len(), 1);
    }

    #[test]
    fn fresh_master_prefers_earliest_created() {
        let (store, ..) = seeded();
        let m1 = Uuid::new_v4();
        let m2 = Uuid::new_v4();
        store
            .upsert_replica(m1, "http://10.0.0.1:8000", ReplicaRole::Master)
            .unwrap();
        std::thread::sleep(Duration::from_millis(2));
        store
            .upsert_replica(m2, "http://10.0.0.2:8000", ReplicaRole::Master)
            .unwrap();

        let master = store.fresh_master(Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(master.id, m1);
    }

    #[test]
    fn running_config_version_defaults_to_zero() {
        let (store, _, cluster) = seeded();
        let instance = Uuid::new_v4();
        assert_eq!(
            store.running_config_version(cluster.id, instance).unwrap(),
            0
        );
        store
            .upsert_cluster_state(cluster.id, instance, 7)
            .unwrap();
        assert_eq!(
            store.running_config_version(cluster.id, instance).unwrap(),
            7
        );
    }

    #[test]
    fn instance_id_is_persisted() {
        let store = Store::open_in_memory().unwrap();
        let a = store.instance_id(None).unwrap();
        let b = store.instance_id(None).unwrap();
        assert_eq!(a, b);

        let forced = Uuid::new_v4();
        assert_eq!(store.instance_id(Some(forced)).unwrap(), forced);
        assert_eq!(store.instance_id(None).unwrap(), forced);
    }
}
