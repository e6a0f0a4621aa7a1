//! Replica registry and high-availability role management
//!
//! ## Overview
//! - Each instance registers itself at startup and heartbeats every 10 s
//! - The master prunes rows not seen for 60 s
//! - Master discovery: the sole fresh `master` row, earliest created wins
//!
//! There is no consensus here; "master" is whichever instance was started
//! in master mode and is still heartbeating. A master refuses to start
//! while a different, still-fresh master row exists.

use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{AppState, ok};
use crate::error::Result;
use crate::store::Store;
use crate::types::ReplicaRole;

/// Heartbeat period for this instance's registry row.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// How often the master sweeps stale rows.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60);
/// Rows older than this are stale: pruned, and ignored for master
/// discovery.
pub const REPLICA_STALENESS: Duration = Duration::from_secs(60);

/// Startup found a fresh master row belonging to someone else. Maps to
/// exit code 3.
#[derive(Error, Debug)]
#[error("registry already has a fresh master at {address} (instance {instance_id})")]
pub struct MasterConflict {
    pub instance_id: Uuid,
    pub address: String,
}

/// Register this instance in the registry. In master mode, refuse when a
/// different master row is still fresh.
pub fn register_instance(
    store: &Store,
    instance_id: Uuid,
    address: &str,
    role: ReplicaRole,
) -> std::result::Result<(), MasterConflict> {
    if role == ReplicaRole::Master {
        if let Ok(Some(existing)) = store.fresh_master(REPLICA_STALENESS) {
            if existing.id != instance_id {
                return Err(MasterConflict {
                    instance_id: existing.id,
                    address: existing.address,
                });
            }
        }
    }
    if let Err(e) = store.upsert_replica(instance_id, address, role) {
        warn!(error = %e, "replica registration failed");
    }
    info!(
        instance_id = %instance_id,
        address,
        role = role.as_str(),
        "registered in replica registry"
    );
    Ok(())
}

/// Keep this instance's `last_seen_at` fresh until shutdown.
pub async fn heartbeat_loop(store: Store, instance_id: Uuid, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = store.heartbeat_replica(instance_id) {
                    warn!(error = %e, "replica heartbeat failed");
                }
            }
            _ = shutdown.changed() => {
                debug!("heartbeat loop stopping");
                return;
            }
        }
    }
}

/// Master-only: periodically delete rows whose `last_seen_at` is stale.
pub async fn prune_loop(store: Store, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.prune_replicas(REPLICA_STALENESS) {
                    Ok(0) => {}
                    Ok(n) => info!(pruned = n, "removed stale replica rows"),
                    Err(e) => warn!(error = %e, "replica prune failed"),
                }
            }
            _ = shutdown.changed() => {
                debug!("prune loop stopping");
                return;
            }
        }
    }
}

/// `GET /api/v1/replicas`: the whole registry, oldest first.
pub async fn list_replicas(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let replicas = state.store.list_replicas()?;
    Ok(ok(replicas))
}
