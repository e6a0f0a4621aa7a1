//! Control-plane health monitoring on the node
//!
//! ## Overview
//! - Find and cache the current master URL
//! - Track which replicas answer at all
//! - Flag degraded mode when no master is reachable
//!
//! Degraded mode never tears anything down: the overlay child keeps
//! running the last applied configuration, and the poller keeps trying
//! replicas for reads. Entry logs WARN once, exit logs INFO once.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{ControlPlaneClient, ReplicaHandler};

/// Probe period.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

pub struct HealthMonitor {
    cluster_id: Uuid,
    urls: Vec<String>,
    cached_master: Mutex<Option<String>>,
    reachable: Mutex<HashSet<String>>,
    degraded: AtomicBool,
    consecutive_poll_failures: AtomicU32,
}

impl HealthMonitor {
    pub fn new(cluster_id: Uuid, urls: Vec<String>) -> Arc<Self> {
        Arc::new(HealthMonitor {
            cluster_id,
            urls,
            cached_master: Mutex::new(None),
            reachable: Mutex::new(HashSet::new()),
            degraded: AtomicBool::new(false),
            consecutive_poll_failures: AtomicU32::new(0),
        })
    }

    /// The last master URL a probe confirmed, if any.
    pub fn master_url(&self) -> Option<String> {
        self.cached_master.lock().clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Reachable instance URLs as of the last probe.
    pub fn reachable_urls(&self) -> Vec<String> {
        self.reachable.lock().iter().cloned().collect()
    }

    /// Called by the poller after a fully failed tick.
    pub fn note_poll_failure(&self) {
        let failures = self
            .consecutive_poll_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        debug!(cluster_id = %self.cluster_id, failures, "consecutive poll failures");
    }

    /// Called by the poller after any successful tick.
    pub fn note_poll_success(&self) {
        self.consecutive_poll_failures.store(0, Ordering::Relaxed);
    }

    fn client_for(&self, url: &str) -> Option<ControlPlaneClient> {
        ControlPlaneClient::builder()
            .base_url(url)
            .timeout(Duration::from_secs(10))
            .build()
            .ok()
    }

    /// One probe pass: refresh the cached master, the reachable set, and
    /// the degraded flag. `run` calls this every tick.
    pub async fn probe_once(&self) {
        let mut master: Option<String> = None;
        let mut reachable = HashSet::new();

        // First pass over the configured URLs: who answers, and who knows
        // a master.
        for url in &self.urls {
            let Some(client) = self.client_for(url) else { continue };
            let handler = ReplicaHandler::new(client);
            match handler.master_status().await {
                Ok(status) => {
                    reachable.insert(url.clone());
                    if master.is_none() {
                        if status.master {
                            master = Some(url.clone());
                        } else if let Some(known) = status.master_url {
                            master = Some(known);
                        }
                    }
                }
                Err(e) => {
                    debug!(url, error = %e, "master probe failed");
                }
            }
        }

        // Second pass: the registry may know instances the static list
        // does not.
        if let Some(any) = reachable.iter().next().cloned() {
            if let Some(client) = self.client_for(&any) {
                if let Ok(replicas) = ReplicaHandler::new(client).list().await {
                    for replica in replicas {
                        if reachable.contains(&replica.address) {
                            continue;
                        }
                        if let Some(client) = self.client_for(&replica.address) {
                            if ReplicaHandler::new(client).live().await.is_ok() {
                                reachable.insert(replica.address);
                            }
                        }
                    }
                }
            }
        }

        // A cached master only counts while it is actually reachable. A
        // master learned from the registry rather than the static list
        // gets one direct probe.
        let master_reachable = match &master {
            Some(url) if reachable.contains(url) => true,
            Some(url) => match self.client_for(url) {
                Some(client) => {
                    let ok = ReplicaHandler::new(client).live().await.is_ok();
                    if ok {
                        reachable.insert(url.clone());
                    }
                    ok
                }
                None => false,
            },
            None => false,
        };

        *self.cached_master.lock() = master.clone();
        *self.reachable.lock() = reachable;

        let was_degraded = self.degraded.swap(!master_reachable, Ordering::Relaxed);
        if !master_reachable && !was_degraded {
            warn!(
                cluster_id = %self.cluster_id,
                "entering degraded mode: no reachable master; keeping current config"
            );
        } else if master_reachable && was_degraded {
            info!(cluster_id = %self.cluster_id, master = ?master, "leaving degraded mode");
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_once().await,
                _ = shutdown.changed() => {
                    debug!(cluster_id = %self.cluster_id, "health monitor stopping");
                    return;
                }
            }
        }
    }
}
