//! Periodic configuration polling on the node
//!
//! ## Overview
//! - Every tick: read the scalar version, conditionally fetch the bundle
//! - Hand fetched blobs to the applier, then restart the overlay child
//! - Failures end the tick, never the worker
//!
//! Target selection prefers the health monitor's cached master and falls
//! back through the configured URL list, so reads keep working while the
//! master is away.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::applier;
use crate::client::{BundleFetch, ConfigHandler, ControlPlaneClient};
use crate::health::HealthMonitor;
use crate::supervisor::SupervisorHandle;

pub struct Poller {
    cluster_id: Uuid,
    clients: Vec<ControlPlaneClient>,
    config_dir: PathBuf,
    interval: Duration,
    supervisor: Arc<SupervisorHandle>,
    health: Arc<HealthMonitor>,
    remembered_version: Option<i64>,
}

impl Poller {
    pub fn new(
        cluster_id: Uuid,
        clients: Vec<ControlPlaneClient>,
        config_dir: PathBuf,
        interval: Duration,
        supervisor: Arc<SupervisorHandle>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Poller {
            cluster_id,
            clients,
            config_dir,
            interval,
            supervisor,
            health,
            remembered_version: None,
        }
    }

    /// Clients to try this tick: the cached master's first, then the
    /// configured order. Clients are cheap clones over one shared pool.
    fn candidates(&self) -> Vec<ControlPlaneClient> {
        let master = self.health.master_url();
        let mut ordered: Vec<ControlPlaneClient> = Vec::with_capacity(self.clients.len());
        if let Some(master) = &master {
            if let Some(client) = self
                .clients
                .iter()
                .find(|c| c.base_url().trim_end_matches('/') == master.trim_end_matches('/'))
            {
                ordered.push(client.clone());
            }
        }
        for client in &self.clients {
            if !ordered.iter().any(|c| c.base_url() == client.base_url()) {
                ordered.push(client.clone());
            }
        }
        ordered
    }

    async fn tick(&mut self) {
        let mut last_error = None;
        for client in self.candidates() {
            match self.poll_one(&client).await {
                Ok(()) => {
                    self.health.note_poll_success();
                    return;
                }
                Err(e) => {
                    debug!(
                        cluster_id = %self.cluster_id,
                        url = client.base_url(),
                        error = %e,
                        "poll attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        self.health.note_poll_failure();
        if let Some(e) = last_error {
            warn!(cluster_id = %self.cluster_id, error = %e, "poll tick failed on every URL");
        }
    }

    async fn poll_one(&mut self, client: &ControlPlaneClient) -> crate::client::Result<()> {
        let config = ConfigHandler::new(client.clone());
        let version = config.version().await?;

        let remembered = self.remembered_version.unwrap_or(0);
        if version <= remembered {
            return Ok(());
        }

        debug!(
            cluster_id = %self.cluster_id,
            remembered,
            version,
            "config version advanced, fetching bundle"
        );

        match config.bundle(self.remembered_version).await? {
            BundleFetch::NotModified { version } => {
                self.remembered_version = Some(version);
                Ok(())
            }
            BundleFetch::Fetched { version, data } => {
                let target = self.config_dir.clone();
                let applied =
                    tokio::task::spawn_blocking(move || applier::apply_bundle(&data, &target))
                        .await;
                match applied {
                    Ok(Ok(())) => {
                        self.supervisor.request_restart();
                        self.remembered_version = Some(version);
                        info!(
                            cluster_id = %self.cluster_id,
                            version,
                            "bundle applied, overlay restart requested"
                        );
                        Ok(())
                    }
                    Ok(Err(e)) => {
                        // Previous tree is intact; try again next tick.
                        warn!(cluster_id = %self.cluster_id, error = %e, "bundle apply failed");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(cluster_id = %self.cluster_id, error = %e, "apply task panicked");
                        Ok(())
                    }
                }
            }
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    debug!(cluster_id = %self.cluster_id, "poller stopping");
                    return;
                }
            }
        }
    }
}
