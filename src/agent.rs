//! Node agent: per-cluster worker composition and lifecycle
//!
//! ## Overview
//! - One worker per configured cluster: poller + applier + supervisor +
//!   health monitor
//! - SIGTERM/SIGINT cancels a root shutdown channel
//! - Workers get a deadline to exit, then are abandoned
//!
//! Workers for distinct clusters are fully independent; one cluster's
//! failures never touch another's.

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::client::ControlPlaneClient;
use crate::config::{AgentClusterConfig, AgentConfig};
use crate::health::HealthMonitor;
use crate::poller::Poller;
use crate::supervisor::ProcessSupervisor;

fn spawn_cluster_worker(
    config: &AgentConfig,
    cluster: &AgentClusterConfig,
    workers: &mut JoinSet<()>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let clients: Vec<ControlPlaneClient> = config
        .control_plane_urls
        .iter()
        .map(|url| {
            ControlPlaneClient::builder()
                .base_url(url)
                .node_token(&cluster.node_token)
                .cluster_token(&cluster.cluster_token)
                .build()
        })
        .collect::<crate::client::Result<_>>()
        .with_context(|| format!("building clients for cluster {}", cluster.cluster_id))?;

    let supervisor = ProcessSupervisor::new(
        cluster.cluster_id,
        config.overlay_binary_path.clone(),
        cluster.config_dir.clone(),
    );
    let supervisor_handle = supervisor.handle();
    let health = HealthMonitor::new(cluster.cluster_id, config.control_plane_urls.clone());
    let poller = Poller::new(
        cluster.cluster_id,
        clients,
        cluster.config_dir.clone(),
        config.poll_interval(),
        supervisor_handle,
        health.clone(),
    );

    workers.spawn(supervisor.run(shutdown.clone()));
    workers.spawn(poller.run(shutdown.clone()));
    workers.spawn(health.run(shutdown));

    info!(cluster_id = %cluster.cluster_id, "cluster worker started");
    Ok(())
}

/// Block until SIGTERM or SIGINT arrives. Shared by both binaries.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, using ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => info!("SIGTERM received"),
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Run the agent until a termination signal arrives, then shut every
/// worker down within the configured deadline.
pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = JoinSet::new();

    for cluster in &config.clusters {
        spawn_cluster_worker(&config, cluster, &mut workers, shutdown_rx.clone())?;
    }

    wait_for_signal().await;
    info!("shutting down agent workers");
    let _ = shutdown_tx.send(true);

    let deadline = config.shutdown_deadline();
    let drained = tokio::time::timeout(deadline, async {
        while workers.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            deadline_secs = deadline.as_secs(),
            remaining = workers.len(),
            "shutdown deadline exceeded, abandoning remaining workers"
        );
        workers.abort_all();
    }

    info!("agent stopped");
    Ok(())
}
