//! Control-plane server binary.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 store
//! initialization failure, 3 registry conflict (a fresh foreign master
//! already holds the lock).

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use nebula_fleet::agent::wait_for_signal;
use nebula_fleet::api::{self, AppState};
use nebula_fleet::config::{ServerConfig, ServerOpts, init_tracing};
use nebula_fleet::lighthouse::LighthouseSupervisor;
use nebula_fleet::ratelimit::{self, RateLimiter};
use nebula_fleet::replicas;
use nebula_fleet::store::Store;
use nebula_fleet::token;
use nebula_fleet::types::ReplicaRole;

const EXIT_CONFIG: u8 = 1;
const EXIT_STORE: u8 = 2;
const EXIT_REGISTRY: u8 = 3;

/// Shutdown grace for background subsystems.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(30);

/// First-run provisioning: create the named tenant/cluster when absent and
/// print the cluster token exactly once.
fn bootstrap(store: &Store, config: &ServerConfig) -> nebula_fleet::Result<()> {
    let Some(tenant_name) = &config.bootstrap_tenant else {
        return Ok(());
    };
    let tenant = match store.create_tenant(tenant_name) {
        Ok(tenant) => tenant,
        Err(e) if e.is_conflict() => {
            info!(tenant = %tenant_name, "bootstrap tenant already exists");
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    info!(tenant_id = %tenant.id, name = %tenant.name, "bootstrap tenant created");

    if let Some(cluster_name) = &config.bootstrap_cluster {
        let cluster_token = token::generate();
        let digest = token::hash(&cluster_token, &config.token_key);
        let cluster = store.create_cluster(tenant.id, cluster_name, &digest, false, 4242)?;
        info!(cluster_id = %cluster.id, name = %cluster.name, "bootstrap cluster created");
        // The only time the plaintext exists outside a response body.
        println!("cluster_id={}", cluster.id);
        println!("cluster_token={cluster_token}");
    }
    Ok(())
}

async fn serve(config: ServerConfig) -> ExitCode {
    let store = match Store::open(&config.db_path) {
        Ok(store) => store,
        Err(e) => {
            error!(path = %config.db_path.display(), error = %e, "store initialization failed");
            return ExitCode::from(EXIT_STORE);
        }
    };

    let instance_id = match store.instance_id(config.instance_id) {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "instance id initialization failed");
            return ExitCode::from(EXIT_STORE);
        }
    };

    if let Err(e) = bootstrap(&store, &config) {
        error!(error = %e, "bootstrap provisioning failed");
        return ExitCode::from(EXIT_STORE);
    }

    let public_url = config.public_url.to_string();
    if let Err(conflict) =
        replicas::register_instance(&store, instance_id, &public_url, config.mode)
    {
        error!(error = %conflict, "refusing to start");
        return ExitCode::from(EXIT_REGISTRY);
    }

    let limiter = Arc::new(RateLimiter::new(config.capacities));
    let state = AppState {
        store: store.clone(),
        token_key: config.token_key.clone(),
        limiter: limiter.clone(),
        mode: config.mode,
        instance_id,
        public_url: public_url.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = JoinSet::new();
    background.spawn(replicas::heartbeat_loop(
        store.clone(),
        instance_id,
        shutdown_rx.clone(),
    ));
    if config.mode == ReplicaRole::Master {
        background.spawn(replicas::prune_loop(store.clone(), shutdown_rx.clone()));
    }
    background.spawn(ratelimit::sweep_loop(limiter, shutdown_rx.clone()));
    background.spawn(
        LighthouseSupervisor::new(
            store.clone(),
            instance_id,
            config.lighthouse_base_path.clone(),
            config.overlay_binary.clone(),
            config.config_check_interval,
        )
        .run(shutdown_rx.clone()),
    );

    let app = api::router(state).into_make_service_with_connect_info::<SocketAddr>();
    let listener = match tokio::net::TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.listen_addr, error = %e, "cannot bind listener");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    info!(
        addr = %config.listen_addr,
        mode = config.mode.as_str(),
        instance_id = %instance_id,
        public_url = %public_url,
        "fleetd listening"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_signal())
        .await;
    if let Err(e) = served {
        error!(error = %e, "server error");
    }

    info!("stopping background tasks");
    let _ = shutdown_tx.send(true);
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while background.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = background.len(), "background tasks exceeded shutdown grace");
        background.abort_all();
    }

    info!("fleetd stopped");
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = ServerOpts::parse();
    let log_level = opts.log_level.clone();
    let log_format = opts.log_format;
    let config = match opts.validate() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    init_tracing(&log_level, log_format);
    serve(config).await
}
