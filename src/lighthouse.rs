//! Server-side lighthouse supervisor
//!
//! ## Overview
//! - One loop per instance; one overlay child per opted-in cluster
//! - Rebuild on config-version delta, respawn on child death
//! - Atomic on-disk tree swap so readers never see a half-written config
//!
//! Every control-plane instance (master and replicas alike) runs this, so
//! the fleet collectively provides N-way redundant lighthouses.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::Store;
use crate::types::{Cluster, ClusterPki};

/// How long a child gets to exit after SIGTERM before SIGKILL.
const GRACEFUL_STOP: Duration = Duration::from_secs(5);

/// Synthesized overlay configuration: this process is a lighthouse bound
/// to the cluster's port on all interfaces.
#[derive(Serialize)]
struct LighthouseConfig<'a> {
    pki: PkiSection<'a>,
    lighthouse: LighthouseSection,
    listen: ListenSection,
}

#[derive(Serialize)]
struct PkiSection<'a> {
    ca: &'a str,
    cert: &'a str,
    key: &'a str,
}

#[derive(Serialize)]
struct LighthouseSection {
    am_lighthouse: bool,
}

#[derive(Serialize)]
struct ListenSection {
    host: &'static str,
    port: u16,
}

/// Render the config the spawned child reads. Paths are relative to the
/// cluster tree the files land in.
pub fn synthesize_config(port: u16) -> String {
    let config = LighthouseConfig {
        pki: PkiSection {
            ca: "ca.crt",
            cert: "host.crt",
            key: "host.key",
        },
        lighthouse: LighthouseSection { am_lighthouse: true },
        listen: ListenSection {
            host: "0.0.0.0",
            port,
        },
    };
    serde_yaml::to_string(&config).unwrap_or_default()
}

#[cfg(unix)]
fn restrict_dir(builder: &mut std::fs::DirBuilder) {
    use std::os::unix::fs::DirBuilderExt;
    builder.mode(0o700);
}

#[cfg(not(unix))]
fn restrict_dir(_builder: &mut std::fs::DirBuilder) {}

fn write_secret_file(path: &Path, data: &[u8]) -> io::Result<()> {
    std::fs::write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Write the full cluster tree into a staging directory next to the target
/// and swap it in with a single rename. Returns the target path.
pub fn write_cluster_tree(
    base: &Path,
    cluster_id: Uuid,
    pki: &ClusterPki,
    config_yaml: &str,
) -> io::Result<PathBuf> {
    let nonce: u64 = rand::thread_rng().r#gen();
    let target = base.join(cluster_id.to_string());
    let staging = base.join(format!(".staging.{cluster_id}.{nonce:016x}"));
    let displaced = base.join(format!(".old.{cluster_id}.{nonce:016x}"));

    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    restrict_dir(&mut builder);
    builder.create(&staging)?;

    let result = (|| {
        write_secret_file(&staging.join("config.yml"), config_yaml.as_bytes())?;
        write_secret_file(&staging.join("ca.crt"), &pki.ca_cert)?;
        write_secret_file(&staging.join("crl.pem"), &pki.crl)?;
        write_secret_file(&staging.join("host.crt"), &pki.host_cert)?;
        write_secret_file(&staging.join("host.key"), &pki.host_key)?;

        if target.exists() {
            std::fs::rename(&target, &displaced)?;
        }
        std::fs::rename(&staging, &target)?;
        if displaced.exists() {
            std::fs::remove_dir_all(&displaced)?;
        }
        Ok(())
    })();

    if result.is_err() {
        // Put the previous tree back if the swap half-happened.
        if !target.exists() && displaced.exists() {
            let _ = std::fs::rename(&displaced, &target);
        }
        let _ = std::fs::remove_dir_all(&staging);
    }
    result.map(|()| target)
}

async fn stop_child(mut child: Child, cluster_id: Uuid) {
    let pid = child.id();
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(GRACEFUL_STOP, child.wait()).await.is_ok() {
            debug!(cluster_id = %cluster_id, pid, "lighthouse child exited gracefully");
            return;
        }
        warn!(cluster_id = %cluster_id, pid, "lighthouse child ignored SIGTERM, killing");
    }
    let _ = child.kill().await;
}

/// Owns one overlay child per `provide_lighthouse` cluster on this
/// instance. Driven purely by the store: it compares the cluster's
/// `config_version` to this instance's recorded running version.
pub struct LighthouseSupervisor {
    store: Store,
    instance_id: Uuid,
    base_path: PathBuf,
    overlay_binary: PathBuf,
    interval: Duration,
    children: HashMap<Uuid, Child>,
}

impl LighthouseSupervisor {
    pub fn new(
        store: Store,
        instance_id: Uuid,
        base_path: PathBuf,
        overlay_binary: PathBuf,
        interval: Duration,
    ) -> Self {
        LighthouseSupervisor {
            store,
            instance_id,
            base_path,
            overlay_binary,
            interval,
            children: HashMap::new(),
        }
    }

    /// Supervisor loop; exits after stopping all children when the
    /// shutdown channel flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    self.shutdown_all().await;
                    return;
                }
            }
        }
    }

    async fn tick(&mut self) {
        let clusters = match self.store.lighthouse_clusters() {
            Ok(clusters) => clusters,
            Err(e) => {
                warn!(error = %e, "lighthouse cluster enumeration failed");
                return;
            }
        };

        for cluster in clusters {
            let running = self
                .store
                .running_config_version(cluster.id, self.instance_id)
                .unwrap_or(0);
            let child_dead = match self.children.get_mut(&cluster.id) {
                None => true,
                Some(child) => child.try_wait().map(|s| s.is_some()).unwrap_or(true),
            };

            if cluster.config_version > running {
                debug!(
                    cluster_id = %cluster.id,
                    from = running,
                    to = cluster.config_version,
                    "config version advanced, rebuilding lighthouse"
                );
                self.rebuild(&cluster, true).await;
            } else if child_dead {
                debug!(cluster_id = %cluster.id, "lighthouse child dead, respawning");
                self.rebuild(&cluster, false).await;
            }
        }
    }

    /// Rewrite the on-disk tree (when the version moved), replace the
    /// child, and record the running version for this instance.
    async fn rebuild(&mut self, cluster: &Cluster, rewrite_tree: bool) {
        let target = self.base_path.join(cluster.id.to_string());

        if rewrite_tree || !target.exists() {
            let pki = match self.store.get_cluster_pki(cluster.id) {
                Ok(pki) => pki,
                Err(e) => {
                    warn!(cluster_id = %cluster.id, error = %e, "cannot load PKI material");
                    return;
                }
            };
            let config = synthesize_config(cluster.lighthouse_port);
            if let Err(e) = write_cluster_tree(&self.base_path, cluster.id, &pki, &config) {
                warn!(cluster_id = %cluster.id, error = %e, "cluster tree write failed");
                return;
            }
        }

        if let Some(old) = self.children.remove(&cluster.id) {
            stop_child(old, cluster.id).await;
        }

        let config_path = target.join("config.yml");
        let child = Command::new(&self.overlay_binary)
            .arg("-config")
            .arg(&config_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn();

        match child {
            Ok(child) => {
                info!(
                    cluster_id = %cluster.id,
                    pid = child.id(),
                    version = cluster.config_version,
                    "lighthouse child started"
                );
                self.children.insert(cluster.id, child);
                if let Err(e) = self.store.upsert_cluster_state(
                    cluster.id,
                    self.instance_id,
                    cluster.config_version,
                ) {
                    warn!(cluster_id = %cluster.id, error = %e, "cluster state upsert failed");
                }
            }
            Err(e) => {
                warn!(
                    cluster_id = %cluster.id,
                    binary = %self.overlay_binary.display(),
                    error = %e,
                    "lighthouse spawn failed"
                );
            }
        }
    }

    async fn shutdown_all(&mut self) {
        info!(children = self.children.len(), "stopping lighthouse children");
        for (cluster_id, child) in self.children.drain() {
            stop_child(child, cluster_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pki() -> ClusterPki {
        ClusterPki {
            ca_cert: b"ca-cert".to_vec(),
            ca_key: b"ca-key".to_vec(),
            crl: b"crl".to_vec(),
            host_cert: b"host-cert".to_vec(),
            host_key: b"host-key".to_vec(),
        }
    }

    #[test]
    fn synthesized_config_is_parseable_yaml() {
        let text = synthesize_config(4242);
        let value: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        assert_eq!(value["lighthouse"]["am_lighthouse"], serde_yaml::Value::Bool(true));
        assert_eq!(value["listen"]["port"], serde_yaml::Value::from(4242));
    }

    #[test]
    fn tree_write_lands_all_files_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let cluster_id = Uuid::new_v4();
        let target =
            write_cluster_tree(dir.path(), cluster_id, &pki(), &synthesize_config(4242)).unwrap();

        for name in ["config.yml", "ca.crt", "crl.pem", "host.crt", "host.key"] {
            assert!(target.join(name).exists(), "missing {name}");
        }
        // No staging or displaced residue.
        let residue: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(residue.is_empty());
    }

    #[test]
    fn tree_rewrite_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let cluster_id = Uuid::new_v4();
        write_cluster_tree(dir.path(), cluster_id, &pki(), "old: 1\n").unwrap();

        let target = write_cluster_tree(dir.path(), cluster_id, &pki(), "new: 2\n").unwrap();
        let text = std::fs::read_to_string(target.join("config.yml")).unwrap();
        assert_eq!(text, "new: 2\n");
    }

    #[cfg(unix)]
    #[test]
    fn tree_and_files_have_restricted_modes() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let cluster_id = Uuid::new_v4();
        let target =
            write_cluster_tree(dir.path(), cluster_id, &pki(), &synthesize_config(4242)).unwrap();

        let dir_mode = std::fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        let key_mode = std::fs::metadata(target.join("host.key"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(key_mode, 0o600);
    }
}
