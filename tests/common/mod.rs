//! Common test utilities for integration tests
#![allow(dead_code)]

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use nebula_fleet::api::AppState;
use nebula_fleet::ratelimit::{Capacities, RateLimiter};
use nebula_fleet::store::Store;
use nebula_fleet::token::{self, TokenKey};
use nebula_fleet::types::ReplicaRole;

pub const NODE_TOKEN_HEADER: &str = "x-nebula-node-token";
pub const CLUSTER_TOKEN_HEADER: &str = "x-nebula-cluster-token";

/// Everything a test needs to talk to a seeded control plane.
pub struct TestPlane {
    pub router: Router,
    pub state: AppState,
    pub store: Store,
    pub tenant_id: Uuid,
    pub cluster_id: Uuid,
    pub cluster_token: String,
    pub admin_node_id: Uuid,
    pub admin_token: String,
    pub member_node_id: Uuid,
    pub member_token: String,
}

fn test_key() -> TokenKey {
    TokenKey::new(vec![42u8; 32]).unwrap()
}

/// Build a router in the given mode over a fresh in-memory store seeded
/// with one tenant, one cluster, an admin node, and a plain member node.
pub fn seeded_plane(mode: ReplicaRole) -> TestPlane {
    let store = Store::open_in_memory().unwrap();
    seeded_plane_with_store(mode, store)
}

/// Same, over a shared store (used to model a master and a replica serving
/// one database).
pub fn seeded_plane_with_store(mode: ReplicaRole, store: Store) -> TestPlane {
    let key = test_key();

    let tenant = store.create_tenant(&format!("acme-{}", Uuid::new_v4())).unwrap();

    let cluster_token = token::generate();
    let cluster = store
        .create_cluster(
            tenant.id,
            "edge",
            &token::hash(&cluster_token, &key),
            false,
            4242,
        )
        .unwrap();

    let admin_token = token::generate();
    let admin = store
        .create_node(
            tenant.id,
            cluster.id,
            "admin-0",
            &token::hash(&admin_token, &key),
            1300,
            true,
        )
        .unwrap();

    let member_token = token::generate();
    let member = store
        .create_node(
            tenant.id,
            cluster.id,
            "member-0",
            &token::hash(&member_token, &key),
            1300,
            false,
        )
        .unwrap();

    let state = AppState {
        store: store.clone(),
        token_key: key,
        limiter: Arc::new(RateLimiter::new(Capacities::default())),
        mode,
        instance_id: Uuid::new_v4(),
        public_url: "http://cp-test:8080".to_string(),
    };
    let router = nebula_fleet::api::router(state.clone());

    TestPlane {
        router,
        state,
        store,
        tenant_id: tenant.id,
        cluster_id: cluster.id,
        cluster_token,
        admin_node_id: admin.id,
        admin_token,
        member_node_id: member.id,
        member_token,
    }
}

impl TestPlane {
    /// Drive the cluster's config version to exactly `target` with
    /// innocuous MTU updates.
    pub fn force_version(&self, target: i64) {
        let mut mtu = 1400;
        loop {
            let current = self.store.config_version(self.cluster_id).unwrap();
            if current >= target {
                assert_eq!(current, target, "overshot the target version");
                return;
            }
            self.store
                .update_node_mtu(self.cluster_id, self.member_node_id, mtu)
                .unwrap();
            mtu = if mtu == 1400 { 1420 } else { 1400 };
        }
    }

    pub fn version(&self) -> i64 {
        self.store.config_version(self.cluster_id).unwrap()
    }

    /// A second instance in replica mode serving the same store.
    pub fn replica_router(&self) -> Router {
        let mut state = self.state.clone();
        state.mode = ReplicaRole::Replica;
        state.instance_id = Uuid::new_v4();
        nebula_fleet::api::router(state)
    }
}

/// Send one request through the router.
pub async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    router.clone().oneshot(request).await.unwrap()
}

/// Read a response body as JSON.
pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    }
}

/// Read a response body raw.
pub async fn raw_body(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

/// Build a gzipped tar from (name, contents) pairs.
pub fn build_bundle(members: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// A bundle carrying all required members and the given `config.yml` text.
pub fn complete_bundle(config: &str) -> Vec<u8> {
    build_bundle(&[
        ("config.yml", config.as_bytes()),
        ("ca.crt", b"ca"),
        ("crl.pem", b"crl"),
        ("host.crt", b"cert"),
        ("host.key", b"key"),
    ])
}
