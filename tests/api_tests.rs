//! End-to-end tests of the control-plane HTTP surface

mod common;

use axum::body::Body;
use axum::http::Request;
use common::*;
use nebula_fleet::types::ReplicaRole;
use pretty_assertions::assert_eq;
use serde_json::json;

fn json_request(
    method: &str,
    uri: &str,
    token_header: (&str, &str),
    body: serde_json::Value,
) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header(token_header.0, token_header.1)
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn bare_request(method: &str, uri: &str, token_header: (&str, &str)) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(token_header.0, token_header.1)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn node_creation_bumps_version() {
    let plane = seeded_plane(ReplicaRole::Master);
    plane.force_version(7);

    let response = send(
        &plane.router,
        json_request(
            "POST",
            "/api/v1/nodes",
            (NODE_TOKEN_HEADER, &plane.admin_token),
            json!({"name": "n1", "mtu": 1420}),
        ),
    )
    .await;
    assert_eq!(response.status(), 201);
    let body = json_body(response).await;
    assert!(body["data"]["node_id"].is_string());
    let node_token = body["data"]["node_token"].as_str().unwrap();
    assert!(node_token.len() >= 41, "token too short: {}", node_token.len());

    let response = send(
        &plane.router,
        bare_request(
            "GET",
            "/api/v1/config/version",
            (NODE_TOKEN_HEADER, &plane.member_token),
        ),
    )
    .await;
    assert_eq!(response.status(), 200);
    assert_eq!(json_body(response).await["data"]["version"], json!(8));
}

#[tokio::test]
async fn conditional_bundle_download() {
    let plane = seeded_plane(ReplicaRole::Master);

    let upload = |blob: Vec<u8>| {
        Request::builder()
            .method("POST")
            .uri("/api/v1/config/bundle")
            .header(NODE_TOKEN_HEADER, &plane.admin_token)
            .header("content-type", "application/gzip")
            .body(Body::from(blob))
            .unwrap()
    };

    let response = send(&plane.router, upload(complete_bundle("tun:\n  mtu: 1300\n"))).await;
    assert_eq!(response.status(), 200);
    let v1 = json_body(response).await["data"]["version"].as_i64().unwrap();

    // Holding the current version: 304, no body.
    let response = send(
        &plane.router,
        bare_request(
            "GET",
            &format!("/api/v1/config/bundle?current_version={v1}"),
            (NODE_TOKEN_HEADER, &plane.member_token),
        ),
    )
    .await;
    assert_eq!(response.status(), 304);
    assert_eq!(
        response.headers()["x-config-version"].to_str().unwrap(),
        v1.to_string()
    );

    // Second upload advances the version; the same request now yields the
    // blob.
    let second_blob = complete_bundle("tun:\n  mtu: 1420\n");
    let response = send(&plane.router, upload(second_blob.clone())).await;
    assert_eq!(response.status(), 200);
    let v2 = json_body(response).await["data"]["version"].as_i64().unwrap();
    assert_eq!(v2, v1 + 1);

    let response = send(
        &plane.router,
        bare_request(
            "GET",
            &format!("/api/v1/config/bundle?current_version={v1}"),
            (NODE_TOKEN_HEADER, &plane.member_token),
        ),
    )
    .await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["x-config-version"].to_str().unwrap(),
        v2.to_string()
    );
    assert!(
        response.headers()["content-disposition"]
            .to_str()
            .unwrap()
            .contains(&format!("bundle-v{v2}.tar.gz"))
    );
    assert_eq!(raw_body(response).await, second_blob);

    // The etag validator works like the query parameter.
    let request = Request::builder()
        .method("GET")
        .uri("/api/v1/config/bundle")
        .header(NODE_TOKEN_HEADER, &plane.member_token)
        .header("if-none-match", format!("\"v{v2}\""))
        .body(Body::empty())
        .unwrap();
    let response = send(&plane.router, request).await;
    assert_eq!(response.status(), 304);
}

#[tokio::test]
async fn invalid_routes_are_rejected_without_side_effects() {
    let plane = seeded_plane(ReplicaRole::Master);
    let before = plane.version();

    let response = send(
        &plane.router,
        json_request(
            "PUT",
            "/api/v1/routes",
            (NODE_TOKEN_HEADER, &plane.member_token),
            json!({"routes": ["10.0.0.0/24", "not-a-cidr"]}),
        ),
    )
    .await;
    assert_eq!(response.status(), 400);
    assert_eq!(json_body(response).await["error"], json!("BadRequest"));

    let response = send(
        &plane.router,
        bare_request(
            "GET",
            "/api/v1/routes",
            (NODE_TOKEN_HEADER, &plane.member_token),
        ),
    )
    .await;
    assert_eq!(json_body(response).await["data"]["routes"], json!([]));
    assert_eq!(plane.version(), before);
}

#[tokio::test]
async fn valid_routes_replace_and_bump() {
    let plane = seeded_plane(ReplicaRole::Master);
    let before = plane.version();

    let response = send(
        &plane.router,
        json_request(
            "PUT",
            "/api/v1/routes",
            (NODE_TOKEN_HEADER, &plane.member_token),
            json!({"routes": ["10.0.0.0/24", "fd00::/64"]}),
        ),
    )
    .await;
    assert_eq!(response.status(), 200);
    assert_eq!(plane.version(), before + 1);

    let response = send(
        &plane.router,
        bare_request(
            "GET",
            "/api/v1/routes/cluster",
            (NODE_TOKEN_HEADER, &plane.admin_token),
        ),
    )
    .await;
    let body = json_body(response).await;
    let groups = body["data"]["routes"].as_array().unwrap();
    // Creation order: admin first, then the member carrying the routes.
    assert_eq!(groups[0]["routes"], json!([]));
    assert_eq!(groups[1]["routes"], json!(["10.0.0.0/24", "fd00::/64"]));
}

#[tokio::test]
async fn replica_rejects_writes_and_master_accepts() {
    let plane = seeded_plane(ReplicaRole::Master);
    let replica = plane.replica_router();

    // The replica knows who the master is.
    plane
        .store
        .upsert_replica(
            plane.state.instance_id,
            "http://cp-master:8080",
            ReplicaRole::Master,
        )
        .unwrap();

    let before = plane.version();
    let response = send(
        &replica,
        json_request(
            "POST",
            "/api/v1/nodes",
            (NODE_TOKEN_HEADER, &plane.admin_token),
            json!({"name": "n2"}),
        ),
    )
    .await;
    assert_eq!(response.status(), 503);
    let body = json_body(response).await;
    assert_eq!(body["error"], json!("ReplicaReadOnly"));
    assert_eq!(body["master_url"], json!("http://cp-master:8080"));
    assert_eq!(plane.version(), before, "replica write must not change state");

    // Reads pass through on the replica.
    let response = send(
        &replica,
        bare_request(
            "GET",
            "/api/v1/config/version",
            (NODE_TOKEN_HEADER, &plane.member_token),
        ),
    )
    .await;
    assert_eq!(response.status(), 200);

    let response = send(
        &plane.router,
        json_request(
            "POST",
            "/api/v1/nodes",
            (NODE_TOKEN_HEADER, &plane.admin_token),
            json!({"name": "n2"}),
        ),
    )
    .await;
    assert_eq!(response.status(), 201);
}

#[tokio::test]
async fn cluster_token_rotation_invalidates_immediately() {
    let plane = seeded_plane(ReplicaRole::Master);
    let t1 = plane.cluster_token.clone();

    let response = send(
        &plane.router,
        bare_request(
            "POST",
            "/api/v1/tokens/cluster/rotate",
            (CLUSTER_TOKEN_HEADER, &t1),
        ),
    )
    .await;
    assert_eq!(response.status(), 200);
    let t2 = json_body(response).await["data"]["token"]
        .as_str()
        .unwrap()
        .to_string();
    assert_ne!(t1, t2);

    let response = send(
        &plane.router,
        bare_request("GET", "/api/v1/topology", (CLUSTER_TOKEN_HEADER, &t1)),
    )
    .await;
    assert_eq!(response.status(), 401);

    let response = send(
        &plane.router,
        bare_request("GET", "/api/v1/topology", (CLUSTER_TOKEN_HEADER, &t2)),
    )
    .await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn node_token_rotation_keeps_exactly_one_token_valid() {
    let plane = seeded_plane(ReplicaRole::Master);

    let rotate = bare_request(
        "POST",
        &format!("/api/v1/nodes/{}/token", plane.member_node_id),
        (NODE_TOKEN_HEADER, &plane.admin_token),
    );
    let first = json_body(send(&plane.router, rotate).await).await["data"]["token"]
        .as_str()
        .unwrap()
        .to_string();

    let rotate = bare_request(
        "POST",
        &format!("/api/v1/nodes/{}/token", plane.member_node_id),
        (NODE_TOKEN_HEADER, &plane.admin_token),
    );
    let second = json_body(send(&plane.router, rotate).await).await["data"]["token"]
        .as_str()
        .unwrap()
        .to_string();

    let probe = |token: &str| {
        bare_request("GET", "/api/v1/routes", (NODE_TOKEN_HEADER, token))
    };
    assert_eq!(send(&plane.router, probe(&first)).await.status(), 401);
    assert_eq!(send(&plane.router, probe(&second)).await.status(), 200);
    assert_eq!(
        send(&plane.router, probe(&plane.member_token)).await.status(),
        401
    );
}

#[tokio::test]
async fn admin_gate_is_a_distinct_403_with_opaque_message() {
    let plane = seeded_plane(ReplicaRole::Master);

    let response = send(
        &plane.router,
        bare_request(
            "GET",
            "/api/v1/nodes",
            (NODE_TOKEN_HEADER, &plane.member_token),
        ),
    )
    .await;
    assert_eq!(response.status(), 403);
    let body = json_body(response).await;
    assert_eq!(body["error"], json!("Forbidden"));
    assert_eq!(body["message"], json!("Authentication failed"));
}

#[tokio::test]
async fn missing_or_short_tokens_are_opaque_401s() {
    let plane = seeded_plane(ReplicaRole::Master);

    let request = Request::builder()
        .method("GET")
        .uri("/api/v1/routes")
        .body(Body::empty())
        .unwrap();
    let response = send(&plane.router, request).await;
    assert_eq!(response.status(), 401);
    let body = json_body(response).await;
    assert_eq!(body["error"], json!("UnauthorizedGeneric"));
    assert_eq!(body["message"], json!("Authentication failed"));

    let response = send(
        &plane.router,
        bare_request("GET", "/api/v1/routes", (NODE_TOKEN_HEADER, "too-short")),
    )
    .await;
    assert_eq!(response.status(), 401);
    assert_eq!(
        json_body(response).await["error"],
        json!("UnauthorizedGeneric")
    );
}

#[tokio::test]
async fn request_ids_are_propagated_and_minted() {
    let plane = seeded_plane(ReplicaRole::Master);

    let inbound = uuid::Uuid::new_v4();
    let request = Request::builder()
        .method("GET")
        .uri("/api/v1/routes")
        .header("x-request-id", inbound.to_string())
        .body(Body::empty())
        .unwrap();
    let response = send(&plane.router, request).await;
    assert_eq!(
        response.headers()["x-request-id"].to_str().unwrap(),
        inbound.to_string()
    );
    let body = json_body(response).await;
    assert_eq!(body["request_id"], json!(inbound.to_string()));

    // Without an inbound id, one is minted.
    let response = send(&plane.router, bare_request("GET", "/health/live", ("accept", "*/*"))).await;
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn invalid_bundles_do_not_bump_the_version() {
    let plane = seeded_plane(ReplicaRole::Master);
    let before = plane.version();

    let cases: Vec<(Vec<u8>, u16, &str)> = vec![
        (b"not gzip at all".to_vec(), 400, "BadRequest"),
        (
            build_bundle(&[
                ("config.yml", b"ok: true\n".as_slice()),
                ("ca.crt", b"ca".as_slice()),
                ("crl.pem", b"crl".as_slice()),
                ("host.crt", b"cert".as_slice()),
            ]),
            400,
            "BadRequest",
        ),
        (
            build_bundle(&[
                ("config.yml", b"pki: [unclosed".as_slice()),
                ("ca.crt", b"ca".as_slice()),
                ("crl.pem", b"crl".as_slice()),
                ("host.crt", b"cert".as_slice()),
                ("host.key", b"key".as_slice()),
            ]),
            400,
            "BadRequest",
        ),
        (
            vec![0u8; nebula_fleet::bundle::MAX_BUNDLE_BYTES + 1024],
            413,
            "PayloadTooLarge",
        ),
    ];

    for (blob, status, kind) in cases {
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/config/bundle")
            .header(NODE_TOKEN_HEADER, &plane.admin_token)
            .body(Body::from(blob))
            .unwrap();
        let response = send(&plane.router, request).await;
        assert_eq!(response.status(), status);
        assert_eq!(json_body(response).await["error"], json!(kind));
    }

    assert_eq!(plane.version(), before);
    assert!(plane.store.latest_bundle(plane.cluster_id).unwrap().is_none());
}

#[tokio::test]
async fn bundle_upload_rate_limit_yields_429_with_retry_hint() {
    let plane = seeded_plane(ReplicaRole::Master);

    // Burn the per-cluster budget with cheap invalid uploads.
    for _ in 0..10 {
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/config/bundle")
            .header(NODE_TOKEN_HEADER, &plane.admin_token)
            .body(Body::from("garbage"))
            .unwrap();
        assert_eq!(send(&plane.router, request).await.status(), 400);
    }

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/config/bundle")
        .header(NODE_TOKEN_HEADER, &plane.admin_token)
        .body(Body::from("garbage"))
        .unwrap();
    let response = send(&plane.router, request).await;
    assert_eq!(response.status(), 429);
    assert!(response.headers().contains_key("retry-after"));
    assert_eq!(
        json_body(response).await["error"],
        json!("RateLimitExceeded")
    );
}

#[tokio::test]
async fn mtu_bounds_are_enforced() {
    let plane = seeded_plane(ReplicaRole::Master);

    for (mtu, status) in [(1279, 400), (1280, 200), (9000, 200), (9001, 400)] {
        let response = send(
            &plane.router,
            json_request(
                "PATCH",
                &format!("/api/v1/nodes/{}/mtu", plane.member_node_id),
                (NODE_TOKEN_HEADER, &plane.admin_token),
                json!({"mtu": mtu}),
            ),
        )
        .await;
        assert_eq!(response.status(), status, "mtu {mtu}");
    }
}

#[tokio::test]
async fn node_listing_paginates() {
    let plane = seeded_plane(ReplicaRole::Master);

    let response = send(
        &plane.router,
        bare_request(
            "GET",
            "/api/v1/nodes?page=1&page_size=1",
            (NODE_TOKEN_HEADER, &plane.admin_token),
        ),
    )
    .await;
    let body = json_body(response).await;
    assert_eq!(body["data"]["nodes"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"]["page_size"], json!(1));
    assert_eq!(body["data"]["total"], json!(2));
}

#[tokio::test]
async fn topology_reflects_lighthouse_and_relay_assignment() {
    let plane = seeded_plane(ReplicaRole::Master);

    let response = send(
        &plane.router,
        json_request(
            "POST",
            "/api/v1/topology/lighthouse",
            (CLUSTER_TOKEN_HEADER, &plane.cluster_token),
            json!({
                "node_id": plane.member_node_id,
                "public_ip": "203.0.113.9",
                "port": 4242
            }),
        ),
    )
    .await;
    assert_eq!(response.status(), 200);

    let response = send(
        &plane.router,
        json_request(
            "POST",
            "/api/v1/topology/relay",
            (CLUSTER_TOKEN_HEADER, &plane.cluster_token),
            json!({"node_id": plane.admin_node_id}),
        ),
    )
    .await;
    assert_eq!(response.status(), 200);

    let response = send(
        &plane.router,
        bare_request(
            "GET",
            "/api/v1/topology",
            (CLUSTER_TOKEN_HEADER, &plane.cluster_token),
        ),
    )
    .await;
    let body = json_body(response).await;
    let lighthouses = body["data"]["lighthouses"].as_array().unwrap();
    assert_eq!(lighthouses.len(), 1);
    assert_eq!(lighthouses[0]["public_ip"], json!("203.0.113.9"));
    assert_eq!(lighthouses[0]["port"], json!(4242));
    assert_eq!(body["data"]["relays"][0]["name"], json!("admin-0"));

    // Bad IP or port never lands.
    let response = send(
        &plane.router,
        json_request(
            "POST",
            "/api/v1/topology/lighthouse",
            (CLUSTER_TOKEN_HEADER, &plane.cluster_token),
            json!({
                "node_id": plane.member_node_id,
                "public_ip": "not-an-ip",
                "port": 4242
            }),
        ),
    )
    .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn health_endpoints_are_unauthenticated() {
    let plane = seeded_plane(ReplicaRole::Master);

    let response = send(
        &plane.router,
        Request::builder()
            .method("GET")
            .uri("/health/live")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), 200);
    assert_eq!(json_body(response).await["status"], json!("ok"));

    let response = send(
        &plane.router,
        Request::builder()
            .method("GET")
            .uri("/health/ready")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), 200);

    let response = send(
        &plane.router,
        Request::builder()
            .method("GET")
            .uri("/health/master")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), 200);
    assert_eq!(json_body(response).await["master"], json!(true));
}

#[tokio::test]
async fn delete_node_returns_204_and_bumps() {
    let plane = seeded_plane(ReplicaRole::Master);
    let before = plane.version();

    let response = send(
        &plane.router,
        bare_request(
            "DELETE",
            &format!("/api/v1/nodes/{}", plane.member_node_id),
            (NODE_TOKEN_HEADER, &plane.admin_token),
        ),
    )
    .await;
    assert_eq!(response.status(), 204);
    assert_eq!(plane.version(), before + 1);

    // The deleted node's token is gone with it.
    let response = send(
        &plane.router,
        bare_request(
            "GET",
            "/api/v1/routes",
            (NODE_TOKEN_HEADER, &plane.member_token),
        ),
    )
    .await;
    assert_eq!(response.status(), 401);
}
