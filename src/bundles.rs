//! Configuration bundle upload and download
//!
//! ## Overview
//! - Admin-gated upload: validate, store, bump the version, one transaction
//! - Conditional download via `If-None-Match: "v<N>"` or `?current_version=N`
//! - Cheap scalar version read for the daemon poller

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::api::{AppState, ok};
use crate::auth::{AdminIdentity, NodeIdentity};
use crate::bundle::validate_bundle;
use crate::error::{Result, ServiceError};
use crate::ratelimit::Category;
use crate::types::{UploadBundleResponse, VersionResponse};

/// Response header carrying the cluster's current config version.
pub const CONFIG_VERSION_HEADER: &str = "x-config-version";

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct DownloadQuery {
    pub current_version: Option<i64>,
}

/// The version the client claims to hold, from the query parameter or an
/// `If-None-Match: "v<N>"` validator.
fn client_version(query: &DownloadQuery, headers: &HeaderMap) -> Option<i64> {
    if let Some(v) = query.current_version {
        return Some(v);
    }
    let raw = headers.get(IF_NONE_MATCH)?.to_str().ok()?;
    raw.trim().trim_matches('"').strip_prefix('v')?.parse().ok()
}

/// `GET /api/v1/config/version`
pub async fn read_version(
    State(state): State<AppState>,
    identity: NodeIdentity,
) -> Result<impl IntoResponse> {
    let version = state.store.config_version(identity.cluster_id)?;
    Ok(ok(VersionResponse { version }))
}

/// `GET /api/v1/config/bundle`
///
/// Returns 304 with the current version when the client already holds it;
/// otherwise the raw gzipped tar plus the version header and a filename
/// hint. Served by any replica.
pub async fn download_bundle(
    State(state): State<AppState>,
    identity: NodeIdentity,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let current = state.store.config_version(identity.cluster_id)?;

    if client_version(&query, &headers) == Some(current) {
        let response = (
            StatusCode::NOT_MODIFIED,
            [
                (CONFIG_VERSION_HEADER, current.to_string()),
                (ETAG.as_str(), format!("\"v{current}\"")),
            ],
        )
            .into_response();
        return Ok(response);
    }

    let record = state
        .store
        .latest_bundle(identity.cluster_id)?
        .ok_or(ServiceError::NotFound)?;

    let response = (
        StatusCode::OK,
        [
            (CONFIG_VERSION_HEADER, current.to_string()),
            (ETAG.as_str(), format!("\"v{current}\"")),
            (CONTENT_TYPE.as_str(), "application/gzip".to_string()),
            (
                CONTENT_DISPOSITION.as_str(),
                format!("attachment; filename=\"bundle-v{current}.tar.gz\""),
            ),
        ],
        record.data,
    )
        .into_response();
    Ok(response)
}

/// `POST /api/v1/config/bundle`
///
/// The body is the raw gzipped tar, no multipart wrapping. A bundle that
/// fails validation does not touch the store and therefore does not bump
/// the version.
pub async fn upload_bundle(
    State(state): State<AppState>,
    AdminIdentity(admin): AdminIdentity,
    body: Bytes,
) -> Result<impl IntoResponse> {
    state
        .limiter
        .allow(Category::BundleUpload, &admin.cluster_id.to_string())
        .check()?;

    validate_bundle(&body).map_err(ServiceError::from)?;

    let version = state.store.insert_bundle(
        admin.tenant_id,
        admin.cluster_id,
        &body,
        Some(admin.node_id),
    )?;

    tracing::info!(
        cluster_id = %admin.cluster_id,
        uploaded_by = %admin.node_id,
        version,
        bytes = body.len(),
        "bundle uploaded"
    );

    Ok(ok(UploadBundleResponse { version }))
}
