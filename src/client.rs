//! Control-plane REST client used by the node agent
//!
//! ## Overview
//! - Token-header authentication (node and cluster secrets)
//! - Typed JSON calls that unwrap the `{data: …}` envelope
//! - Conditional binary bundle download

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, IF_NONE_MATCH, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{debug, trace};

use crate::auth::{CLUSTER_TOKEN_HEADER, NODE_TOKEN_HEADER};
use crate::bundles::CONFIG_VERSION_HEADER;

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Authentication failed")]
    Unauthorized,

    #[error("Resource not found")]
    NotFound,

    #[error("Rate limited{}", .retry_after.map(|d| format!(" (retry after {d:?})")).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("Instance is a read-only replica{}", .master_url.as_deref().map(|u| format!(" (master at {u})")).unwrap_or_default())]
    ReplicaReadOnly { master_url: Option<String> },

    #[error("API error: {message} (code: {code})")]
    ApiError { code: u16, message: String },
}

impl ClientError {
    /// Check if this is an authentication error
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Unauthorized)
            || matches!(self, ClientError::ApiError { code, .. } if *code == 401)
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound)
            || matches!(self, ClientError::ApiError { code, .. } if *code == 404)
    }

    /// Check if this call is worth retrying, possibly elsewhere
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout
                | ClientError::ConnectionError(_)
                | ClientError::RateLimited { .. }
                | ClientError::ReplicaReadOnly { .. }
        ) || matches!(self, ClientError::ApiError { code, .. } if *code >= 500)
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Success envelope the control plane wraps payloads in.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// Failure envelope.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    master_url: Option<String>,
}

/// Outcome of a conditional bundle download.
#[derive(Debug, Clone)]
pub enum BundleFetch {
    /// The server's version matches what we hold.
    NotModified { version: i64 },
    /// A new blob plus the version it corresponds to.
    Fetched { version: i64, data: Vec<u8> },
}

/// Builder for ControlPlaneClient
#[derive(Debug, Clone)]
pub struct ControlPlaneClientBuilder {
    base_url: String,
    node_token: Option<String>,
    cluster_token: Option<String>,
    timeout: Duration,
}

impl Default for ControlPlaneClientBuilder {
    fn default() -> Self {
        ControlPlaneClientBuilder {
            base_url: "http://localhost:8080".to_string(),
            node_token: None,
            cluster_token: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ControlPlaneClientBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base URL
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the node token sent as `X-Nebula-Node-Token`
    pub fn node_token(mut self, token: impl Into<String>) -> Self {
        self.node_token = Some(token.into());
        self
    }

    /// Set the cluster token sent as `X-Nebula-Cluster-Token`
    pub fn cluster_token(mut self, token: impl Into<String>) -> Self {
        self.cluster_token = Some(token.into());
        self
    }

    /// Set the request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the client
    pub fn build(self) -> Result<ControlPlaneClient> {
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ClientError::ConnectionError(e.to_string()))?;
        Ok(ControlPlaneClient {
            base_url: self.base_url,
            node_token: self.node_token,
            cluster_token: self.cluster_token,
            timeout: self.timeout,
            client: Arc::new(client),
        })
    }
}

/// REST client for one control-plane base URL. Cheap to clone.
#[derive(Clone)]
pub struct ControlPlaneClient {
    base_url: String,
    node_token: Option<String>,
    cluster_token: Option<String>,
    timeout: Duration,
    client: Arc<Client>,
}

impl ControlPlaneClient {
    /// Create a new builder for the client
    pub fn builder() -> ControlPlaneClientBuilder {
        ControlPlaneClientBuilder::new()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Normalize URL path concatenation to avoid double slashes
    fn normalize_url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.node_token {
            if let Ok(value) = HeaderValue::from_str(token) {
                headers.insert(NODE_TOKEN_HEADER, value);
            }
        }
        if let Some(token) = &self.cluster_token {
            if let Ok(value) = HeaderValue::from_str(token) {
                headers.insert(CLUSTER_TOKEN_HEADER, value);
            }
        }
        headers
    }

    /// Make a GET request, unwrapping the `{data}` envelope
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.normalize_url(path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers())
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e, &url))?;

        trace!("Response status: {}", response.status());
        self.handle_response(response).await
    }

    /// Make a GET request for a bare JSON body (health endpoints are not
    /// enveloped)
    pub async fn get_bare<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.normalize_url(path);
        debug!("GET {} (bare)", url);

        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers())
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e, &url))?;

        if response.status().is_success() {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ClientError::RequestFailed(e.to_string()))?;
            deserialize_slice(&bytes)
        } else {
            Err(error_from_response(response).await)
        }
    }

    /// Make a POST request, unwrapping the `{data}` envelope
    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.normalize_url(path);
        debug!("POST {}", url);
        trace!("Request body: {:?}", serde_json::to_value(body).ok());

        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers())
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e, &url))?;

        trace!("Response status: {}", response.status());
        self.handle_response(response).await
    }

    /// Conditional binary GET of the configuration bundle.
    ///
    /// `current` is the version the caller already holds; when the server
    /// agrees it answers 304 and no body crosses the wire.
    pub async fn get_bundle(&self, current: Option<i64>) -> Result<BundleFetch> {
        let url = self.normalize_url("/api/v1/config/bundle");
        debug!("GET {} (bundle, current={:?})", url, current);

        let mut request = self.client.get(&url).headers(self.auth_headers());
        if let Some(v) = current {
            if let Ok(value) = HeaderValue::from_str(&format!("\"v{v}\"")) {
                request = request.header(IF_NONE_MATCH, value);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e, &url))?;

        let version = response
            .headers()
            .get(CONFIG_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok());

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                let version = version.or(current).ok_or_else(|| {
                    ClientError::ParseError("304 without a version header".to_string())
                })?;
                Ok(BundleFetch::NotModified { version })
            }
            status if status.is_success() => {
                let version = version.ok_or_else(|| {
                    ClientError::ParseError("bundle response missing version header".to_string())
                })?;
                let data = response
                    .bytes()
                    .await
                    .map_err(|e| ClientError::RequestFailed(e.to_string()))?
                    .to_vec();
                Ok(BundleFetch::Fetched { version, data })
            }
            _ => Err(error_from_response(response).await),
        }
    }

    /// Map reqwest errors to more specific error kinds
    fn map_reqwest_error(&self, error: reqwest::Error, url: &str) -> ClientError {
        if error.is_timeout() {
            ClientError::Timeout
        } else if error.is_connect() {
            ClientError::ConnectionError(format!(
                "failed to connect to {url}: connection refused or host unreachable"
            ))
        } else if error.is_request() {
            ClientError::ConnectionError(format!(
                "request to {url} failed after {:?}: {error}",
                self.timeout
            ))
        } else {
            ClientError::RequestFailed(error.to_string())
        }
    }

    /// Handle an enveloped HTTP response
    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        if response.status().is_success() {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ClientError::RequestFailed(e.to_string()))?;
            let envelope: Envelope<T> = deserialize_slice(&bytes)?;
            Ok(envelope.data)
        } else {
            Err(error_from_response(response).await)
        }
    }
}

/// Deserialize with path context so a schema drift names the exact field.
fn deserialize_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let deserializer = &mut serde_json::Deserializer::from_slice(bytes);
    serde_path_to_error::deserialize(deserializer).map_err(|err| {
        let path = err.path().to_string();
        ClientError::ParseError(format!(
            "failed to deserialize field '{}': {}",
            path,
            err.inner()
        ))
    })
}

async fn error_from_response(response: Response) -> ClientError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body: ErrorBody = match response.bytes().await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or(ErrorBody {
            error: String::new(),
            message: String::from_utf8_lossy(&bytes).into_owned(),
            master_url: None,
        }),
        Err(_) => ErrorBody {
            error: String::new(),
            message: "unreadable error body".to_string(),
            master_url: None,
        },
    };

    match status.as_u16() {
        401 | 403 => ClientError::Unauthorized,
        404 => ClientError::NotFound,
        429 => ClientError::RateLimited { retry_after },
        503 if body.error == "ReplicaReadOnly" => ClientError::ReplicaReadOnly {
            master_url: body.master_url,
        },
        code => ClientError::ApiError {
            code,
            message: body.message,
        },
    }
}

define_handler!(
    /// Configuration version and bundle operations.
    pub struct ConfigHandler;
);

impl ConfigHandler {
    /// Current config version for the authenticated node's cluster.
    pub async fn version(&self) -> Result<i64> {
        let v: crate::types::VersionResponse = self.client.get("/api/v1/config/version").await?;
        Ok(v.version)
    }

    /// Conditional bundle download.
    pub async fn bundle(&self, current: Option<i64>) -> Result<BundleFetch> {
        self.client.get_bundle(current).await
    }
}

define_handler!(
    /// Replica registry and master discovery.
    pub struct ReplicaHandler;
);

impl ReplicaHandler {
    /// The full replica registry.
    pub async fn list(&self) -> Result<Vec<crate::types::Replica>> {
        self.client.get("/api/v1/replicas").await
    }

    /// This instance's view of mastership; unauthenticated.
    pub async fn master_status(&self) -> Result<crate::types::MasterStatus> {
        self.client.get_bare("/health/master").await
    }

    /// Liveness of the instance behind this client's base URL.
    pub async fn live(&self) -> Result<serde_json::Value> {
        self.client.get_bare("/health/live").await
    }
}
