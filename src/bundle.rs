//! Configuration bundle validation
//!
//! ## Overview
//! - Enforce the 10 MiB cap on the compressed blob
//! - Decompress gzip, enumerate tar members
//! - Require the five canonical members and a parseable `config.yml`
//!
//! No semantic validation of the parsed config happens here; whether the
//! YAML means anything is the overlay binary's problem.

use std::io::Read;

use flate2::read::GzDecoder;
use thiserror::Error;

use crate::error::ServiceError;

/// Hard cap on the compressed bundle size.
pub const MAX_BUNDLE_BYTES: usize = 10 * 1024 * 1024;

/// Cap on the bytes read out of the decompressed stream, bounding
/// decompression bombs.
const MAX_UNPACKED_BYTES: u64 = 64 * 1024 * 1024;

/// Members every bundle must carry.
pub const REQUIRED_MEMBERS: [&str; 5] =
    ["config.yml", "ca.crt", "crl.pem", "host.crt", "host.key"];

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("bundle exceeds {MAX_BUNDLE_BYTES} bytes (got {0})")]
    TooLarge(usize),

    #[error("bundle is not a valid gzipped tar: {0}")]
    Format(String),

    #[error("bundle is missing required member {0}")]
    MissingMember(String),

    #[error("bundle config.yml is not well-formed YAML: {0}")]
    ConfigSyntax(String),
}

impl From<BundleError> for ServiceError {
    fn from(err: BundleError) -> Self {
        match err {
            BundleError::TooLarge(_) => ServiceError::PayloadTooLarge,
            other => ServiceError::BadRequest(other.to_string()),
        }
    }
}

/// What a validated bundle contained.
#[derive(Debug, Clone)]
pub struct BundleManifest {
    /// Member paths in archive order, normalized (no leading `./`).
    pub members: Vec<String>,
}

/// Strip a leading `./` so `./config.yml` and `config.yml` compare equal.
fn normalize_member(path: &std::path::Path) -> String {
    let mut parts = Vec::new();
    for comp in path.components() {
        if let std::path::Component::Normal(p) = comp {
            parts.push(p.to_string_lossy().into_owned());
        }
    }
    parts.join("/")
}

/// Validate an opaque blob as a configuration bundle.
///
/// Checks run in order: size cap, gzip framing, tar enumeration, required
/// members, YAML syntax of `config.yml`. Extra members are allowed.
pub fn validate_bundle(data: &[u8]) -> Result<BundleManifest, BundleError> {
    if data.len() > MAX_BUNDLE_BYTES {
        return Err(BundleError::TooLarge(data.len()));
    }

    let decoder = GzDecoder::new(data).take(MAX_UNPACKED_BYTES);
    let mut archive = tar::Archive::new(decoder);

    let mut members = Vec::new();
    let mut config_text: Option<String> = None;

    let entries = archive
        .entries()
        .map_err(|e| BundleError::Format(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| BundleError::Format(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| BundleError::Format(e.to_string()))?;
        let name = normalize_member(&path);
        if name.is_empty() {
            continue;
        }
        if name == "config.yml" {
            let mut text = String::new();
            entry
                .read_to_string(&mut text)
                .map_err(|e| BundleError::Format(e.to_string()))?;
            config_text = Some(text);
        }
        members.push(name);
    }

    for required in REQUIRED_MEMBERS {
        if !members.iter().any(|m| m == required) {
            return Err(BundleError::MissingMember(required.to_string()));
        }
    }

    let text = config_text.unwrap_or_default();
    serde_yaml::from_str::<serde_yaml::Value>(&text)
        .map_err(|e| BundleError::ConfigSyntax(e.to_string()))?;

    Ok(BundleManifest { members })
}
