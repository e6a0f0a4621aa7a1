//! Error types shared by the service layer and the HTTP front end

use std::time::Duration;
use thiserror::Error;

/// Service-layer error taxonomy.
///
/// Every failure a handler can surface maps to exactly one of these kinds;
/// the HTTP front end turns them into status codes and the stable
/// `{error, message, request_id}` envelope. Client-facing messages stay
/// generic; the detailed cause is logged server-side only.
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    /// Any authentication failure: missing header, short token, no matching
    /// hash. Always the same opaque message so clients cannot tell which
    /// factor failed.
    #[error("Authentication failed")]
    UnauthorizedGeneric,

    /// Authenticated but not an admin on an admin-only route. Same opaque
    /// phrasing as the 401 on the wire; logs carry the real reason.
    #[error("Authentication failed")]
    Forbidden,

    #[error("Resource not found")]
    NotFound,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Payload too large")]
    PayloadTooLarge,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: Option<Duration> },

    /// Mutation attempted on a replica-mode instance.
    #[error("This instance is read-only; writes go to the master")]
    ReplicaReadOnly { master_url: Option<String> },

    #[error("Internal server error")]
    Internal(String),
}

impl ServiceError {
    /// Stable wire name placed in the `error` field of the envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::UnauthorizedGeneric => "UnauthorizedGeneric",
            ServiceError::Forbidden => "Forbidden",
            ServiceError::NotFound => "NotFound",
            ServiceError::BadRequest(_) => "BadRequest",
            ServiceError::PayloadTooLarge => "PayloadTooLarge",
            ServiceError::Conflict(_) => "Conflict",
            ServiceError::RateLimitExceeded { .. } => "RateLimitExceeded",
            ServiceError::ReplicaReadOnly { .. } => "ReplicaReadOnly",
            ServiceError::Internal(_) => "Internal",
        }
    }

    /// HTTP status code for this kind.
    pub fn status(&self) -> u16 {
        match self {
            ServiceError::UnauthorizedGeneric => 401,
            ServiceError::Forbidden => 403,
            ServiceError::NotFound => 404,
            ServiceError::BadRequest(_) => 400,
            ServiceError::PayloadTooLarge => 413,
            ServiceError::Conflict(_) => 409,
            ServiceError::RateLimitExceeded { .. } => 429,
            ServiceError::ReplicaReadOnly { .. } => 503,
            ServiceError::Internal(_) => 500,
        }
    }

    /// Check if this is an authentication error
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ServiceError::UnauthorizedGeneric)
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound)
    }

    /// Check if this is a conflict error
    pub fn is_conflict(&self) -> bool {
        matches!(self, ServiceError::Conflict(_))
    }

    /// Check if this is a rate limit error
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ServiceError::RateLimitExceeded { .. })
    }

    /// Check if the caller should retry against the master
    pub fn is_replica_read_only(&self) -> bool {
        matches!(self, ServiceError::ReplicaReadOnly { .. })
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => ServiceError::NotFound,
            rusqlite::Error::SqliteFailure(code, ref msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ServiceError::Conflict(msg.clone().unwrap_or_else(|| "constraint".to_string()))
            }
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_and_forbidden_share_wire_message() {
        assert_eq!(
            ServiceError::UnauthorizedGeneric.to_string(),
            ServiceError::Forbidden.to_string()
        );
        assert_ne!(
            ServiceError::UnauthorizedGeneric.kind(),
            ServiceError::Forbidden.kind()
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ServiceError::UnauthorizedGeneric.status(), 401);
        assert_eq!(ServiceError::Forbidden.status(), 403);
        assert_eq!(ServiceError::NotFound.status(), 404);
        assert_eq!(ServiceError::PayloadTooLarge.status(), 413);
        assert_eq!(
            ServiceError::ReplicaReadOnly { master_url: None }.status(),
            503
        );
    }

    #[test]
    fn constraint_violation_maps_to_conflict() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("UNIQUE constraint failed: nodes.name".to_string()),
        );
        assert!(ServiceError::from(err).is_conflict());
    }
}
