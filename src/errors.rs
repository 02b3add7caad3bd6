//! Typed error taxonomy shared across the orchestrator core.
//!
//! `OrchestratorError` is the neutral kind set from spec §7: request-scoped
//! errors are returned to the caller, background-task errors are logged and
//! left for the next reconcile tick. `CloudError` and `StoreError` are the
//! narrower taxonomies returned by the two external collaborators and fold
//! into `OrchestratorError` via `From`.

use thiserror::Error;

/// Errors surfaced by the Cloud Adapter (§4.1). All cloud SDK failures are
/// classified into one of these kinds at the adapter boundary.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("transient cloud error: {0}")]
    Transient(String),
    #[error("cloud resource not found: {0}")]
    NotFound(String),
    #[error("cloud conflict: {0}")]
    Conflict(String),
    #[error("cloud permission denied: {0}")]
    PermissionDenied(String),
    #[error("fatal cloud error: {0}")]
    Fatal(String),
}

/// Errors surfaced by the State Store (Redis-backed Session/Pool storage).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("store key not found: {0}")]
    NotFound(String),
    #[error("store conflict: {0}")]
    Conflict(String),
    #[error("fatal store error: {0}")]
    Fatal(String),
}

/// The neutral error taxonomy of spec §7.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no capacity available, retry")]
    NoCapacity,

    #[error("bad instance: {0}")]
    BadInstance(String),

    #[error("transient upstream error: {0}")]
    TransientUpstream(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("fatal invariant violation: {0}")]
    Fatal(String),
}

impl OrchestratorError {
    /// The `errorKind` string carried in the structured HTTP response body.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::NotAuthenticated => "NotAuthenticated",
            OrchestratorError::NotFound(_) => "NotFound",
            OrchestratorError::Conflict(_) => "Conflict",
            OrchestratorError::NoCapacity => "NoCapacity",
            OrchestratorError::BadInstance(_) => "BadInstance",
            OrchestratorError::TransientUpstream(_) => "TransientUpstream",
            OrchestratorError::PermissionDenied(_) => "PermissionDenied",
            OrchestratorError::Fatal(_) => "Fatal",
        }
    }

    /// Whether a client may retry this error without operator intervention.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::NoCapacity | OrchestratorError::TransientUpstream(_)
        )
    }
}

impl From<CloudError> for OrchestratorError {
    fn from(e: CloudError) -> Self {
        match e {
            CloudError::Transient(m) => OrchestratorError::TransientUpstream(m),
            CloudError::NotFound(m) => OrchestratorError::BadInstance(m),
            CloudError::Conflict(m) => OrchestratorError::Conflict(m),
            CloudError::PermissionDenied(m) => OrchestratorError::PermissionDenied(m),
            CloudError::Fatal(m) => OrchestratorError::Fatal(m),
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Transient(m) => OrchestratorError::TransientUpstream(m),
            StoreError::NotFound(m) => OrchestratorError::NotFound(m),
            StoreError::Conflict(m) => OrchestratorError::Conflict(m),
            StoreError::Fatal(m) => OrchestratorError::Fatal(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(OrchestratorError::NoCapacity.retryable());
        assert!(OrchestratorError::TransientUpstream("x".into()).retryable());
        assert!(!OrchestratorError::Fatal("x".into()).retryable());
        assert!(!OrchestratorError::NotFound("x".into()).retryable());
    }

    #[test]
    fn kind_strings() {
        assert_eq!(OrchestratorError::NotAuthenticated.kind(), "NotAuthenticated");
        assert_eq!(OrchestratorError::BadInstance("i-1".into()).kind(), "BadInstance");
    }

    #[test]
    fn cloud_error_conversion() {
        let e: OrchestratorError = CloudError::NotFound("i-1".into()).into();
        assert!(matches!(e, OrchestratorError::BadInstance(_)));
    }

    #[test]
    fn store_error_conversion() {
        let e: OrchestratorError = StoreError::Conflict("ws:alice".into()).into();
        assert!(matches!(e, OrchestratorError::Conflict(_)));
    }
}
