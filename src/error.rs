use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::config::BackendType;

/// Main error type for external-storage operations.
///
/// Drivers raise backend-specific failures mapped into this taxonomy; nothing
/// backend-specific crosses the facade boundary.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("no mount matches path: {0}")]
    NoSuchMount(String),

    #[error("{backend} mount configuration invalid: {detail}")]
    ConfigurationInvalid {
        backend: BackendType,
        detail: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("mount \"{0}\" is read-only")]
    ReadOnly(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("\"{mount}\" ({backend}) is unreachable: {detail}")]
    BackendUnreachable {
        mount: String,
        backend: BackendType,
        detail: String,
    },

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("connection pool for \"{mount}\" exhausted after {waited:?}")]
    PoolExhausted { mount: String, waited: Duration },

    #[error("credential refresh for \"{mount}\" rejected: {detail}")]
    RefreshFailed { mount: String, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Whether the facade should retry the call with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }

    /// Whether the failure warrants a credential refresh and a single retry.
    pub fn triggers_refresh(&self) -> bool {
        matches!(self, StorageError::Unauthorized(_))
    }

    /// Fatal failures that require administrator action, never a retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::ConfigurationInvalid { .. } | StorageError::RefreshFailed { .. }
        )
    }
}

/// Result type alias for external-storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(StorageError::Unavailable("down".into()).is_transient());
        assert!(!StorageError::NotFound("/a".into()).is_transient());
        assert!(StorageError::Unauthorized("expired token".into()).triggers_refresh());
        assert!(!StorageError::ProtocolError("bad frame".into()).triggers_refresh());
    }

    #[test]
    fn test_fatal_classification() {
        let err = StorageError::ConfigurationInvalid {
            backend: BackendType::Swift,
            detail: "missing required option `tenant`".into(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_transient());

        let err = StorageError::RefreshFailed {
            mount: "dropbox-home".into(),
            detail: "invalid app key".into(),
        };
        assert!(err.is_fatal());
    }

    #[test]
    fn test_user_visible_context() {
        // Failures shown to users carry the mount display name and backend type.
        let err = StorageError::BackendUnreachable {
            mount: "Team documents".into(),
            backend: BackendType::Smb,
            detail: "connection refused".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Team documents"));
        assert!(msg.contains("SMB/CIFS"));
    }
}
