//! Error taxonomy shared by every PHAIT component.
//!
//! Payloads are strings so the error is `Clone`: an in-flight SOS generation hands the
//! same outcome to every caller attached to it.

use std::time::Duration;
use thiserror::Error;

/// Result alias for vault, backup, and orchestration operations.
pub type PhaitResult<T> = Result<T, PhaitError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhaitError {
    /// Wrong user secret (or an empty one). Fatal to vault open; never retried.
    #[error("invalid vault secret")]
    InvalidSecret,

    /// The vault has been closed and the master key wiped.
    #[error("vault is locked (master key has been released)")]
    Locked,

    /// Tag mismatch or malformed blob: corruption or tampering.
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    /// Plaintext authenticated but could not be turned back into a record.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The operation exceeded its configured budget. "No answer yet", not "wrong answer".
    #[error("{operation} timed out after {budget:?}")]
    Timeout {
        operation: &'static str,
        budget: Duration,
    },

    /// The inference engine failed for a reason unrelated to timing.
    #[error("model error: {0}")]
    ModelError(String),

    /// Checksum or key mismatch while verifying a backup; the vault was left untouched.
    #[error("backup integrity error: {0}")]
    BackupIntegrity(String),

    #[error("unsupported encryption algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("unsupported summary language: {0}")]
    UnsupportedLanguage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl PhaitError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True for errors the caller may act on (retry with a larger budget, pick another id,
    /// fall back to a cached summary). Crypto, storage and secret errors are not recoverable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Timeout { .. } | Self::ModelError(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<std::io::Error> for PhaitError {
    fn from(err: std::io::Error) -> Self {
        PhaitError::Io(err.to_string())
    }
}

impl From<sled::Error> for PhaitError {
    fn from(err: sled::Error) -> Self {
        PhaitError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PhaitError {
    fn from(err: serde_json::Error) -> Self {
        PhaitError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for PhaitError {
    fn from(err: config::ConfigError) -> Self {
        PhaitError::Config(err.to_string())
    }
}
