use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an authentication attempt was rejected.
///
/// Expired credentials are worth one automatic refresh; revoked ones are
/// fatal until the user supplies new credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum AuthKind {
    #[error("credentials expired")]
    Expired,
    #[error("credentials revoked")]
    Revoked,
}

/// Account-scoped pipeline errors. One account's failure never blocks or
/// corrupts another account's state.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication error: {0}")]
    Auth(AuthKind),

    #[error("flag change rejected by server: {0}")]
    Conflict(String),

    #[error("message not found: {0}")]
    NotFound(String),

    #[error("classifier provider error: {0}")]
    Provider(String),

    #[error("classifier provider rejected the API key")]
    ProviderAuth,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),
}

impl SyncError {
    /// Transient errors feed the backoff loop; everything else is handled
    /// by a dedicated transition or surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Io(_))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Parse(err.to_string())
    }
}
