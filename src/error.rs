//! WolfReplica Error Types

use thiserror::Error;

/// Result type alias for WolfReplica operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfReplica error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Ledger errors
    #[error("{0}")]
    Consistency(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Content errors
    #[error(
        "Failed to save {failed} files to disk for {user}. Cannot proceed because \
         UserSyncFailureCount = {failure_count} below threshold {threshold}"
    )]
    ContentUnavailable {
        user: String,
        failed: usize,
        failure_count: u32,
        threshold: u32,
    },

    #[error("Content not found: {0}")]
    ContentNotFound(String),

    #[error("Content hash mismatch: expected {expected}, got {actual}")]
    ContentHashMismatch { expected: String, actual: String },

    // Replication errors
    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Sync already in progress for {0}")]
    SyncInProgress(String),

    #[error("Reconfiguration deferred for {user}: {reason}")]
    ReconfigurationDeferred { user: String, reason: String },

    #[error("Registry error: {0}")]
    Registry(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Peer {endpoint} unreachable: {reason}")]
    PeerUnreachable { endpoint: String, reason: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::PeerUnreachable { .. } | Error::Network(_)
        )
    }

    /// Errors that abort one user's processing but never the whole run
    pub fn is_user_scoped(&self) -> bool {
        matches!(
            self,
            Error::Consistency(_)
                | Error::UserNotFound(_)
                | Error::ContentUnavailable { .. }
                | Error::SyncInProgress(_)
                | Error::ReconfigurationDeferred { .. }
                | Error::PeerUnreachable { .. }
                | Error::Replication(_)
        )
    }

    /// Short machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Error::Consistency(_) => "CONSISTENCY",
            Error::UserNotFound(_) => "USER_NOT_FOUND",
            Error::ContentUnavailable { .. } => "CONTENT_UNAVAILABLE",
            Error::ContentNotFound(_) => "CONTENT_NOT_FOUND",
            Error::ContentHashMismatch { .. } => "CONTENT_HASH_MISMATCH",
            Error::SyncInProgress(_) => "SYNC_IN_PROGRESS",
            Error::ReconfigurationDeferred { .. } => "RECONFIGURATION_DEFERRED",
            Error::PeerUnreachable { .. } => "PEER_UNREACHABLE",
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG_ERROR",
            Error::Timeout(_) => "TIMEOUT",
            _ => "INTERNAL_ERROR",
        }
    }
}
