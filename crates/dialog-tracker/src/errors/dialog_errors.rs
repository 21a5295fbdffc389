//! Dialog tracker error definitions

use thiserror::Error;

/// Result type for dialog tracker operations
pub type DialogResult<T> = Result<T, DialogError>;

/// Errors surfaced by the dialog tracker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialogError {
    /// A dialog record could not be allocated or linked
    #[error("Dialog allocation failed: {message}")]
    AllocationFailed { message: String },

    /// An administrative operation named a dialog that does not exist
    #[error("Dialog not found: {id}")]
    NotFound { id: String },

    /// A record-route token could not be decoded
    #[error("Invalid route token '{token}': {reason}")]
    InvalidToken { token: String, reason: String },

    /// An internal consistency check failed
    #[error("Invariant violation: {message}")]
    InvariantViolation { message: String },

    /// A persisted dialog hashes to a different bucket than the one it was stored with
    #[error("Bucket mismatch for call-id {call_id}: stored {stored_bucket}, computed {computed_bucket}")]
    HashMismatch {
        call_id: String,
        stored_bucket: u32,
        computed_bucket: u32,
    },

    /// Timer engine error
    #[error("Timer error: {message}")]
    Timer { message: String },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Persistence collaborator failure
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Replication channel failure
    #[error("Replication error: {message}")]
    Replication { message: String },

    /// Snapshot encoding failure
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DialogError {
    /// Create an allocation failure
    pub fn allocation_failed(message: impl Into<String>) -> Self {
        Self::AllocationFailed { message: message.into() }
    }

    /// Create a not-found error
    pub fn not_found(id: impl ToString) -> Self {
        Self::NotFound { id: id.to_string() }
    }

    /// Create an invalid token error
    pub fn invalid_token(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidToken {
            token: token.into(),
            reason: reason.into(),
        }
    }

    /// Create an invariant violation
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation { message: message.into() }
    }

    /// Create a timer error
    pub fn timer_error(message: impl Into<String>) -> Self {
        Self::Timer { message: message.into() }
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a storage error
    pub fn storage_error(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Create a replication error
    pub fn replication_error(message: impl Into<String>) -> Self {
        Self::Replication { message: message.into() }
    }

    /// Create an internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether retrying the same operation later can succeed.
    ///
    /// Allocation pressure and collaborator outages are transient; malformed
    /// input and configuration problems are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DialogError::AllocationFailed { .. }
                | DialogError::Storage { .. }
                | DialogError::Replication { .. }
        )
    }
}

impl From<serde_json::Error> for DialogError {
    fn from(err: serde_json::Error) -> Self {
        DialogError::Serialization { message: err.to_string() }
    }
}

impl From<toml::de::Error> for DialogError {
    fn from(err: toml::de::Error) -> Self {
        DialogError::Configuration { message: err.to_string() }
    }
}
