//! Error types for the replication subsystem.

use crate::adapter::AdapterError;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReplError>;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// A persisted object could not be found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of object that was looked up (e.g. "site").
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// The persistence layer failed while reading or writing.
    #[error("persistence error: {msg}")]
    Persistence {
        /// Error message describing the issue.
        msg: String,
    },

    /// Error reported by a node adapter.
    #[error("adapter error")]
    Adapter(#[from] AdapterError),

    /// No adapter factory is registered for the given site type.
    #[error("no node adapter factory registered for site type {site_type}")]
    NoAdapterFactory {
        /// The site type that has no factory.
        site_type: String,
    },

    /// An adapter factory was registered twice for the same site type.
    #[error("node adapter factory already registered for site type {site_type}")]
    FactoryAlreadyRegistered {
        /// The duplicated site type.
        site_type: String,
    },

    /// A replicator filter could not be parsed.
    #[error("invalid filter '{filter}': {msg}")]
    InvalidFilter {
        /// The offending filter text.
        filter: String,
        /// Why it was rejected.
        msg: String,
    },

    /// A field of a persistable object is missing or invalid.
    #[error("invalid field '{field}': {msg}")]
    InvalidField {
        /// The field name.
        field: &'static str,
        /// Why it was rejected.
        msg: String,
    },

    /// A persisted document was written with a version this build cannot read.
    #[error("unsupported {kind} version {version} for object {id}")]
    UnsupportedVersion {
        /// Kind of persisted object.
        kind: &'static str,
        /// Version found in the document.
        version: u32,
        /// Identifier of the object.
        id: String,
    },

    /// A non-blocking enqueue found the site queue at capacity.
    #[error("queue for site {site} is full (capacity {capacity})")]
    QueueFull {
        /// Site owning the queue.
        site: String,
        /// Configured capacity.
        capacity: usize,
    },

    /// Configuration is invalid.
    #[error("configuration error: {msg}")]
    Config {
        /// Error message describing the issue.
        msg: String,
    },

    /// A blocking operation was cancelled.
    #[error("operation interrupted")]
    Interrupted,

    /// JSON serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization error.
    #[error("config parse error")]
    Toml(#[from] toml::de::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The component was shut down.
    #[error("replication component shut down")]
    Shutdown,
}

impl ReplError {
    /// Shorthand for a persistence failure.
    pub fn persistence(msg: impl Into<String>) -> Self {
        ReplError::Persistence { msg: msg.into() }
    }

    /// Returns true for errors that leave the operation retryable later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplError::NotFound { .. }
                | ReplError::Persistence { .. }
                | ReplError::Interrupted
                | ReplError::Adapter(AdapterError::Unavailable { .. })
        )
    }
}
