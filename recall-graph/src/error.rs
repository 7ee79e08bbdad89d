//! Error types for recall-graph

use thiserror::Error;

/// Errors that can occur in the memory graph
#[derive(Debug, Error)]
pub enum GraphError {
    /// RocksDB error
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    /// Serialization error (bincode)
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unknown node, edge, episode, procedure or snapshot id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input to a mutation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Embedding collaborator failure, recoverable per item
    #[error("Provider error: {0}")]
    Provider(String),

    /// No usable embedding provider or invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Schema version mismatch or unreadable database metadata
    #[error("Migration error: {0}")]
    Migration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GraphError {
    /// Create a not found error
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{} {}", kind, id))
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a migration error
    pub fn migration(msg: impl Into<String>) -> Self {
        Self::Migration(msg.into())
    }

    /// True for provider failures a caller can degrade around
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Provider(_))
    }
}

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;
