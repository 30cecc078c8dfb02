// src/error.rs
// Standardized error types

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum MetaError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to spawn server '{server}': {message}")]
    Spawn { server: String, message: String },

    #[error("handshake with server '{server}' failed: {message}")]
    Handshake { server: String, message: String },

    #[error("listing tools on server '{server}' failed: {message}")]
    ToolDiscovery { server: String, message: String },

    #[error("server '{0}' is already registered")]
    DuplicateServer(String),

    #[error("no client handle for server '{0}'")]
    MissingHandle(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("vector index error: {0}")]
    Index(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("script error: {0}")]
    Sandbox(String),

    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using MetaError
pub type Result<T> = std::result::Result<T, MetaError>;

impl From<MetaError> for String {
    fn from(err: MetaError) -> Self {
        err.to_string()
    }
}
