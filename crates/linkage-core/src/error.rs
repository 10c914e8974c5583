//! Error types for linkage.

use thiserror::Error;

/// Result type alias using linkage's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for linkage operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Graph (job) not found
    #[error("Graph not found: {0}")]
    GraphNotFound(uuid::Uuid),

    /// Source connector raised while fetching links
    #[error("Source error ({method}): {message}")]
    Source { method: String, message: String },

    /// Raw links could not be turned into a graph
    #[error("Parse error: {0}")]
    Parse(String),

    /// Graph engine failed to evaluate the grid
    #[error("Engine error: {0}")]
    Engine(String),

    /// Notification channel refused an event
    #[error("Notification error: {0}")]
    Notification(String),

    /// Task queue error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a source error for the given connector method.
    pub fn source(method: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Source {
            method: method.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
