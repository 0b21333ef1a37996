//! Error taxonomy for instance lifecycle operations.
//!
//! Every manager operation returns one of these variants so that callers
//! (and tests) can branch on the failure kind instead of parsing messages.

use axum::http::StatusCode;

/// Result type for instancer operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A live instance already exists for this client.
    #[error("instance already exists for client {client}")]
    AlreadyExists { client: String },

    /// No instance is recorded for this client.
    #[error("no instance for client {client}")]
    NotFound { client: String },

    /// The workload could not be launched.
    #[error("failed to spawn workload: {reason}")]
    Spawn { reason: String },

    /// The termination request for a workload failed.
    #[error("failed to kill workload {pid}: {reason}")]
    Kill { pid: u32, reason: String },

    /// Store-level insert race: a record with this key already exists.
    #[error("duplicate store key: {client}")]
    DuplicateKey { client: String },

    /// Durable storage failure.
    #[error("store error: {0}")]
    Store(String),

    /// The human verification gate rejected the request.
    #[error("verification failed: {0}")]
    Verification(String),

    /// Invalid startup configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn not_found(client: impl Into<String>) -> Self {
        Self::NotFound {
            client: client.into(),
        }
    }

    pub fn already_exists(client: impl Into<String>) -> Self {
        Self::AlreadyExists {
            client: client.into(),
        }
    }

    pub fn spawn(reason: impl Into<String>) -> Self {
        Self::Spawn {
            reason: reason.into(),
        }
    }

    /// HTTP status used when this error reaches the API surface.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AlreadyExists { .. } | Self::DuplicateKey { .. } => StatusCode::CONFLICT,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Verification(_) => StatusCode::FORBIDDEN,
            Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::Spawn { .. } | Self::Kill { .. } | Self::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}
