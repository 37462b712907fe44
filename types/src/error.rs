use thiserror::Error;

/// The error kinds surfaced by the shard engine and the coordinators.
///
/// Kinds map to stable status codes at the HTTP boundary; messages name the
/// operation target but never internal sequence numbers or file paths.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("version mismatch: expected {expected}, current {current}")]
    VersionMismatch { expected: i64, current: i64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(target: impl Into<String>) -> Self {
        Self::NotFound(target.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn storage(source: impl Into<anyhow::Error>) -> Self {
        Self::Storage(source.into())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::VersionMismatch { .. } | Self::Conflict(_) => 409,
            Self::Storage(_) | Self::Timeout(_) => 503,
            Self::Internal(_) => 500,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
