use thiserror::Error;

use crate::runtime::RuntimeError;

/// Errors surfaced by space operations to API callers.
#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("space '{0}' not found")]
    NotFound(String),

    #[error("space '{0}' already exists")]
    Conflict(String),

    #[error("invalid space name '{0}': use 1-64 characters from [A-Za-z0-9_-]")]
    InvalidName(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("workspace volume bootstrap failed for '{name}' after {attempts} attempts: {reason}")]
    BootstrapFailed {
        name: String,
        attempts: u32,
        reason: String,
    },

    #[error(transparent)]
    Runtime(RuntimeError),
}

impl From<RuntimeError> for SpaceError {
    fn from(err: RuntimeError) -> Self {
        SpaceError::Runtime(err)
    }
}

impl SpaceError {
    /// Wrap a runtime failure hit while operating on `space`. A missing
    /// container is reported against the space name.
    pub fn runtime(space: &str, err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(_) => SpaceError::NotFound(space.to_string()),
            other => SpaceError::Runtime(other),
        }
    }

    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SpaceError::NotFound(_) => "NOT_FOUND",
            SpaceError::Conflict(_) => "CONFLICT",
            SpaceError::InvalidName(_) => "INVALID_NAME",
            SpaceError::InvalidRequest(_) => "INVALID_REQUEST",
            SpaceError::BootstrapFailed { .. } => "BOOTSTRAP_FAILED",
            SpaceError::Runtime(_) => "RUNTIME_ERROR",
        }
    }
}

pub type SpaceResult<T> = std::result::Result<T, SpaceError>;
