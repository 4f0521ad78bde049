use thiserror::Error;

use crate::cache::PolicyError;
use crate::config::LoadError;
use crate::infra::error::InfraError;
use crate::storage::StorageError;

/// Top-level application error for startup and serving.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),
    #[error("{message}")]
    Unexpected { message: String },
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
        }
    }
}
