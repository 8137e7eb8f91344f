//! The kernel's error taxonomy. Each variant carries a human-readable
//! reason string; `web` maps variants to HTTP status codes.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Busy(String),

    #[error("{0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Io(String),

    #[error("hardware error: {0}")]
    Hardware(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl KernelError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub fn hardware(msg: impl Into<String>) -> Self {
        Self::Hardware(msg.into())
    }

    /// Maps this error to an HTTP status code by kind.
    pub fn status_code(&self) -> u16 {
        match self {
            KernelError::Validation(_) | KernelError::Busy(_) => 400,
            KernelError::NotFound(_) => 404,
            KernelError::Io(_) | KernelError::Hardware(_) | KernelError::Internal(_) => 500,
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
