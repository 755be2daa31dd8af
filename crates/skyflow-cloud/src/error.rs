//! Cloud provider error types

use thiserror::Error;

/// Cloud provider errors
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Unsupported resource type: {0}")]
    UnsupportedResource(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Provider operation failed for {resource}: {message}")]
    ProviderFailed { resource: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("State file error: {0}")]
    StateError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CloudError>;
