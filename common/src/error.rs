use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

use crate::backends::Capability;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("No backend registered for capability {0:?}")]
    NoProvider(Capability),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Template error: {0}")]
    Template(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Lock contention: {0}")]
    Locked(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Ingestion Processing error: {0}")]
    Processing(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether the failure is plausibly transient and worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::OpenAI(_) | Self::Database(_) | Self::Io(_) | Self::Join(_)
        )
    }
}
