use thiserror::Error;

use crate::llm::GenerationError;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("forbidden")]
    Forbidden,
    #[error("validation error: {0}")]
    Validation(String),
    #[error("insufficient balance: need {required} coins")]
    InsufficientBalance { required: i64 },
    #[error("model {model} failed: {source}")]
    Provider {
        model: String,
        #[source]
        source: GenerationError,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ChatError {
    /// Short machine-readable kind, used for metric labels and error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::NotFound(_) => "not_found",
            ChatError::Forbidden => "forbidden",
            ChatError::Validation(_) => "validation",
            ChatError::InsufficientBalance { .. } => "insufficient_balance",
            ChatError::Provider { .. } => "provider",
            ChatError::Configuration(_) => "configuration",
            ChatError::Storage(_) => "storage",
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
