use thiserror::Error;

/// Errors from the persisted-state, queue, and lease layers
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("staging error: {0}")]
    Staging(#[from] std::io::Error),
}

impl StoreError {
    pub fn compiler_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "compiler",
            id: id.into(),
        }
    }

    pub fn submission_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "submission",
            id: id.to_string(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
