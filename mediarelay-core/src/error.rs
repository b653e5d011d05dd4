use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RelayError::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RelayError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
