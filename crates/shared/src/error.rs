//! Error types for Sefer

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SeferError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for SeferError {
    fn from(err: sqlx::Error) -> Self {
        SeferError::Database(err.to_string())
    }
}
