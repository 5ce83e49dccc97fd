//! Error types for rollcalld

use thiserror::Error;

use crate::StudentId;

/// Core error type for rollcalld operations
#[derive(Debug, Error)]
pub enum RollcallError {
    #[error("Student not found: {0}")]
    StudentNotFound(StudentId),

    #[error("Unknown alert")]
    UnknownAlert,

    #[error("Alert choice not offered: {0}")]
    ChoiceNotOffered(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Store error: {0}")]
    StoreError(String),
}

impl RollcallError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreError(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RollcallError>;
