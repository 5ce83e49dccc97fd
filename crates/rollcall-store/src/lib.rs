//! SQLite persistence for rollcalld
//!
//! The registry maps display names to students. Alongside it the store keeps
//! what replay cannot reconstruct: which alerts already fired, absences set
//! from the status channel or by admins, the last daily reset, and an
//! append-only audit trail. [`WriteBehindStore`] moves writes off the
//! caller's task.

mod audit;
mod sqlite;
mod traits;
mod write_behind;

pub use audit::*;
pub use sqlite::*;
pub use traits::*;
pub use write_behind::*;

use rollcall_util::StudentId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Could not encode stored value: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Student name already registered: {0}")]
    DuplicateName(String),

    #[error("Admin student {0} must be demoted before deletion")]
    AdminProtected(StudentId),

    /// The write-behind task is gone; queued writes were lost
    #[error("Store writer has shut down")]
    WriterClosed,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
