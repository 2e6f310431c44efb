use thiserror::Error;

use examsync_core::RecordId;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("element {id} is at position {found}, patch expected {expected}")]
    PositionConflict {
        id: RecordId,
        expected: i64,
        found: i64,
    },

    #[error("two live elements of {set} share position {position}")]
    DuplicatePosition { set: String, position: i64 },

    #[error("core error: {0}")]
    Core(#[from] examsync_core::CoreError),
}
