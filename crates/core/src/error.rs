use thiserror::Error;

use crate::ids::RecordId;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("field {field} holds {found}, expected {expected}")]
    FieldType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("unknown set element: {0}")]
    UnknownElement(RecordId),

    #[error("duplicate set element: {0}")]
    DuplicateElement(RecordId),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
