use examsync_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("allocator error: {0}")]
    Allocator(#[from] AllocatorError),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0} record(s) still have unsaved changes")]
    UnsavedChanges(usize),

    #[error("access denied: {0}")]
    Forbidden(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request to {endpoint} failed: {reason}")]
    Failed { endpoint: String, reason: String },

    #[error("request to {endpoint} was rejected: {reason}")]
    Rejected { endpoint: String, reason: String },

    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocatorError {
    #[error("id source returned an empty range")]
    EmptyRange,

    #[error("id range {start}..{end} overlaps ids already handed out")]
    Overlap { start: i64, end: i64 },

    #[error("id source failed: {0}")]
    Source(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LatchError {
    #[error("latch already settled")]
    AlreadySettled,
}
