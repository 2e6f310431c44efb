use std::ops::Range;

use examsync_core::{RecordId, RecordMessage};

use crate::error::StorageError;

/// blake3 digest of a stored binary field.
pub type BlobHash = [u8; 32];

/// Server-side record store.
///
/// `kind` names a family of root records ("task", "kim"). Nested elements
/// live under their parent and the set they belong to.
pub trait Storage {
    /// Apply a sparse patch atomically.
    ///
    /// Moves and removals of ordered elements are checked against the
    /// stored position; a patch that leaves two live siblings on one
    /// position is rejected. On any error nothing is written.
    fn apply_patch(&mut self, kind: &str, patch: &RecordMessage) -> Result<(), StorageError>;

    /// Full state of a live root record, children ordered by position.
    fn load(&self, kind: &str, id: RecordId) -> Result<RecordMessage, StorageError>;

    /// Reserve `count` fresh ids. Ranges never overlap.
    fn reserve_ids(&mut self, count: u32) -> Result<Range<i64>, StorageError>;

    fn blob(&self, hash: &BlobHash) -> Result<Option<Vec<u8>>, StorageError>;
}
