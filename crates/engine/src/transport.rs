//! Seams to the outside world: the save call and the status line.

use std::future::Future;
use std::sync::Arc;

use examsync_core::RecordMessage;

use crate::error::TransportError;

/// Sends a serialized patch to a save endpoint.
///
/// The server applies a patch atomically: an `Ok` means all of it was
/// persisted, an `Err` means none of it was.
pub trait Transport: Send + Sync + 'static {
    fn save(
        &self,
        endpoint: &str,
        patch: &RecordMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

impl<T: Transport> Transport for Arc<T> {
    fn save(
        &self,
        endpoint: &str,
        patch: &RecordMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        (**self).save(endpoint, patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStatus {
    /// Nothing has been sent yet.
    #[default]
    Idle,
    Saving,
    Saved,
    /// The last attempt failed; some changes exist only locally.
    NotSaved,
}

/// Shows the save status to the user.
pub trait StatusSink: Send + Sync {
    fn show(&self, status: SyncStatus, text: &str);
}

impl<F: Fn(SyncStatus, &str) + Send + Sync> StatusSink for F {
    fn show(&self, status: SyncStatus, text: &str) {
        self(status, text)
    }
}

/// Status sink that shows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatus;

impl StatusSink for NullStatus {
    fn show(&self, _status: SyncStatus, _text: &str) {}
}
