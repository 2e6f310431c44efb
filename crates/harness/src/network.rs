use std::ops::Range;
use std::sync::{Mutex, MutexGuard};

use examsync_core::{RecordId, RecordMessage};
use examsync_engine::{AllocatorError, IdSource, Transport, TransportError};
use examsync_storage::{SqliteStorage, Storage, StorageError};
use tokio::sync::watch;

pub const TASK_ENDPOINT: &str = "/api/tasks/update";
pub const KIM_ENDPOINT: &str = "/api/kim/update";

/// Record kind stored behind a save endpoint.
pub fn route(endpoint: &str) -> Option<&'static str> {
    match endpoint {
        TASK_ENDPOINT => Some("task"),
        KIM_ENDPOINT => Some("kim"),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_next: usize,
    fail_all: bool,
}

/// Simulated server: every request is encoded, decoded and applied to an
/// in-memory SQLite store.
///
/// Requests can be made to fail and can be held in flight until released.
pub struct TestNetwork {
    storage: Mutex<SqliteStorage>,
    faults: Mutex<Faults>,
    log: Mutex<Vec<(String, RecordMessage)>>,
    held: watch::Sender<bool>,
    received: watch::Sender<usize>,
}

impl TestNetwork {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::with_storage(SqliteStorage::open_in_memory()?))
    }

    pub fn with_storage(storage: SqliteStorage) -> Self {
        let (held, _) = watch::channel(false);
        let (received, _) = watch::channel(0);
        Self {
            storage: Mutex::new(storage),
            faults: Mutex::new(Faults::default()),
            log: Mutex::new(Vec::new()),
            held,
            received,
        }
    }

    /// Fail the next `count` requests.
    pub fn fail_next(&self, count: usize) {
        lock(&self.faults).fail_next = count;
    }

    pub fn fail_all(&self, fail: bool) {
        lock(&self.faults).fail_all = fail;
    }

    /// Keep subsequent requests in flight until [`release`](Self::release).
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    /// Wait until at least `count` requests have arrived.
    pub async fn wait_for_requests(&self, count: usize) {
        let mut rx = self.received.subscribe();
        let _ = rx.wait_for(|received| *received >= count).await;
    }

    pub fn request_count(&self) -> usize {
        *self.received.borrow()
    }

    /// Every patch received so far, with its endpoint.
    pub fn requests(&self) -> Vec<(String, RecordMessage)> {
        lock(&self.log).clone()
    }

    pub fn load(&self, kind: &str, id: RecordId) -> Result<RecordMessage, StorageError> {
        lock(&self.storage).load(kind, id)
    }

    /// Write a record directly, bypassing the request path.
    pub fn seed(&self, kind: &str, record: &RecordMessage) -> Result<(), StorageError> {
        lock(&self.storage).apply_patch(kind, record)
    }

    pub fn storage(&self) -> MutexGuard<'_, SqliteStorage> {
        lock(&self.storage)
    }

    fn receive(&self, endpoint: &str, patch: &RecordMessage) -> Result<RecordMessage, TransportError> {
        let failed = |reason: String| TransportError::Failed {
            endpoint: endpoint.to_string(),
            reason,
        };
        let bytes = patch.to_msgpack().map_err(|e| failed(e.to_string()))?;
        let decoded = RecordMessage::from_msgpack(&bytes).map_err(|e| failed(e.to_string()))?;
        lock(&self.log).push((endpoint.to_string(), decoded.clone()));
        self.received.send_modify(|received| *received += 1);
        Ok(decoded)
    }

    fn respond(&self, endpoint: &str, patch: &RecordMessage) -> Result<(), TransportError> {
        {
            let mut faults = lock(&self.faults);
            if faults.fail_all || faults.fail_next > 0 {
                faults.fail_next = faults.fail_next.saturating_sub(1);
                return Err(TransportError::Failed {
                    endpoint: endpoint.to_string(),
                    reason: "connection reset".into(),
                });
            }
        }
        let kind = route(endpoint).ok_or_else(|| TransportError::UnknownEndpoint(endpoint.into()))?;
        lock(&self.storage)
            .apply_patch(kind, patch)
            .map_err(|e| {
                tracing::debug!(endpoint, error = %e, "patch rejected");
                TransportError::Rejected {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                }
            })
    }
}

impl Transport for TestNetwork {
    async fn save(&self, endpoint: &str, patch: &RecordMessage) -> Result<(), TransportError> {
        let decoded = self.receive(endpoint, patch)?;
        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;
        self.respond(endpoint, &decoded)
    }
}

impl IdSource for TestNetwork {
    async fn reserve(&self, count: u32) -> Result<Range<i64>, AllocatorError> {
        lock(&self.storage)
            .reserve_ids(count)
            .map_err(|e| AllocatorError::Source(e.to_string()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
