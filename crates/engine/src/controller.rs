//! Sync controller: pushes a record's local edits to the server.
//!
//! Every change kicks a save loop. While a request is in flight further
//! changes only raise a flag; when the request returns the loop sends
//! whatever has accumulated since, so at most one request per record is in
//! flight and only the latest delta is ever sent.

use std::sync::{Arc, Mutex, MutexGuard};

use examsync_core::{AttemptId, ChangeRecorder, Diffable, RecordMessage};

use crate::config::SyncConfig;
use crate::error::TransportError;
use crate::latch::{Latch, LatchState};
use crate::transport::{NullStatus, StatusSink, SyncStatus, Transport};

/// Construction parameters of a [`SyncController`].
pub struct SyncParams<D, T> {
    remote: D,
    transport: T,
    endpoint: String,
    config: SyncConfig,
    status: Arc<dyn StatusSink>,
}

impl<D: Diffable, T: Transport> SyncParams<D, T> {
    pub fn new(remote: D, transport: T, endpoint: impl Into<String>) -> Self {
        Self {
            remote,
            transport,
            endpoint: endpoint.into(),
            config: SyncConfig::default(),
            status: Arc::new(NullStatus),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_status(mut self, status: impl StatusSink + 'static) -> Self {
        self.status = Arc::new(status);
        self
    }
}

struct State<D> {
    record: D,
    handler_in_progress: bool,
    update_while_save: bool,
    suppress_save: bool,
    atomic_depth: usize,
    atomic_changes: usize,
    fields: usize,
    status: SyncStatus,
}

impl<D> State<D> {
    fn has_pending(&self) -> bool {
        self.update_while_save || self.atomic_changes > 0
    }

    fn may_send(&self) -> bool {
        !self.suppress_save && self.atomic_depth == 0
    }
}

struct Shared<D, T> {
    state: Mutex<State<D>>,
    transport: T,
    endpoint: String,
    config: SyncConfig,
    status: Arc<dyn StatusSink>,
    latch: Latch,
}

struct Attempt<Delta> {
    id: AttemptId,
    patch: RecordMessage,
    delta: Delta,
}

enum DrainStep {
    Done(bool),
    Wait,
    Yield,
    Retry,
}

/// Write access to the controlled record inside [`SyncController::update`].
pub struct Edit<'a, D> {
    record: &'a mut D,
    recorder: ChangeRecorder,
}

impl<D: Diffable> Edit<'_, D> {
    /// Local view of the record; every change made through it is saved.
    pub fn local(&mut self) -> D::Local<'_> {
        self.record.local(&mut self.recorder)
    }

    pub fn get(&self) -> &D {
        self.record
    }
}

/// Owns one record and keeps the server in step with its local edits.
///
/// Saves start suppressed so that a page can write its defaults first;
/// call [`resume_saves`](Self::resume_saves) once it is ready. The save
/// loop runs on the current tokio runtime.
pub struct SyncController<D, T> {
    shared: Arc<Shared<D, T>>,
}

impl<D, T> Clone for SyncController<D, T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: Diffable, T: Transport> SyncController<D, T> {
    pub fn new(params: SyncParams<D, T>) -> Self {
        let fields = params.remote.fields();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    record: params.remote,
                    handler_in_progress: false,
                    update_while_save: false,
                    suppress_save: true,
                    atomic_depth: 0,
                    atomic_changes: 0,
                    fields,
                    status: SyncStatus::Idle,
                }),
                transport: params.transport,
                endpoint: params.endpoint,
                config: params.config,
                status: params.status,
                latch: Latch::new(),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Identity shared by every clone of this controller.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    /// Edit the record. Must not call back into this controller.
    pub fn update<U>(&self, f: impl FnOnce(&mut Edit<'_, D>) -> U) -> U {
        let mut state = self.lock();
        let mut edit = Edit {
            record: &mut state.record,
            recorder: ChangeRecorder::default(),
        };
        let output = f(&mut edit);
        let changed = edit.recorder.changed();
        if changed {
            self.on_delta_change(&mut state);
        }
        output
    }

    /// Run `f` with saves held back, then save everything it changed in
    /// one request. Nested calls join the outermost batch.
    pub fn as_atomic_change<U>(&self, f: impl FnOnce(&Self) -> U) -> U {
        self.lock().atomic_depth += 1;
        let output = f(self);
        let mut state = self.lock();
        state.atomic_depth -= 1;
        if state.atomic_depth > 0 {
            return output;
        }
        if std::mem::take(&mut state.atomic_changes) > 0 {
            self.on_delta_change(&mut state);
        } else if state.update_while_save && !state.handler_in_progress && !state.suppress_save {
            // A save loop stopped for the batch with edits still pending.
            self.start(&mut state);
        }
        output
    }

    pub fn suppress_saves(&self) {
        self.lock().suppress_save = true;
    }

    /// Allow saves again and send what changed while they were held back.
    pub fn resume_saves(&self) {
        let mut state = self.lock();
        state.suppress_save = false;
        if state.update_while_save && !state.handler_in_progress && state.atomic_depth == 0 {
            self.start(&mut state);
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.lock().status
    }

    /// Dirty field count last reported by the record.
    pub fn fields(&self) -> usize {
        self.lock().fields
    }

    pub fn is_synchronized(&self) -> bool {
        let state = self.lock();
        !state.handler_in_progress && !state.has_pending() && state.record.fields() == 0
    }

    pub fn read<U>(&self, f: impl FnOnce(&D) -> U) -> U {
        f(&self.lock().record)
    }

    /// Wait until every local change is saved.
    ///
    /// Returns `false` when saves are suppressed, when a fresh attempt
    /// after a failure fails as well, or when the configured drain timeout
    /// elapses.
    pub async fn synchronize(&self) -> bool {
        let drain = async {
            let mut retried = false;
            loop {
                match self.drain_step() {
                    DrainStep::Done(synchronized) => return synchronized,
                    DrainStep::Yield => {
                        tokio::task::yield_now().await;
                        continue;
                    }
                    DrainStep::Retry if retried => return false,
                    DrainStep::Retry => {
                        retried = true;
                        if !self.kick() {
                            return false;
                        }
                    }
                    DrainStep::Wait => {}
                }
                if self.shared.latch.wait().await == LatchState::Rejected {
                    tracing::debug!(endpoint = %self.shared.endpoint, "drain saw a failed save");
                }
            }
        };
        match self.shared.config.drain_timeout() {
            Some(limit) => match tokio::time::timeout(limit, drain).await {
                Ok(synchronized) => synchronized,
                Err(_) => {
                    tracing::warn!(endpoint = %self.shared.endpoint, ?limit, "drain timed out");
                    false
                }
            },
            None => drain.await,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<D>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn on_delta_change(&self, state: &mut State<D>) {
        state.fields = state.record.fields();
        self.shared.latch.clear();
        if state.atomic_depth > 0 {
            state.atomic_changes += 1;
            return;
        }
        state.update_while_save = true;
        if state.handler_in_progress || state.suppress_save {
            return;
        }
        self.start(state);
    }

    /// Start a fresh attempt for a record left dirty by a failure.
    /// Returns whether there is now a loop to wait for.
    fn kick(&self) -> bool {
        let mut state = self.lock();
        if state.handler_in_progress {
            return true;
        }
        if !state.may_send() {
            return false;
        }
        self.shared.latch.clear();
        state.update_while_save = true;
        self.start(&mut state)
    }

    fn start(&self, state: &mut State<D>) -> bool {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                state.handler_in_progress = true;
                let controller = self.clone();
                runtime.spawn(async move { controller.run().await });
                true
            }
            Err(err) => {
                tracing::error!(endpoint = %self.shared.endpoint, %err, "no runtime to save on");
                false
            }
        }
    }

    async fn run(self) {
        while let Some(attempt) = self.begin_attempt() {
            tracing::debug!(
                attempt = %attempt.id,
                endpoint = %self.shared.endpoint,
                fields = attempt.patch.fields.len(),
                children = attempt.patch.children.len(),
                "sending patch"
            );
            let result = self
                .shared
                .transport
                .save(&self.shared.endpoint, &attempt.patch)
                .await;
            if !self.finish_attempt(attempt.id, attempt.delta, result) {
                break;
            }
        }
    }

    fn begin_attempt(&self) -> Option<Attempt<D::Delta>> {
        let mut state = self.lock();
        if !state.update_while_save || !state.may_send() {
            state.handler_in_progress = false;
            if state.suppress_save && state.has_pending() {
                let _ = self.shared.latch.reject();
            }
            return None;
        }
        state.update_while_save = false;
        match state.record.synchronize() {
            None => {
                state.handler_in_progress = false;
                state.fields = 0;
                if state.status != SyncStatus::Idle {
                    self.show(&mut state, SyncStatus::Saved);
                }
                let _ = self.shared.latch.resolve();
                None
            }
            Some((patch, delta)) => {
                self.show(&mut state, SyncStatus::Saving);
                Some(Attempt {
                    id: AttemptId::new(),
                    patch,
                    delta,
                })
            }
        }
    }

    /// Settle an attempt. Returns whether the loop should go on.
    fn finish_attempt(
        &self,
        attempt: AttemptId,
        delta: D::Delta,
        result: Result<(), TransportError>,
    ) -> bool {
        let mut state = self.lock();
        match result {
            Ok(()) => {
                if let Err(err) = state.record.commit(&delta) {
                    tracing::error!(%attempt, endpoint = %self.shared.endpoint, %err, "saved delta does not fit the record");
                    state.handler_in_progress = false;
                    self.show(&mut state, SyncStatus::NotSaved);
                    let _ = self.shared.latch.reject();
                    return false;
                }
                state.fields = state.record.fields();
                tracing::debug!(%attempt, remaining = state.fields, "patch saved");
                self.show(&mut state, SyncStatus::Saved);
                if !state.has_pending() {
                    let _ = self.shared.latch.resolve();
                }
            }
            Err(err) => {
                tracing::warn!(%attempt, endpoint = %self.shared.endpoint, %err, "save failed");
                state.record.rollback(&delta);
                self.show(&mut state, SyncStatus::NotSaved);
                if !state.has_pending() {
                    let _ = self.shared.latch.reject();
                }
            }
        }
        if state.update_while_save && state.may_send() {
            return true;
        }
        state.handler_in_progress = false;
        if state.suppress_save && state.has_pending() {
            let _ = self.shared.latch.reject();
        }
        false
    }

    fn drain_step(&self) -> DrainStep {
        let mut state = self.lock();
        if state.handler_in_progress {
            return DrainStep::Wait;
        }
        if state.atomic_depth > 0 {
            return DrainStep::Yield;
        }
        if state.suppress_save && state.record.fields() == 0 {
            state.update_while_save = false;
        }
        if !state.has_pending() && state.record.fields() == 0 {
            return DrainStep::Done(true);
        }
        if state.suppress_save {
            return DrainStep::Done(false);
        }
        DrainStep::Retry
    }

    fn show(&self, state: &mut State<D>, status: SyncStatus) {
        state.status = status;
        self.shared
            .status
            .show(status, self.shared.config.status_text(status));
    }
}
