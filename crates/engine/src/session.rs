//! Editing session: the signed-in user and the records they have open.

use std::sync::Arc;

use examsync_core::Diffable;
use futures::future::{BoxFuture, FutureExt, join_all};

use crate::controller::SyncController;
use crate::error::EngineError;
use crate::transport::Transport;

pub const PERM_VIEW: u32 = 1 << 0;
pub const PERM_EDIT_TASKS: u32 = 1 << 1;
pub const PERM_EDIT_KIMS: u32 = 1 << 2;
pub const PERM_ADMIN: u32 = 1 << 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub user_id: i64,
    pub login: String,
    pub perms: u32,
}

impl UserInfo {
    pub fn has_perms(&self, required: u32) -> bool {
        self.perms & required == required
    }
}

/// Anything a session can flush before it ends.
pub trait Drainable: Send + Sync {
    /// Equal for handles to the same record.
    fn key(&self) -> usize;

    fn endpoint(&self) -> &str;

    fn is_synchronized(&self) -> bool;

    fn drain(&self) -> BoxFuture<'_, bool>;
}

impl<D: Diffable, T: Transport> Drainable for SyncController<D, T> {
    fn key(&self) -> usize {
        SyncController::key(self)
    }

    fn endpoint(&self) -> &str {
        SyncController::endpoint(self)
    }

    fn is_synchronized(&self) -> bool {
        SyncController::is_synchronized(self)
    }

    fn drain(&self) -> BoxFuture<'_, bool> {
        self.synchronize().boxed()
    }
}

pub struct Session {
    user: UserInfo,
    tracked: Vec<Arc<dyn Drainable>>,
}

impl Session {
    pub fn begin(user: UserInfo) -> Self {
        tracing::info!(user_id = user.user_id, login = %user.login, "session started");
        Self {
            user,
            tracked: Vec::new(),
        }
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    pub fn require_perms(&self, required: u32) -> Result<(), EngineError> {
        if self.user.has_perms(required) {
            Ok(())
        } else {
            Err(EngineError::Forbidden(format!(
                "user {} lacks permissions {:#x}",
                self.user.login,
                required & !self.user.perms
            )))
        }
    }

    /// Flush `controller` before the session ends.
    pub fn track(&mut self, controller: Arc<dyn Drainable>) {
        self.tracked.push(controller);
    }

    /// Stop tracking `controller`, discarding whatever it has unsaved.
    /// Returns whether it was tracked.
    pub fn release(&mut self, controller: &dyn Drainable) -> bool {
        let key = controller.key();
        let before = self.tracked.len();
        self.tracked.retain(|c| c.key() != key);
        if before == self.tracked.len() {
            return false;
        }
        if !controller.is_synchronized() {
            tracing::warn!(endpoint = controller.endpoint(), "released record with unsaved changes");
        }
        true
    }

    /// Drain `controller` and stop tracking it once it is saved.
    pub async fn close(&mut self, controller: &dyn Drainable) -> Result<(), EngineError> {
        if !controller.drain().await {
            return Err(EngineError::UnsavedChanges(1));
        }
        self.release(controller);
        Ok(())
    }

    pub fn tracked(&self) -> usize {
        self.tracked.len()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.tracked.iter().any(|c| !c.is_synchronized())
    }

    /// Drain every tracked record. Returns how many failed to synchronize.
    pub async fn drain(&self) -> usize {
        let results = join_all(self.tracked.iter().map(|c| c.drain())).await;
        let mut failed = 0;
        for (controller, synchronized) in self.tracked.iter().zip(results) {
            if !synchronized {
                tracing::warn!(endpoint = controller.endpoint(), "record left unsaved");
                failed += 1;
            }
        }
        failed
    }

    /// End the session once everything is saved.
    ///
    /// On failure the session is handed back so the caller can retry or
    /// [`abandon`](Self::abandon) it.
    pub async fn end(self) -> Result<(), (Self, EngineError)> {
        let failed = self.drain().await;
        match failed {
            0 => {
                tracing::info!(user_id = self.user.user_id, "session ended");
                Ok(())
            }
            _ => Err((self, EngineError::UnsavedChanges(failed))),
        }
    }

    /// End the session and discard whatever is still unsaved.
    pub fn abandon(self) {
        let unsaved = self.tracked.iter().filter(|c| !c.is_synchronized()).count();
        if unsaved > 0 {
            tracing::warn!(user_id = self.user.user_id, unsaved, "session abandoned with unsaved changes");
        } else {
            tracing::info!(user_id = self.user.user_id, "session ended");
        }
    }
}
