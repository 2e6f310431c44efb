use std::sync::Arc;

use examsync_core::{Diffable, Kim, RecordId, Task};
use examsync_engine::session::{PERM_EDIT_KIMS, PERM_EDIT_TASKS, PERM_VIEW};
use examsync_engine::{
    EngineError, IdAllocator, Session, SyncConfig, SyncController, SyncParams, UserInfo,
};
use examsync_storage::StorageError;
use thiserror::Error;

use crate::network::{KIM_ENDPOINT, TASK_ENDPOINT, TestNetwork};

pub type TaskController = SyncController<Task, Arc<TestNetwork>>;
pub type KimController = SyncController<Kim, Arc<TestNetwork>>;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] examsync_core::CoreError),
}

impl From<examsync_engine::AllocatorError> for PeerError {
    fn from(err: examsync_engine::AllocatorError) -> Self {
        Self::Engine(err.into())
    }
}

/// An editing client of a [`TestNetwork`]: one signed-in user, an id
/// allocator and the records they have open.
pub struct TestPeer {
    pub network: Arc<TestNetwork>,
    pub session: Session,
    pub allocator: IdAllocator<Arc<TestNetwork>>,
    config: SyncConfig,
}

impl TestPeer {
    pub fn new(network: Arc<TestNetwork>, user: UserInfo) -> Self {
        Self::with_config(network, user, SyncConfig::default())
    }

    pub fn with_config(network: Arc<TestNetwork>, user: UserInfo, config: SyncConfig) -> Self {
        let allocator = IdAllocator::new(Arc::clone(&network), config.id_batch_size);
        Self {
            network,
            session: Session::begin(user),
            allocator,
            config,
        }
    }

    /// A peer signed in with every permission.
    pub fn admin(network: Arc<TestNetwork>) -> Self {
        Self::new(
            network,
            UserInfo {
                user_id: 1,
                login: "admin".into(),
                perms: PERM_VIEW | PERM_EDIT_TASKS | PERM_EDIT_KIMS,
            },
        )
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn new_id(&self) -> Result<RecordId, PeerError> {
        Ok(self.allocator.allocate().await?)
    }

    pub fn open_task(&mut self, id: RecordId) -> Result<TaskController, PeerError> {
        self.session.require_perms(PERM_VIEW | PERM_EDIT_TASKS)?;
        let remote = Task::from_message(&self.network.load("task", id)?)?;
        Ok(self.attach(remote, TASK_ENDPOINT))
    }

    pub async fn new_task(&mut self) -> Result<TaskController, PeerError> {
        self.session.require_perms(PERM_EDIT_TASKS)?;
        let id = self.new_id().await?;
        Ok(self.attach(Task::new(id), TASK_ENDPOINT))
    }

    pub fn open_kim(&mut self, id: RecordId) -> Result<KimController, PeerError> {
        self.session.require_perms(PERM_VIEW | PERM_EDIT_KIMS)?;
        let remote = Kim::from_message(&self.network.load("kim", id)?)?;
        Ok(self.attach(remote, KIM_ENDPOINT))
    }

    pub async fn new_kim(&mut self) -> Result<KimController, PeerError> {
        self.session.require_perms(PERM_EDIT_KIMS)?;
        let id = self.new_id().await?;
        Ok(self.attach(Kim::new(id), KIM_ENDPOINT))
    }

    /// Wrap `remote` in a tracked controller with saves enabled.
    fn attach<D: Diffable>(&mut self, remote: D, endpoint: &str) -> SyncController<D, Arc<TestNetwork>> {
        let controller = SyncController::new(
            SyncParams::new(remote, Arc::clone(&self.network), endpoint)
                .with_config(self.config.clone()),
        );
        self.session.track(Arc::new(controller.clone()));
        controller.resume_saves();
        controller
    }
}
