use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::transport::SyncStatus;

/// Tunables of the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Status text while a patch is in flight.
    pub saving_text: String,
    /// Status text after a successful save.
    pub saved_text: String,
    /// Status text after a failed save.
    pub failed_text: String,
    /// Ids reserved per allocator refill.
    pub id_batch_size: u32,
    /// Upper bound on a drain; unbounded when absent.
    pub drain_timeout_ms: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            saving_text: "Сохранение...".to_string(),
            saved_text: String::new(),
            failed_text: "Не все изменения сохранены".to_string(),
            id_batch_size: 16,
            drain_timeout_ms: None,
        }
    }
}

impl SyncConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, EngineError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.id_batch_size == 0 {
            return Err(EngineError::Config("id_batch_size must be positive".into()));
        }
        if self.drain_timeout_ms == Some(0) {
            return Err(EngineError::Config(
                "drain_timeout_ms must be positive when set".into(),
            ));
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }

    pub fn status_text(&self, status: SyncStatus) -> &str {
        match status {
            SyncStatus::Idle => "",
            SyncStatus::Saving => &self.saving_text,
            SyncStatus::Saved => &self.saved_text,
            SyncStatus::NotSaved => &self.failed_text,
        }
    }
}
