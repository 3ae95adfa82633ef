//! Persistence of the control loop ledger.
//!
//! The ledger is a single JSON document, rewritten atomically (temp file + rename)
//! on every save.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::controller::DeviceRecord;
use crate::domain::{BoostRequest, DeviceId};

pub const DEFAULT_STATE_PATH: &str = "./data/diverter_state.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub devices: BTreeMap<DeviceId, DeviceRecord>,
    /// On-demand boost requests not yet applied
    #[serde(default)]
    pub pending: BTreeMap<DeviceId, BoostRequest>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<PersistedState>;
    async fn save(&self, state: &PersistedState) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    /// A missing file is an empty ledger
    async fn load(&self) -> Result<PersistedState> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no saved state, starting fresh");
                return Ok(PersistedState::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read state from {}", self.path.display()))
            }
        };

        let state: PersistedState = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse state from {}", self.path.display()))?;
        info!(
            path = %self.path.display(),
            devices = state.devices.len(),
            pending = state.pending.len(),
            "loaded saved state"
        );
        Ok(state)
    }

    async fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(state).context("failed to serialize state")?;
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, json)
            .await
            .with_context(|| format!("failed to write temp file {}", temp_path.display()))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        debug!(path = %self.path.display(), "state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::health::DeviceHealth;
    use crate::domain::Mode;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_is_empty_state() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));
        assert_eq!(store.load().await.unwrap(), PersistedState::default());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("nested").join("state.json"));

        let mut record = DeviceRecord {
            last_applied: Some(Mode::Stop),
            ..Default::default()
        };
        record.health.record_failure(1);
        let mut state = PersistedState {
            saved_at: Some(Utc::now()),
            ..Default::default()
        };
        state.devices.insert(DeviceId::new("zappi-1"), record);
        state
            .pending
            .insert(DeviceId::new("zappi-1"), BoostRequest::new(5.0).at_rate(3.6));

        store.save(&state).await.unwrap();
        assert!(!store.path().with_extension("tmp").exists());

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, state);
        assert_eq!(
            loaded.devices[&DeviceId::new("zappi-1")].health(),
            DeviceHealth::Failed
        );
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(FileStateStore::new(path).load().await.is_err());
    }
}
