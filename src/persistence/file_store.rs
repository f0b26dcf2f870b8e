//! One JSON document per wallet, replaced atomically via rename

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use super::state_store::{version_conflict, StateStore};
use crate::domain::ExecutionState;
use crate::error::{LpFlowError, Result};

pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        info!(dir = %dir.display(), "Using file state store");
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let safe = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-';
        if key.is_empty() || !key.chars().all(safe) {
            return Err(LpFlowError::InvalidParameters(format!(
                "state key {:?} is not a safe file name",
                key
            )));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }

    async fn read(path: &Path) -> Result<Option<ExecutionState>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, key: &str) -> Result<Option<ExecutionState>> {
        Self::read(&self.path_for(key)?).await
    }

    async fn save(&self, state: &ExecutionState) -> Result<()> {
        let path = self.path_for(&state.wallet_address)?;
        let stored = Self::read(&path).await?.map(|s| s.version);
        let expected = state.version - 1;
        if stored.unwrap_or(0) != expected {
            return Err(version_conflict(&state.wallet_address, expected, stored));
        }

        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", state.wallet_address, uuid::Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(state)?;
        fs::write(&tmp, &body).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(key)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<ExecutionState>> {
        let mut states = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path.extension().map(|e| e == "json").unwrap_or(false)
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }
            match Self::read(&path).await {
                Ok(Some(state)) => states.push(state),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable state file")
                }
            }
        }
        Ok(states)
    }
}
