//! Registry state as a single JSON document.
//!
//! Saves go to `<path>.tmp`, are fsynced, and then renamed over `<path>`, so
//! a crash mid-write leaves the previous file intact. With backups enabled
//! the previous file is first copied to `<path>.bak`.

use super::models::RegistrySnapshot;
use super::StateStore;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    backup: bool,
}

pub(super) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>, backup: bool) -> Self {
        Self {
            path: path.into(),
            backup,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        with_suffix(&self.path, ".bak")
    }

    fn temp_path(&self) -> PathBuf {
        with_suffix(&self.path, ".tmp")
    }

    async fn load_backup(&self) -> AppResult<RegistrySnapshot> {
        if !self.backup {
            warn!("No backup configured, starting with an empty registry");
            return Ok(RegistrySnapshot::default());
        }

        let backup_path = self.backup_path();
        let bytes = match tokio::fs::read(&backup_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Backup {} unavailable ({}), starting with an empty registry", backup_path.display(), e);
                return Ok(RegistrySnapshot::default());
            }
        };

        match serde_json::from_slice::<RegistrySnapshot>(&bytes) {
            Ok(snapshot) => {
                info!(
                    "Restored {} communities from backup {}",
                    snapshot.communities.len(),
                    backup_path.display()
                );
                Ok(snapshot)
            }
            Err(e) => {
                error!("Backup {} is corrupt too: {}", backup_path.display(), e);
                Ok(RegistrySnapshot::default())
            }
        }
    }

    async fn write_temp(&self, bytes: &[u8]) -> AppResult<PathBuf> {
        let temp_path = self.temp_path();
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(temp_path)
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> AppResult<RegistrySnapshot> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("State file {} not found, starting fresh", self.path.display());
                return Ok(RegistrySnapshot::default());
            }
            // Present but unreadable: refuse to start
            Err(e) => return Err(AppError::Io(e)),
        };

        match serde_json::from_slice::<RegistrySnapshot>(&bytes) {
            Ok(snapshot) => {
                debug!(
                    "Loaded {} communities from {}",
                    snapshot.communities.len(),
                    self.path.display()
                );
                Ok(snapshot)
            }
            Err(e) => {
                error!("State file {} is corrupt: {}", self.path.display(), e);
                self.load_backup().await
            }
        }
    }

    async fn save(&self, snapshot: &RegistrySnapshot) -> AppResult<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        let temp_path = match self.write_temp(&bytes).await {
            Ok(path) => path,
            Err(e) => {
                let _ = tokio::fs::remove_file(self.temp_path()).await;
                return Err(e);
            }
        };

        if self.backup {
            match tokio::fs::copy(&self.path, self.backup_path()).await {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to back up {}: {}", self.path.display(), e),
            }
        }

        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(AppError::Io(e));
        }

        debug!("Saved {} communities to {}", snapshot.communities.len(), self.path.display());
        Ok(())
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }
}
