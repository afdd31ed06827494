//! Durable storage for the community registry.
//!
//! In-memory state is authoritative while the process runs. Stores only see
//! whole-registry snapshots; [`PersistenceGateway`] serializes writes and
//! remembers when the last one failed.

pub mod gateway;
pub mod json;
pub mod models;
pub mod sqlite;

pub use gateway::PersistenceGateway;
pub use json::JsonFileStore;
pub use models::{CommunityRecord, RegistrySnapshot, StoredKey};
pub use sqlite::SqliteStore;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::AppResult;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait StateStore: Send + Sync + Debug {
    /// Load the last durable snapshot. A store that has never been written
    /// yields an empty snapshot.
    async fn load(&self) -> AppResult<RegistrySnapshot>;

    /// Durably replace the stored state with `snapshot`
    async fn save(&self, snapshot: &RegistrySnapshot) -> AppResult<()>;

    fn describe(&self) -> String;
}

/// Open the backend selected in configuration
pub async fn open_store(config: &StorageConfig) -> AppResult<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.backend {
        StorageBackend::Json => Arc::new(JsonFileStore::new(&config.path, config.backup)),
        StorageBackend::Sqlite => {
            Arc::new(SqliteStore::connect(&config.path, config.max_connections).await?)
        }
    };
    info!("Using state store {}", store.describe());
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_json_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let config = StorageConfig {
            backend: StorageBackend::Json,
            path: path.clone(),
            ..StorageConfig::default()
        };
        let store = open_store(&config).await.unwrap();
        assert_eq!(store.describe(), format!("json:{}", path.display()));
        assert!(store.load().await.unwrap().communities.is_empty());
    }

    #[tokio::test]
    async fn test_open_sqlite_store_creates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        let config = StorageConfig {
            backend: StorageBackend::Sqlite,
            path: path.clone(),
            ..StorageConfig::default()
        };
        let store = open_store(&config).await.unwrap();
        assert_eq!(store.describe(), "sqlite");
        assert!(path.exists());
    }
}
