use super::models::RegistrySnapshot;
use super::StateStore;
use crate::error::AppResult;
use crate::registry::CommunityRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Serializes snapshot writes to a [`StateStore`].
///
/// A failed save never rolls back memory. The gateway marks itself dirty
/// instead and the next successful save (or [`flush_if_dirty`]) catches the
/// store up.
///
/// [`flush_if_dirty`]: PersistenceGateway::flush_if_dirty
#[derive(Debug)]
pub struct PersistenceGateway {
    store: Arc<dyn StateStore>,
    write_lock: Mutex<()>,
    dirty: AtomicBool,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Load the durable state into a fresh registry
    pub async fn load_registry(&self) -> AppResult<CommunityRegistry> {
        let snapshot = self.store.load().await?;
        let keys = snapshot.key_count();
        let registry = snapshot.into_registry()?;
        info!(
            "Loaded {} communities ({} available keys) from {}",
            registry.len(),
            keys,
            self.store.describe()
        );
        Ok(registry)
    }

    /// Write the current registry state. Returns whether the write landed.
    ///
    /// The snapshot is captured after taking the write lock, so a later
    /// write can never be overtaken by an older one.
    pub async fn persist(&self, registry: &CommunityRegistry) -> bool {
        let _guard = self.write_lock.lock().await;
        let snapshot = RegistrySnapshot::capture(registry).await;
        match self.store.save(&snapshot).await {
            Ok(()) => {
                if self.dirty.swap(false, Ordering::SeqCst) {
                    info!("State store {} caught up", self.store.describe());
                }
                true
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                error!("Failed to persist state to {}: {}", self.store.describe(), e);
                false
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Retry after an earlier failure; no-op when the store is current
    pub async fn flush_if_dirty(&self, registry: &CommunityRegistry) -> bool {
        if !self.is_dirty() {
            return true;
        }
        debug!("Retrying dirty state flush");
        self.persist(registry).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::keys::KeyPolicy;
    use crate::registry::{CommunityId, RoleId};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// In-memory store whose saves can be switched to fail
    #[derive(Debug, Default)]
    pub(crate) struct FlakyStore {
        pub failing: AtomicBool,
        pub saves: AtomicUsize,
        pub last: std::sync::Mutex<Option<RegistrySnapshot>>,
    }

    #[async_trait]
    impl StateStore for FlakyStore {
        async fn load(&self) -> AppResult<RegistrySnapshot> {
            Ok(self.last.lock().unwrap().clone().unwrap_or_default())
        }

        async fn save(&self, snapshot: &RegistrySnapshot) -> AppResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(AppError::persistence("disk unavailable"));
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(snapshot.clone());
            Ok(())
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    async fn registry_with_keys() -> CommunityRegistry {
        let registry = CommunityRegistry::new();
        let (community, _) = registry
            .configure(CommunityId(1), RoleId(2), "claim", None, false)
            .await
            .unwrap();
        community.add_keys(&["a", "b"], &KeyPolicy::default()).await;
        registry
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let store = Arc::new(FlakyStore::default());
        let gateway = PersistenceGateway::new(store.clone());
        let registry = registry_with_keys().await;

        assert!(gateway.persist(&registry).await);
        assert!(!gateway.is_dirty());

        let reloaded = gateway.load_registry().await.unwrap();
        assert_eq!(reloaded.get(CommunityId(1)).unwrap().count().await, 2);
    }

    #[tokio::test]
    async fn test_failure_marks_dirty_and_flush_recovers() {
        let store = Arc::new(FlakyStore::default());
        let gateway = PersistenceGateway::new(store.clone());
        let registry = registry_with_keys().await;

        store.failing.store(true, Ordering::SeqCst);
        assert!(!gateway.persist(&registry).await);
        assert!(gateway.is_dirty());
        // Memory is untouched by the failure
        assert_eq!(registry.get(CommunityId(1)).unwrap().count().await, 2);

        assert!(!gateway.flush_if_dirty(&registry).await);
        store.failing.store(false, Ordering::SeqCst);
        assert!(gateway.flush_if_dirty(&registry).await);
        assert!(!gateway.is_dirty());
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_flush_when_clean_skips_write() {
        let store = Arc::new(FlakyStore::default());
        let gateway = PersistenceGateway::new(store.clone());
        let registry = registry_with_keys().await;

        assert!(gateway.flush_if_dirty(&registry).await);
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
    }
}
