//! Entry point for the Discord shell.
//!
//! [`Keeper`] maps each admin and member command onto the registry, the
//! redemption coordinator and the persistence gateway. State changes are
//! committed in memory first; the snapshot write happens afterwards, outside
//! any community lock.

use crate::error::{AppError, AppResult};
use crate::keys::{AddCounts, AddOutcome, ClaimantId, KeyPolicy, RemoveCounts, RemoveOutcome, SecretKey};
use crate::redeem::{RedemptionCoordinator, Verdict};
use crate::registry::{
    CommunityId, CommunityRegistry, CommunitySettings, ConfigureOutcome, KeyReport, RoleId,
};
use crate::storage::{PersistenceGateway, StateStore};
use chrono::{Duration, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub struct Keeper {
    registry: Arc<CommunityRegistry>,
    coordinator: RedemptionCoordinator,
    gateway: PersistenceGateway,
    policy: KeyPolicy,
    one_per_member_default: bool,
}

impl Keeper {
    /// Load the durable state from `store`. Fails if the store is unreadable.
    pub async fn open(
        store: Arc<dyn StateStore>,
        policy: KeyPolicy,
        one_per_member_default: bool,
    ) -> AppResult<Self> {
        let gateway = PersistenceGateway::new(store);
        let registry = Arc::new(gateway.load_registry().await?);
        Ok(Self {
            coordinator: RedemptionCoordinator::new(registry.clone(), policy),
            registry,
            gateway,
            policy,
            one_per_member_default,
        })
    }

    pub fn registry(&self) -> &Arc<CommunityRegistry> {
        &self.registry
    }

    fn parse(&self, raw: &str) -> AppResult<SecretKey> {
        self.policy
            .parse(raw)
            .map_err(|e| AppError::validation(e.to_string()))
    }

    async fn persist(&self) {
        if !self.gateway.persist(&self.registry).await {
            warn!("State change kept in memory only; will retry");
        }
    }

    /// `/setup`: create or reconfigure a community
    pub async fn setup(
        &self,
        community_id: CommunityId,
        role_id: RoleId,
        command: &str,
        one_per_member: Option<bool>,
    ) -> AppResult<ConfigureOutcome> {
        let (_, outcome) = self
            .registry
            .configure(
                community_id,
                role_id,
                command,
                one_per_member,
                self.one_per_member_default,
            )
            .await?;
        self.persist().await;
        Ok(outcome)
    }

    pub async fn settings(&self, community_id: CommunityId) -> AppResult<CommunitySettings> {
        Ok(self.registry.require(community_id)?.settings().await)
    }

    /// `/addkey`, optionally with a lifetime
    pub async fn add_key(
        &self,
        community_id: CommunityId,
        raw: &str,
        expires_in: Option<Duration>,
    ) -> AppResult<AddOutcome> {
        let community = self.registry.require(community_id)?;
        let key = self.parse(raw)?;
        let expires_at = match expires_in {
            Some(lifetime) => Some(
                Utc::now()
                    .checked_add_signed(lifetime)
                    .ok_or_else(|| AppError::validation("Lifetime is too long"))?,
            ),
            None => None,
        };
        let outcome = community.add_key(&key, expires_at).await;
        if outcome == AddOutcome::Created {
            self.persist().await;
        }
        Ok(outcome)
    }

    pub async fn add_keys<S: AsRef<str>>(
        &self,
        community_id: CommunityId,
        raw: &[S],
    ) -> AppResult<AddCounts> {
        let community = self.registry.require(community_id)?;
        let counts = community.add_keys(raw, &self.policy).await;
        if counts.created > 0 {
            self.persist().await;
        }
        Ok(counts)
    }

    pub async fn remove_key(&self, community_id: CommunityId, raw: &str) -> AppResult<RemoveOutcome> {
        let community = self.registry.require(community_id)?;
        let key = self.parse(raw)?;
        let outcome = community.remove_key(&key).await;
        if outcome == RemoveOutcome::Removed {
            self.persist().await;
        }
        Ok(outcome)
    }

    pub async fn remove_keys<S: AsRef<str>>(
        &self,
        community_id: CommunityId,
        raw: &[S],
    ) -> AppResult<RemoveCounts> {
        let community = self.registry.require(community_id)?;
        let counts = community.remove_keys(raw, &self.policy).await;
        if counts.removed > 0 {
            self.persist().await;
        }
        Ok(counts)
    }

    /// `/clearkeys`: empty the pool. Claims are kept.
    pub async fn clear_keys(&self, community_id: CommunityId) -> AppResult<usize> {
        let community = self.registry.require(community_id)?;
        let removed = community.clear().await;
        if removed > 0 {
            self.persist().await;
        }
        Ok(removed)
    }

    pub async fn count(&self, community_id: CommunityId) -> AppResult<usize> {
        Ok(self.registry.require(community_id)?.count().await)
    }

    /// `/keys`: availability plus counters
    pub async fn report(&self, community_id: CommunityId) -> AppResult<KeyReport> {
        Ok(self.registry.require(community_id)?.report().await)
    }

    pub async fn has_claimed(&self, community_id: CommunityId, raw: &str) -> AppResult<bool> {
        let community = self.registry.require(community_id)?;
        let key = self.parse(raw)?;
        Ok(community.has_claimed(&key).await)
    }

    /// Member claim command
    pub async fn redeem(
        &self,
        community_id: CommunityId,
        claimant: ClaimantId,
        plaintext: &str,
    ) -> Verdict {
        let attempt = self.coordinator.attempt(community_id, claimant, plaintext).await;
        if attempt.pool_changed {
            self.persist().await;
        }
        attempt.verdict
    }

    /// Drop expired keys from every pool
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let sweeps = self.registry.communities().into_iter().map(|community| async move {
            let removed = community.sweep_expired(now).await;
            if removed > 0 {
                info!(community = %community.id(), removed, "swept expired keys");
            }
            removed
        });
        let swept: usize = join_all(sweeps).await.into_iter().sum();
        if swept > 0 {
            self.persist().await;
        }
        swept
    }

    pub fn is_dirty(&self) -> bool {
        self.gateway.is_dirty()
    }

    /// Retry a previously failed save
    pub async fn flush_if_dirty(&self) -> bool {
        self.gateway.flush_if_dirty(&self.registry).await
    }

    /// Unconditional save, used at shutdown
    pub async fn flush(&self) -> bool {
        self.gateway.persist(&self.registry).await
    }
}
