use crate::error::{AppError, AppResult};
use crate::keys::{ClaimLedger, ClaimRecord, KeyEntry, KeyFingerprint, KeyPool, Salt};
use crate::registry::{
    default_success_messages, Community, CommunityId, CommunityRegistry, CommunitySettings, RoleId,
    DEFAULT_CLAIM_COMMAND,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Current layout version of the persisted registry
pub const STATE_VERSION: u32 = 1;

fn default_version() -> u32 {
    STATE_VERSION
}

fn default_command() -> String {
    DEFAULT_CLAIM_COMMAND.to_string()
}

/// An available key as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKey {
    pub fingerprint: KeyFingerprint,
    #[serde(flatten)]
    pub entry: KeyEntry,
}

/// Persisted form of one community
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityRecord {
    pub community_id: CommunityId,
    pub role_id: RoleId,
    #[serde(default = "default_command")]
    pub command: String,
    /// Base64 salt of the fingerprint hash
    pub salt: String,
    #[serde(default)]
    pub one_per_member: bool,
    #[serde(default = "default_success_messages")]
    pub success_messages: Vec<String>,
    #[serde(default)]
    pub keys: Vec<StoredKey>,
    /// Append-only, in redemption order
    #[serde(default)]
    pub claims: Vec<ClaimRecord>,
}

impl CommunityRecord {
    /// Copy a community's state. Holds its lock only for the copy.
    pub async fn capture(community: &Community) -> Self {
        let state = community.lock().await;
        let mut keys: Vec<StoredKey> = state
            .pool
            .iter()
            .map(|(fp, entry)| StoredKey {
                fingerprint: *fp,
                entry: *entry,
            })
            .collect();
        let claims = state.ledger.records().to_vec();
        let settings = state.settings.clone();
        drop(state);

        keys.sort_by_key(|k| k.fingerprint.to_hex());
        Self {
            community_id: community.id(),
            role_id: settings.role_id,
            command: settings.command,
            salt: community.codec().salt().to_base64(),
            one_per_member: settings.one_per_member,
            success_messages: settings.success_messages,
            keys,
            claims,
        }
    }

    /// Rebuild the in-memory community. Pool entries that already appear in
    /// the ledger are dropped.
    pub fn into_community(self) -> AppResult<Community> {
        let salt = Salt::from_base64(&self.salt).map_err(|e| {
            AppError::persistence(format!("community {}: bad salt: {}", self.community_id, e))
        })?;

        let ledger: ClaimLedger = self.claims.into_iter().collect();
        let mut overlap = 0usize;
        let pool: KeyPool = self
            .keys
            .into_iter()
            .filter(|k| {
                let claimed = ledger.has_claimed(&k.fingerprint);
                if claimed {
                    overlap += 1;
                }
                !claimed
            })
            .map(|k| (k.fingerprint, k.entry))
            .collect();
        if overlap > 0 {
            warn!(
                community = %self.community_id,
                overlap,
                "dropped available keys that were already redeemed"
            );
        }

        let settings = CommunitySettings {
            role_id: self.role_id,
            command: self.command,
            one_per_member: self.one_per_member,
            success_messages: self.success_messages,
        };
        Ok(Community::restore(self.community_id, salt, settings, pool, ledger))
    }
}

/// Whole-registry state handed to a [`StateStore`](super::StateStore)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub communities: Vec<CommunityRecord>,
}

impl Default for RegistrySnapshot {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            communities: Vec::new(),
        }
    }
}

impl RegistrySnapshot {
    pub async fn capture(registry: &CommunityRegistry) -> Self {
        let mut communities = Vec::with_capacity(registry.len());
        for community in registry.communities() {
            communities.push(CommunityRecord::capture(&community).await);
        }
        Self {
            version: STATE_VERSION,
            communities,
        }
    }

    pub fn into_registry(self) -> AppResult<CommunityRegistry> {
        let registry = CommunityRegistry::new();
        for record in self.communities {
            registry.insert(record.into_community()?);
        }
        Ok(registry)
    }

    pub fn key_count(&self) -> usize {
        self.communities.iter().map(|c| c.keys.len()).sum()
    }
}
