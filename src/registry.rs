//! Per-guild key stores.
//!
//! Each [`Community`] owns its codec (and salt), key pool, claim ledger and
//! settings. Pool and ledger sit behind one mutex per community, so traffic
//! for unrelated guilds never contends. The mutex is only held for in-memory
//! check-and-mutate sequences, never across I/O.

use crate::error::{AppError, AppResult};
use crate::keys::{
    AddCounts, AddOutcome, ClaimLedger, KeyEntry, KeyPolicy, KeyPool, RemoveCounts, RemoveOutcome,
    Salt, SecretCodec, SecretKey,
};
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Platform guild id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommunityId(pub u64);

impl fmt::Display for CommunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Platform role id granted on redemption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub u64);

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const DEFAULT_CLAIM_COMMAND: &str = "claim";

/// Admin command names a claim command may not shadow
pub const RESERVED_COMMAND_NAMES: &[&str] = &[
    "sync",
    "setup",
    "addkey",
    "addkeys",
    "removekey",
    "removekeys",
    "clearkeys",
    "keys",
    "grimoire",
];

pub const DEFAULT_SUCCESS_MESSAGES: &[&str] = &[
    "🌟 The ancient runes accept your offering, {user}! You have been granted the {role} role!",
    "✨ The mystical gates open before you, {user}! Welcome to {role}!",
    "🔮 Your key resonates with power, {user}! The {role} role is yours!",
    "⚡ The realm recognizes your worth, {user}! Behold, you are now {role}!",
];

pub fn default_success_messages() -> Vec<String> {
    DEFAULT_SUCCESS_MESSAGES.iter().map(|s| s.to_string()).collect()
}

/// Normalise and check a claim command name.
///
/// Names follow slash-command rules: 1 to 32 characters of `[a-z0-9_-]`.
pub fn validate_command_name(name: &str) -> AppResult<String> {
    let name = name.trim().to_lowercase();
    if name.is_empty() || name.chars().count() > 32 {
        return Err(AppError::validation(
            "Command name must be between 1 and 32 characters",
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(AppError::validation(
            "Command name may only contain letters, digits, '-' and '_'",
        ));
    }
    if RESERVED_COMMAND_NAMES.contains(&name.as_str()) {
        return Err(AppError::validation(format!(
            "`{}` is reserved for an admin command",
            name
        )));
    }
    Ok(name)
}

/// Admin-controlled configuration of a community
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunitySettings {
    pub role_id: RoleId,
    pub command: String,
    /// Reject members who already redeemed a key here
    pub one_per_member: bool,
    pub success_messages: Vec<String>,
}

impl CommunitySettings {
    pub fn new(role_id: RoleId, command: String, one_per_member: bool) -> Self {
        Self {
            role_id,
            command,
            one_per_member,
            success_messages: default_success_messages(),
        }
    }
}

/// Time from receiving a claim to committing it, over successful claims
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClaimTiming {
    pub samples: u64,
    pub total: Duration,
    pub fastest: Option<Duration>,
    pub slowest: Option<Duration>,
}

impl ClaimTiming {
    pub fn record(&mut self, elapsed: Duration) {
        self.samples += 1;
        self.total = self.total.saturating_add(elapsed);
        self.fastest = Some(self.fastest.map_or(elapsed, |d| d.min(elapsed)));
        self.slowest = Some(self.slowest.map_or(elapsed, |d| d.max(elapsed)));
    }

    pub fn average(&self) -> Option<Duration> {
        let samples = u32::try_from(self.samples).ok().filter(|n| *n > 0)?;
        Some(self.total / samples)
    }
}

/// Activity counters since startup or the last clear
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommunityStats {
    pub keys_added: u64,
    pub keys_removed: u64,
    pub claim_attempts: u64,
    pub successful_claims: u64,
    pub failed_claims: u64,
    pub timing: ClaimTiming,
}

/// Everything guarded by a community's mutex
#[derive(Debug)]
pub struct CommunityState {
    pub settings: CommunitySettings,
    pub pool: KeyPool,
    pub ledger: ClaimLedger,
    pub stats: CommunityStats,
}

/// Read-only view used by the `keys` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyReport {
    /// Redeemable right now
    pub available: usize,
    /// Past their expiry, waiting for the next sweep
    pub expired: usize,
    /// `available + expired`
    pub in_pool: usize,
    pub claimed: usize,
    pub stats: CommunityStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigureOutcome {
    Created,
    /// Already configured; role and command were updated in place
    Updated { previous_command: String },
}

#[derive(Debug)]
pub struct Community {
    id: CommunityId,
    codec: SecretCodec,
    state: Mutex<CommunityState>,
}

impl Community {
    pub fn new(id: CommunityId, settings: CommunitySettings) -> Self {
        Self::restore(id, Salt::generate(), settings, KeyPool::new(), ClaimLedger::new())
    }

    /// Rebuild a community from persisted parts
    pub fn restore(
        id: CommunityId,
        salt: Salt,
        settings: CommunitySettings,
        pool: KeyPool,
        ledger: ClaimLedger,
    ) -> Self {
        Self {
            id,
            codec: SecretCodec::new(salt),
            state: Mutex::new(CommunityState {
                settings,
                pool,
                ledger,
                stats: CommunityStats::default(),
            }),
        }
    }

    pub fn id(&self) -> CommunityId {
        self.id
    }

    pub fn codec(&self) -> &SecretCodec {
        &self.codec
    }

    /// Enter the community's critical section
    pub async fn lock(&self) -> MutexGuard<'_, CommunityState> {
        self.state.lock().await
    }

    pub async fn settings(&self) -> CommunitySettings {
        self.lock().await.settings.clone()
    }

    pub async fn add_key(&self, key: &SecretKey, expires_at: Option<DateTime<Utc>>) -> AddOutcome {
        let fingerprint = self.codec.fingerprint(key);
        let mut state = self.lock().await;
        let outcome = if state.ledger.has_claimed(&fingerprint) {
            AddOutcome::Duplicate
        } else {
            state
                .pool
                .insert(fingerprint, KeyEntry::new(Utc::now(), expires_at))
        };
        if outcome == AddOutcome::Created {
            state.stats.keys_added += 1;
        }
        debug!(community = %self.id, key = %fingerprint.short(), ?outcome, "add key");
        outcome
    }

    /// Add a batch of raw plaintexts. Malformed entries are counted, never fatal.
    pub async fn add_keys<S: AsRef<str>>(&self, raw: &[S], policy: &KeyPolicy) -> AddCounts {
        let mut counts = AddCounts::default();
        let mut fingerprints = Vec::with_capacity(raw.len());
        for candidate in raw {
            match policy.parse(candidate.as_ref()) {
                Ok(key) => fingerprints.push(self.codec.fingerprint(&key)),
                Err(_) => counts.invalid += 1,
            }
        }

        let now = Utc::now();
        let mut state = self.lock().await;
        for fingerprint in fingerprints {
            // A redeemed key can never become available again
            if state.ledger.has_claimed(&fingerprint) {
                counts.duplicate += 1;
                continue;
            }
            counts.tally(state.pool.insert(fingerprint, KeyEntry::new(now, None)));
        }
        state.stats.keys_added += counts.created as u64;
        drop(state);

        info!(
            community = %self.id,
            created = counts.created,
            duplicate = counts.duplicate,
            invalid = counts.invalid,
            "bulk add"
        );
        counts
    }

    pub async fn remove_key(&self, key: &SecretKey) -> RemoveOutcome {
        let fingerprint = self.codec.fingerprint(key);
        let mut state = self.lock().await;
        let outcome = state.pool.remove(&fingerprint);
        if outcome == RemoveOutcome::Removed {
            state.stats.keys_removed += 1;
        }
        debug!(community = %self.id, key = %fingerprint.short(), ?outcome, "remove key");
        outcome
    }

    pub async fn remove_keys<S: AsRef<str>>(&self, raw: &[S], policy: &KeyPolicy) -> RemoveCounts {
        let mut counts = RemoveCounts::default();
        let mut fingerprints = Vec::with_capacity(raw.len());
        for candidate in raw {
            match policy.parse(candidate.as_ref()) {
                Ok(key) => fingerprints.push(self.codec.fingerprint(&key)),
                Err(_) => counts.invalid += 1,
            }
        }

        let mut state = self.lock().await;
        for fingerprint in &fingerprints {
            counts.tally(state.pool.remove(fingerprint));
        }
        state.stats.keys_removed += counts.removed as u64;
        drop(state);

        info!(
            community = %self.id,
            removed = counts.removed,
            not_found = counts.not_found,
            invalid = counts.invalid,
            "bulk remove"
        );
        counts
    }

    /// Empty the pool and reset the counters. The ledger is kept.
    pub async fn clear(&self) -> usize {
        let mut state = self.lock().await;
        let removed = state.pool.clear();
        state.stats = CommunityStats::default();
        info!(community = %self.id, removed, "cleared key pool");
        removed
    }

    /// Keys that can still be redeemed. Expired entries awaiting a sweep are
    /// not counted.
    pub async fn count(&self) -> usize {
        let state = self.lock().await;
        state.pool.len() - state.pool.count_expired(Utc::now())
    }

    pub async fn has_claimed(&self, key: &SecretKey) -> bool {
        let fingerprint = self.codec.fingerprint(key);
        self.lock().await.ledger.has_claimed(&fingerprint)
    }

    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.lock().await;
        let swept = state.pool.sweep_expired(now);
        state.stats.keys_removed += swept as u64;
        swept
    }

    pub async fn report(&self) -> KeyReport {
        let state = self.lock().await;
        let in_pool = state.pool.len();
        let expired = state.pool.count_expired(Utc::now());
        KeyReport {
            available: in_pool - expired,
            expired,
            in_pool,
            claimed: state.ledger.len(),
            stats: state.stats,
        }
    }
}

/// All configured communities of this process
#[derive(Debug, Default)]
pub struct CommunityRegistry {
    communities: DashMap<CommunityId, Arc<Community>>,
}

impl CommunityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a community, or update role and command of an existing one.
    ///
    /// `one_per_member` of `None` keeps the current policy (or uses
    /// `default_one_per_member` for a new community).
    pub async fn configure(
        &self,
        id: CommunityId,
        role_id: RoleId,
        command: &str,
        one_per_member: Option<bool>,
        default_one_per_member: bool,
    ) -> AppResult<(Arc<Community>, ConfigureOutcome)> {
        let command = validate_command_name(command)?;

        let existing = match self.communities.entry(id) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let settings = CommunitySettings::new(
                    role_id,
                    command,
                    one_per_member.unwrap_or(default_one_per_member),
                );
                let community = Arc::new(Community::new(id, settings));
                entry.insert(community.clone());
                info!(community = %id, role = %role_id, "community created");
                return Ok((community, ConfigureOutcome::Created));
            }
        };

        let mut state = existing.lock().await;
        let previous_command = std::mem::replace(&mut state.settings.command, command);
        state.settings.role_id = role_id;
        if let Some(policy) = one_per_member {
            state.settings.one_per_member = policy;
        }
        drop(state);

        info!(community = %id, role = %role_id, "community reconfigured");
        Ok((existing, ConfigureOutcome::Updated { previous_command }))
    }

    pub fn get(&self, id: CommunityId) -> Option<Arc<Community>> {
        self.communities.get(&id).map(|c| c.value().clone())
    }

    /// Like [`get`](Self::get), but absence is an error
    pub fn require(&self, id: CommunityId) -> AppResult<Arc<Community>> {
        self.get(id).ok_or(AppError::UnknownCommunity(id.0))
    }

    /// Install a restored community, replacing any with the same id
    pub fn insert(&self, community: Community) {
        self.communities.insert(community.id(), Arc::new(community));
    }

    pub fn communities(&self) -> Vec<Arc<Community>> {
        let mut all: Vec<_> = self.communities.iter().map(|c| c.value().clone()).collect();
        all.sort_by_key(|c| c.id());
        all
    }

    pub fn len(&self) -> usize {
        self.communities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.communities.is_empty()
    }
}
