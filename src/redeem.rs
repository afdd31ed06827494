//! The redemption transaction.
//!
//! An attempt moves through `received -> validated -> verified -> committed`
//! and stops at the first failing step with a [`RejectReason`]. Verification
//! and commit happen inside the community's critical section: removing the
//! fingerprint from the pool is the linearization point, and the ledger write
//! is only attempted after that removal succeeded. Of N concurrent attempts
//! with the same key exactly one can observe it in the pool.

use crate::keys::{ClaimRecord, ClaimantId, KeyPolicy, RecordOutcome};
use crate::registry::{CommunityId, CommunityRegistry, RoleId};
use chrono::Utc;
use rand::seq::SliceRandom;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Why a redemption did not go through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownCommunity,
    MalformedKey,
    /// Never existed, already redeemed, removed or expired. Deliberately not
    /// told apart to the member.
    InvalidOrUsedKey,
    /// One-key-per-member policy is on and the member already redeemed one
    AlreadyRewarded,
}

impl RejectReason {
    /// Member-facing text
    pub fn message(&self) -> &'static str {
        match self {
            Self::UnknownCommunity => "This server has not been set up yet. Ask an admin to run /setup.",
            Self::MalformedKey => "That does not look like a valid key.",
            Self::InvalidOrUsedKey => "Invalid or already used key!",
            Self::AlreadyRewarded => "You have already redeemed a key in this server.",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnknownCommunity => "unknown_community",
            Self::MalformedKey => "malformed_key",
            Self::InvalidOrUsedKey => "invalid_or_used_key",
            Self::AlreadyRewarded => "already_rewarded",
        };
        f.write_str(name)
    }
}

/// A committed redemption, handed to the shell to apply the role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redemption {
    pub community_id: CommunityId,
    pub role_id: RoleId,
    pub record: ClaimRecord,
    /// Success message template with `{user}` and `{role}` placeholders
    pub message_template: String,
}

impl Redemption {
    pub fn render_message(&self, user: &str, role: &str) -> String {
        self.message_template
            .replace("{user}", user)
            .replace("{role}", role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Committed(Redemption),
    Rejected(RejectReason),
}

impl Verdict {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Committed(_) => None,
            Self::Rejected(reason) => Some(*reason),
        }
    }
}

/// A verdict plus whether the attempt changed durable state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub verdict: Verdict,
    /// A key left the pool, either redeemed or dropped as expired
    pub pool_changed: bool,
}

impl Attempt {
    fn rejected(reason: RejectReason) -> Self {
        Self {
            verdict: Verdict::Rejected(reason),
            pool_changed: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedemptionCoordinator {
    registry: Arc<CommunityRegistry>,
    policy: KeyPolicy,
}

impl RedemptionCoordinator {
    pub fn new(registry: Arc<CommunityRegistry>, policy: KeyPolicy) -> Self {
        Self { registry, policy }
    }

    /// Attempt to redeem `plaintext` for `claimant` in `community_id`.
    ///
    /// Never fails: every outcome is a [`Verdict`].
    pub async fn redeem(
        &self,
        community_id: CommunityId,
        claimant: ClaimantId,
        plaintext: &str,
    ) -> Verdict {
        self.attempt(community_id, claimant, plaintext).await.verdict
    }

    /// Like [`redeem`](Self::redeem), also reporting whether the pool changed
    pub async fn attempt(
        &self,
        community_id: CommunityId,
        claimant: ClaimantId,
        plaintext: &str,
    ) -> Attempt {
        let started = Instant::now();
        let Some(community) = self.registry.get(community_id) else {
            debug!(community = %community_id, claimant = %claimant, "redeem for unconfigured community");
            return Attempt::rejected(RejectReason::UnknownCommunity);
        };

        let fingerprint = match self.policy.parse(plaintext) {
            Ok(key) => community.codec().fingerprint(&key),
            Err(e) => {
                debug!(community = %community_id, claimant = %claimant, "malformed key: {}", e);
                let mut state = community.lock().await;
                state.stats.claim_attempts += 1;
                state.stats.failed_claims += 1;
                return Attempt::rejected(RejectReason::MalformedKey);
            }
        };

        let now = Utc::now();
        let mut state = community.lock().await;
        state.stats.claim_attempts += 1;

        if state.settings.one_per_member && state.ledger.claimant_already_rewarded(claimant) {
            state.stats.failed_claims += 1;
            info!(
                community = %community_id,
                claimant = %claimant,
                redeemed = state.ledger.claims_by(claimant),
                "claimant already rewarded"
            );
            return Attempt::rejected(RejectReason::AlreadyRewarded);
        }

        let Some(entry) = state.pool.take(&fingerprint) else {
            state.stats.failed_claims += 1;
            if let Some(prior) = state.ledger.get(&fingerprint) {
                info!(
                    community = %community_id,
                    claimant = %claimant,
                    key = %fingerprint.short(),
                    redeemed_by = %prior.claimant_id,
                    redeemed_at = %prior.claimed_at,
                    "key already redeemed"
                );
            } else {
                debug!(community = %community_id, claimant = %claimant, "unknown key");
            }
            return Attempt::rejected(RejectReason::InvalidOrUsedKey);
        };

        if entry.is_expired(now) {
            state.stats.failed_claims += 1;
            state.stats.keys_removed += 1;
            info!(
                community = %community_id,
                claimant = %claimant,
                key = %fingerprint.short(),
                "expired key dropped on redemption"
            );
            return Attempt {
                verdict: Verdict::Rejected(RejectReason::InvalidOrUsedKey),
                pool_changed: true,
            };
        }

        match state.ledger.record(fingerprint, claimant, now) {
            RecordOutcome::Recorded => {}
            RecordOutcome::AlreadyRecorded => {
                // Pool and ledger overlapped; the key stays consumed
                state.stats.failed_claims += 1;
                error!(
                    community = %community_id,
                    key = %fingerprint.short(),
                    "fingerprint was both available and redeemed"
                );
                return Attempt {
                    verdict: Verdict::Rejected(RejectReason::InvalidOrUsedKey),
                    pool_changed: true,
                };
            }
        }

        state.stats.successful_claims += 1;
        state.stats.timing.record(started.elapsed());
        let message_template = state
            .settings
            .success_messages
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| "✅ {user} has been granted {role}!".to_string());
        let role_id = state.settings.role_id;
        let record = ClaimRecord {
            fingerprint,
            claimant_id: claimant,
            claimed_at: now,
        };
        drop(state);

        info!(
            community = %community_id,
            claimant = %claimant,
            key = %fingerprint.short(),
            role = %role_id,
            "key redeemed"
        );

        Attempt {
            verdict: Verdict::Committed(Redemption {
                community_id,
                role_id,
                record,
                message_template,
            }),
            pool_changed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyFormat, KeyPolicy};
    use chrono::Duration;

    async fn setup(one_per_member: bool) -> (Arc<CommunityRegistry>, RedemptionCoordinator) {
        let registry = Arc::new(CommunityRegistry::new());
        let (community, _) = registry
            .configure(CommunityId(1), RoleId(77), "claim", Some(one_per_member), false)
            .await
            .unwrap();
        community
            .add_keys(&["alpha", "beta"], &KeyPolicy::default())
            .await;
        let coordinator = RedemptionCoordinator::new(registry.clone(), KeyPolicy::default());
        (registry, coordinator)
    }

    #[tokio::test]
    async fn test_redeem_once() {
        let (registry, coordinator) = setup(false).await;
        let verdict = coordinator.redeem(CommunityId(1), ClaimantId(5), "alpha").await;
        let Verdict::Committed(redemption) = verdict else {
            panic!("expected commit, got {:?}", verdict);
        };
        assert_eq!(redemption.role_id, RoleId(77));
        assert_eq!(redemption.record.claimant_id, ClaimantId(5));

        let community = registry.get(CommunityId(1)).unwrap();
        assert_eq!(community.count().await, 1);
        let alpha = KeyPolicy::default().parse("alpha").unwrap();
        assert!(community.has_claimed(&alpha).await);
    }

    #[tokio::test]
    async fn test_second_redeem_rejected_for_everyone() {
        let (_, coordinator) = setup(false).await;
        assert!(coordinator
            .redeem(CommunityId(1), ClaimantId(5), "alpha")
            .await
            .is_committed());
        for claimant in [5, 6] {
            let verdict = coordinator
                .redeem(CommunityId(1), ClaimantId(claimant), "alpha")
                .await;
            assert_eq!(verdict, Verdict::Rejected(RejectReason::InvalidOrUsedKey));
        }
    }

    #[tokio::test]
    async fn test_unknown_community() {
        let (_, coordinator) = setup(false).await;
        let verdict = coordinator.redeem(CommunityId(2), ClaimantId(5), "alpha").await;
        assert_eq!(verdict.reject_reason(), Some(RejectReason::UnknownCommunity));
    }

    #[tokio::test]
    async fn test_malformed_key_does_not_touch_pool() {
        let (registry, coordinator) = setup(false).await;
        let verdict = coordinator.redeem(CommunityId(1), ClaimantId(5), "  ").await;
        assert_eq!(verdict.reject_reason(), Some(RejectReason::MalformedKey));
        let report = registry.get(CommunityId(1)).unwrap().report().await;
        assert_eq!(report.available, 2);
        assert_eq!(report.stats.failed_claims, 1);
    }

    #[tokio::test]
    async fn test_uuid_policy_rejects_free_text() {
        let registry = Arc::new(CommunityRegistry::new());
        registry
            .configure(CommunityId(1), RoleId(1), "claim", None, false)
            .await
            .unwrap();
        let coordinator =
            RedemptionCoordinator::new(registry, KeyPolicy::new(KeyFormat::Uuid, 64));
        let verdict = coordinator.redeem(CommunityId(1), ClaimantId(1), "alpha").await;
        assert_eq!(verdict.reject_reason(), Some(RejectReason::MalformedKey));
    }

    #[tokio::test]
    async fn test_one_per_member_policy() {
        let (registry, coordinator) = setup(true).await;
        assert!(coordinator
            .redeem(CommunityId(1), ClaimantId(5), "alpha")
            .await
            .is_committed());
        let verdict = coordinator.redeem(CommunityId(1), ClaimantId(5), "beta").await;
        assert_eq!(verdict.reject_reason(), Some(RejectReason::AlreadyRewarded));
        // The unused key is still available to someone else
        assert_eq!(registry.get(CommunityId(1)).unwrap().count().await, 1);
        assert!(coordinator
            .redeem(CommunityId(1), ClaimantId(6), "beta")
            .await
            .is_committed());
    }

    #[tokio::test]
    async fn test_policy_off_allows_second_key() {
        let (_, coordinator) = setup(false).await;
        assert!(coordinator.redeem(CommunityId(1), ClaimantId(5), "alpha").await.is_committed());
        assert!(coordinator.redeem(CommunityId(1), ClaimantId(5), "beta").await.is_committed());
    }

    #[tokio::test]
    async fn test_expired_key_is_rejected_and_dropped() {
        let (registry, coordinator) = setup(false).await;
        let community = registry.get(CommunityId(1)).unwrap();
        let old = KeyPolicy::default().parse("old").unwrap();
        community
            .add_key(&old, Some(Utc::now() - Duration::seconds(1)))
            .await;
        // Expired keys are not counted as available
        assert_eq!(community.count().await, 2);
        assert_eq!(community.report().await.in_pool, 3);

        let attempt = coordinator.attempt(CommunityId(1), ClaimantId(5), "old").await;
        assert_eq!(attempt.verdict.reject_reason(), Some(RejectReason::InvalidOrUsedKey));
        assert!(attempt.pool_changed);
        assert_eq!(community.report().await.in_pool, 2);
        assert!(!community.has_claimed(&old).await);
    }

    #[tokio::test]
    async fn test_only_consuming_attempts_change_pool() {
        let (_, coordinator) = setup(false).await;
        for plaintext in ["nope", "  "] {
            let attempt = coordinator.attempt(CommunityId(1), ClaimantId(5), plaintext).await;
            assert!(!attempt.pool_changed);
        }
        assert!(!coordinator.attempt(CommunityId(9), ClaimantId(5), "alpha").await.pool_changed);

        let attempt = coordinator.attempt(CommunityId(1), ClaimantId(5), "alpha").await;
        assert!(attempt.verdict.is_committed());
        assert!(attempt.pool_changed);
    }

    #[tokio::test]
    async fn test_successful_claims_are_timed() {
        let (registry, coordinator) = setup(false).await;
        coordinator.redeem(CommunityId(1), ClaimantId(5), "nope").await;
        let timing = registry.get(CommunityId(1)).unwrap().report().await.stats.timing;
        assert_eq!(timing.average(), None);

        coordinator.redeem(CommunityId(1), ClaimantId(5), "alpha").await;
        coordinator.redeem(CommunityId(1), ClaimantId(6), "beta").await;
        let timing = registry.get(CommunityId(1)).unwrap().report().await.stats.timing;
        assert_eq!(timing.samples, 2);
        let (fastest, slowest) = (timing.fastest.unwrap(), timing.slowest.unwrap());
        assert!(fastest <= slowest);
        let average = timing.average().unwrap();
        assert!(fastest <= average && average <= slowest);
    }

    #[tokio::test]
    async fn test_stats_track_attempts() {
        let (registry, coordinator) = setup(false).await;
        coordinator.redeem(CommunityId(1), ClaimantId(5), "alpha").await;
        coordinator.redeem(CommunityId(1), ClaimantId(6), "alpha").await;
        coordinator.redeem(CommunityId(1), ClaimantId(6), "nope").await;
        let stats = registry.get(CommunityId(1)).unwrap().report().await.stats;
        assert_eq!(stats.claim_attempts, 3);
        assert_eq!(stats.successful_claims, 1);
        assert_eq!(stats.failed_claims, 2);
    }

    #[test]
    fn test_render_message() {
        let redemption = Redemption {
            community_id: CommunityId(1),
            role_id: RoleId(2),
            record: ClaimRecord {
                fingerprint: crate::keys::SecretCodec::new(crate::keys::Salt::generate())
                    .fingerprint(&KeyPolicy::default().parse("k").unwrap()),
                claimant_id: ClaimantId(3),
                claimed_at: Utc::now(),
            },
            message_template: "Welcome {user}, you are now {role}".to_string(),
        };
        assert_eq!(
            redemption.render_message("<@3>", "<@&2>"),
            "Welcome <@3>, you are now <@&2>"
        );
    }
}
