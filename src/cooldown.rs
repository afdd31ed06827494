use crate::keys::ClaimantId;
use crate::registry::CommunityId;
use dashmap::{mapref::entry::Entry, DashMap};
use std::time::{Duration, Instant};
use tracing::debug;

/// Per-member throttle on claim attempts within one community.
///
/// Lives in the shell: redemption stays correct without it, it only slows
/// down members guessing keys.
#[derive(Debug)]
pub struct ClaimCooldown {
    period: Duration,
    last_attempt: DashMap<(CommunityId, ClaimantId), Instant>,
}

impl ClaimCooldown {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_attempt: DashMap::new(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Register an attempt made at `now`.
    ///
    /// Returns `None` when the attempt may proceed, or the time left until
    /// the member may try again. A refused attempt does not restart the
    /// window.
    pub fn check_at(
        &self,
        community_id: CommunityId,
        claimant: ClaimantId,
        now: Instant,
    ) -> Option<Duration> {
        if self.period.is_zero() {
            return None;
        }

        match self.last_attempt.entry((community_id, claimant)) {
            Entry::Vacant(entry) => {
                entry.insert(now);
                None
            }
            Entry::Occupied(mut entry) => {
                let elapsed = now.saturating_duration_since(*entry.get());
                if elapsed >= self.period {
                    entry.insert(now);
                    None
                } else {
                    Some(self.period - elapsed)
                }
            }
        }
    }

    pub fn check(&self, community_id: CommunityId, claimant: ClaimantId) -> Option<Duration> {
        self.check_at(community_id, claimant, Instant::now())
    }

    pub fn reset(&self, community_id: CommunityId, claimant: ClaimantId) {
        self.last_attempt.remove(&(community_id, claimant));
    }

    /// Forget entries whose window has passed
    pub fn cleanup_expired(&self) -> usize {
        let before = self.last_attempt.len();
        let period = self.period;
        self.last_attempt
            .retain(|_, last| last.elapsed() < period);
        let removed = before.saturating_sub(self.last_attempt.len());
        if removed > 0 {
            debug!(removed, "cleaned up expired claim cooldowns");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.last_attempt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_attempt.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUILD: CommunityId = CommunityId(1);
    const MEMBER: ClaimantId = ClaimantId(10);

    #[test]
    fn test_first_attempt_passes_then_throttled() {
        let cooldown = ClaimCooldown::new(Duration::from_secs(300));
        let start = Instant::now();
        assert_eq!(cooldown.check_at(GUILD, MEMBER, start), None);

        let left = cooldown
            .check_at(GUILD, MEMBER, start + Duration::from_secs(100))
            .unwrap();
        assert_eq!(left, Duration::from_secs(200));
    }

    #[test]
    fn test_refused_attempt_does_not_extend_window() {
        let cooldown = ClaimCooldown::new(Duration::from_secs(300));
        let start = Instant::now();
        cooldown.check_at(GUILD, MEMBER, start);
        assert!(cooldown.check_at(GUILD, MEMBER, start + Duration::from_secs(299)).is_some());
        assert_eq!(cooldown.check_at(GUILD, MEMBER, start + Duration::from_secs(300)), None);
    }

    #[test]
    fn test_scoped_per_community_and_member() {
        let cooldown = ClaimCooldown::new(Duration::from_secs(300));
        let now = Instant::now();
        cooldown.check_at(GUILD, MEMBER, now);
        let later = now + Duration::from_secs(1);
        assert_eq!(cooldown.check_at(CommunityId(2), MEMBER, later), None);
        assert_eq!(cooldown.check_at(GUILD, ClaimantId(11), later), None);
        assert!(cooldown.check_at(GUILD, MEMBER, later).is_some());
    }

    #[test]
    fn test_reset_and_zero_period() {
        let cooldown = ClaimCooldown::new(Duration::from_secs(300));
        let now = Instant::now();
        cooldown.check_at(GUILD, MEMBER, now);
        cooldown.reset(GUILD, MEMBER);
        assert_eq!(cooldown.check_at(GUILD, MEMBER, now + Duration::from_secs(1)), None);

        let disabled = ClaimCooldown::new(Duration::ZERO);
        assert_eq!(disabled.check(GUILD, MEMBER), None);
        assert_eq!(disabled.check(GUILD, MEMBER), None);
        assert!(disabled.is_empty());
    }

    #[test]
    fn test_cleanup_expired() {
        let cooldown = ClaimCooldown::new(Duration::from_millis(10));
        cooldown.check(GUILD, MEMBER);
        cooldown.check(GUILD, ClaimantId(11));
        assert_eq!(cooldown.len(), 2);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cooldown.cleanup_expired(), 2);
        assert!(cooldown.is_empty());
    }
}
