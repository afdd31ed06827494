use super::codec::KeyFingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Platform identity of a member, trusted as given
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimantId(pub u64);

impl fmt::Display for ClaimantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A redeemed key: who took it and when
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub fingerprint: KeyFingerprint,
    pub claimant_id: ClaimantId,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    AlreadyRecorded,
}

/// Append-only record of redeemed fingerprints for one community.
///
/// At most one record exists per fingerprint. Records are never replaced or
/// removed; `clear` on the pool leaves the ledger untouched.
#[derive(Debug, Clone, Default)]
pub struct ClaimLedger {
    records: Vec<ClaimRecord>,
    by_fingerprint: HashMap<KeyFingerprint, usize>,
    // ClaimantIndex: claimant -> number of keys redeemed
    by_claimant: HashMap<ClaimantId, usize>,
}

impl ClaimLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_claimed(&self, fingerprint: &KeyFingerprint) -> bool {
        self.by_fingerprint.contains_key(fingerprint)
    }

    pub fn get(&self, fingerprint: &KeyFingerprint) -> Option<&ClaimRecord> {
        self.by_fingerprint.get(fingerprint).map(|&i| &self.records[i])
    }

    /// Insert-if-absent.
    pub fn record(
        &mut self,
        fingerprint: KeyFingerprint,
        claimant_id: ClaimantId,
        claimed_at: DateTime<Utc>,
    ) -> RecordOutcome {
        if self.by_fingerprint.contains_key(&fingerprint) {
            return RecordOutcome::AlreadyRecorded;
        }
        self.by_fingerprint.insert(fingerprint, self.records.len());
        *self.by_claimant.entry(claimant_id).or_default() += 1;
        self.records.push(ClaimRecord {
            fingerprint,
            claimant_id,
            claimed_at,
        });
        RecordOutcome::Recorded
    }

    pub fn claimant_already_rewarded(&self, claimant_id: ClaimantId) -> bool {
        self.by_claimant.contains_key(&claimant_id)
    }

    pub fn claims_by(&self, claimant_id: ClaimantId) -> usize {
        self.by_claimant.get(&claimant_id).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in the order they were written
    pub fn records(&self) -> &[ClaimRecord] {
        &self.records
    }
}

impl FromIterator<ClaimRecord> for ClaimLedger {
    /// Rebuilds the ledger and its claimant index. A repeated fingerprint keeps
    /// the first record.
    fn from_iter<I: IntoIterator<Item = ClaimRecord>>(iter: I) -> Self {
        let mut ledger = Self::new();
        for record in iter {
            ledger.record(record.fingerprint, record.claimant_id, record.claimed_at);
        }
        ledger
    }
}
