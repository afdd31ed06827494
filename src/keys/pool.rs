use super::codec::KeyFingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Presence marker for an available key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub added_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl KeyEntry {
    pub fn new(added_at: DateTime<Utc>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            added_at,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Created,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
}

/// Per-entry classification of a bulk add
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AddCounts {
    pub created: usize,
    pub duplicate: usize,
    pub invalid: usize,
}

impl AddCounts {
    pub fn tally(&mut self, outcome: AddOutcome) {
        match outcome {
            AddOutcome::Created => self.created += 1,
            AddOutcome::Duplicate => self.duplicate += 1,
        }
    }
}

/// Per-entry classification of a bulk remove
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemoveCounts {
    pub removed: usize,
    pub not_found: usize,
    pub invalid: usize,
}

impl RemoveCounts {
    pub fn tally(&mut self, outcome: RemoveOutcome) {
        match outcome {
            RemoveOutcome::Removed => self.removed += 1,
            RemoveOutcome::NotFound => self.not_found += 1,
        }
    }
}

/// Outstanding (unredeemed) fingerprints of one community
#[derive(Debug, Clone, Default)]
pub struct KeyPool {
    entries: HashMap<KeyFingerprint, KeyEntry>,
}

impl KeyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert if absent. An existing entry keeps its original metadata.
    pub fn insert(&mut self, fingerprint: KeyFingerprint, entry: KeyEntry) -> AddOutcome {
        use std::collections::hash_map::Entry;
        match self.entries.entry(fingerprint) {
            Entry::Occupied(_) => AddOutcome::Duplicate,
            Entry::Vacant(slot) => {
                slot.insert(entry);
                AddOutcome::Created
            }
        }
    }

    pub fn remove(&mut self, fingerprint: &KeyFingerprint) -> RemoveOutcome {
        match self.take(fingerprint) {
            Some(_) => RemoveOutcome::Removed,
            None => RemoveOutcome::NotFound,
        }
    }

    /// Remove and return the entry; the linearization point of a redemption.
    pub fn take(&mut self, fingerprint: &KeyFingerprint) -> Option<KeyEntry> {
        self.entries.remove(fingerprint)
    }

    pub fn get(&self, fingerprint: &KeyFingerprint) -> Option<&KeyEntry> {
        self.entries.get(fingerprint)
    }

    pub fn contains(&self, fingerprint: &KeyFingerprint) -> bool {
        self.entries.contains_key(fingerprint)
    }

    /// Empty the pool, returning how many entries were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count_expired(&self, now: DateTime<Utc>) -> usize {
        self.entries.values().filter(|e| e.is_expired(now)).count()
    }

    /// Drop every expired entry, returning how many were dropped.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KeyFingerprint, &KeyEntry)> {
        self.entries.iter()
    }
}

impl FromIterator<(KeyFingerprint, KeyEntry)> for KeyPool {
    fn from_iter<I: IntoIterator<Item = (KeyFingerprint, KeyEntry)>>(iter: I) -> Self {
        let mut pool = Self::new();
        for (fp, entry) in iter {
            pool.insert(fp, entry);
        }
        pool
    }
}
