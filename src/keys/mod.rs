//! Key custody: plaintext validation and fingerprinting, the pool of
//! outstanding fingerprints, and the ledger of redeemed ones.

pub mod codec;
pub mod ledger;
pub mod pool;

pub use codec::{KeyFingerprint, KeyFormat, KeyFormatError, KeyPolicy, Salt, SecretCodec, SecretKey};
pub use ledger::{ClaimLedger, ClaimRecord, ClaimantId, RecordOutcome};
pub use pool::{AddCounts, AddOutcome, KeyEntry, KeyPool, RemoveCounts, RemoveOutcome};
