//! Plaintext keys, their validation, and the one-way fingerprints stored in
//! place of them.
//!
//! [`SecretKey`] is the only type that ever holds a plaintext key. It cannot be
//! serialized, its `Debug` output is redacted and its memory is zeroized on
//! drop. Everything downstream of [`SecretCodec::fingerprint`] works on
//! [`KeyFingerprint`] values only.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length in bytes of salts and fingerprints
pub const DIGEST_LEN: usize = 32;

/// Why a candidate plaintext was refused before hashing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyFormatError {
    #[error("Key must not be empty")]
    Empty,

    #[error("Key is too long ({len} characters, maximum is {max})")]
    TooLong { len: usize, max: usize },

    #[error("Key must be a UUIDv4 such as xxxxxxxx-xxxx-4xxx-xxxx-xxxxxxxxxxxx")]
    NotUuid,
}

/// Accepted plaintext shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    /// Any non-empty string within the length bound
    #[default]
    Any,
    /// Canonical hyphenated UUIDv4, compared case-insensitively
    Uuid,
}

/// Shape checks applied to every plaintext before it reaches the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPolicy {
    pub format: KeyFormat,
    pub max_length: usize,
}

impl KeyPolicy {
    pub fn new(format: KeyFormat, max_length: usize) -> Self {
        Self { format, max_length }
    }

    /// Validate and normalise a raw plaintext.
    pub fn parse(&self, raw: &str) -> Result<SecretKey, KeyFormatError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(KeyFormatError::Empty);
        }

        let len = trimmed.chars().count();
        if len > self.max_length {
            return Err(KeyFormatError::TooLong {
                len,
                max: self.max_length,
            });
        }

        match self.format {
            KeyFormat::Any => Ok(SecretKey(trimmed.to_string())),
            KeyFormat::Uuid => {
                // Only the hyphenated form is accepted, not simple/braced/urn
                if trimmed.len() != 36 {
                    return Err(KeyFormatError::NotUuid);
                }
                let uuid = Uuid::parse_str(trimmed).map_err(|_| KeyFormatError::NotUuid)?;
                if uuid.get_version_num() != 4 {
                    return Err(KeyFormatError::NotUuid);
                }
                Ok(SecretKey(uuid.hyphenated().to_string()))
            }
        }
    }
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self::new(KeyFormat::Any, 256)
    }
}

/// A validated plaintext key.
///
/// Only constructed through [`KeyPolicy::parse`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(String);

impl SecretKey {
    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// Random per-community key for the fingerprint hash
#[derive(Clone, PartialEq, Eq, Zeroize)]
pub struct Salt([u8; DIGEST_LEN]);

impl Salt {
    pub fn generate() -> Self {
        let mut bytes = [0u8; DIGEST_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, String> {
        let bytes = BASE64.decode(encoded).map_err(|e| e.to_string())?;
        let arr: [u8; DIGEST_LEN] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| format!("salt must be {} bytes, got {}", DIGEST_LEN, v.len()))?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Salt(<redacted>)")
    }
}

/// One-way digest of a plaintext key.
///
/// Equality is constant-time (it delegates to [`blake3::Hash`]).
#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyFingerprint([u8; DIGEST_LEN]);

impl KeyFingerprint {
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> Result<Self, String> {
        blake3::Hash::from_hex(hex)
            .map(|h| Self(*h.as_bytes()))
            .map_err(|e| e.to_string())
    }

    /// Short prefix safe to put in logs
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl PartialEq for KeyFingerprint {
    fn eq(&self, other: &Self) -> bool {
        blake3::Hash::from(self.0) == blake3::Hash::from(other.0)
    }
}

impl Eq for KeyFingerprint {}

impl Hash for KeyFingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Debug for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyFingerprint({}…)", self.short())
    }
}

impl TryFrom<String> for KeyFingerprint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<KeyFingerprint> for String {
    fn from(fp: KeyFingerprint) -> Self {
        fp.to_hex()
    }
}

/// Turns plaintext keys into fingerprints for one community
#[derive(Debug, Clone)]
pub struct SecretCodec {
    salt: Salt,
}

impl SecretCodec {
    pub fn new(salt: Salt) -> Self {
        Self { salt }
    }

    pub fn salt(&self) -> &Salt {
        &self.salt
    }

    pub fn fingerprint(&self, key: &SecretKey) -> KeyFingerprint {
        let hash = blake3::keyed_hash(&self.salt.0, key.as_bytes());
        KeyFingerprint(*hash.as_bytes())
    }

    #[cfg(test)]
    pub fn verify(&self, key: &SecretKey, fingerprint: &KeyFingerprint) -> bool {
        self.fingerprint(key) == *fingerprint
    }
}
