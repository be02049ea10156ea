use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Opaque cache key derived from a request
///
/// The cache only hashes and compares fingerprints; it never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// SHA-256 over the operation name and the whitespace-normalised request
    /// text, hex encoded. Requests differing only in spacing share a key.
    pub fn of(operation: &str, request: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        hasher.update([0u8]);
        for (i, word) in request.split_whitespace().enumerate() {
            if i > 0 {
                hasher.update(b" ");
            }
            hasher.update(word.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap a key computed elsewhere
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(key: &str) -> Self {
        Self::from_raw(key)
    }
}

impl From<String> for Fingerprint {
    fn from(key: String) -> Self {
        Self(key)
    }
}
