//! SHA-256 content digests.

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Errors raised when parsing a [`ContentHash`].
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("content hash must be 64 lowercase hex characters, got: '{0}'")]
    InvalidHex(String),
}

/// A SHA-256 digest rendered as 64 lowercase hexadecimal characters.
///
/// Construction either hashes bytes directly ([`ContentHash::digest`]) or validates an
/// externally supplied value ([`ContentHash::parse`]). Uppercase input is rejected rather
/// than normalised so that two hashes compare equal exactly when their strings do.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hashes `bytes` with SHA-256.
    pub fn digest(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_ref());
        let bytes: [u8; 32] = hasher.finalize().into();
        Self::from_bytes(&bytes)
    }

    /// Wraps a raw 32-byte digest.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Validates a hex digest supplied from outside the process.
    pub fn parse(input: &str) -> Result<Self, HashError> {
        let ok = input.len() == 64
            && input
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !ok {
            return Err(HashError::InvalidHex(input.to_owned()));
        }
        Ok(Self(input.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentHash::parse(s)
    }
}

impl serde::Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ContentHash::parse(&s).map_err(serde::de::Error::custom)
    }
}
