//! Internal implementation of the identifier types.

use crate::{IdError, IdResult};
use medflow_types::ContentHash;
use std::path::{Path, PathBuf};
use std::{fmt, str::FromStr};
use uuid::Uuid;

const MAX_SESSION_ID_LEN: usize = 128;
const CASE_PREFIX: &str = "CASE-";

/// Encounter-scoped session key.
///
/// Session keys come from outside the process (REST body, CLI argument), so they are
/// validated on construction:
/// - not empty after trimming
/// - at most 128 characters
/// - ASCII alphanumerics plus `.`, `-`, `_` and `:` only
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Validates and wraps a session key.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::InvalidInput`] if the key is empty, too long, or contains
    /// characters outside the allowed set.
    pub fn parse(input: &str) -> IdResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(IdError::InvalidInput("session id cannot be empty".into()));
        }

        if trimmed.len() > MAX_SESSION_ID_LEN {
            return Err(IdError::InvalidInput(format!(
                "session id exceeds maximum length of {} characters",
                MAX_SESSION_ID_LEN
            )));
        }

        let ok = trimmed.bytes().all(|b| {
            matches!(b, b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'.' | b'-' | b'_' | b':')
        });
        if !ok {
            return Err(IdError::InvalidInput(format!(
                "session id contains invalid characters (only alphanumeric, '.', '-', '_', ':' allowed): '{}'",
                trimmed
            )));
        }

        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the sharded JSON file location for this session under `parent_dir`.
    pub fn sharded_file(&self, parent_dir: &Path) -> PathBuf {
        sharded_file(parent_dir, &self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionId::parse(s)
    }
}

/// Identifier assigned to a clinical record when it is written to the EHR.
///
/// Format: `CASE-` followed by 8 uppercase hex characters taken from a fresh UUID v4.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CaseId(String);

impl Default for CaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl CaseId {
    /// Allocates a new case identifier.
    pub fn new() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self(format!("{CASE_PREFIX}{}", simple[..8].to_uppercase()))
    }

    /// Validates an externally supplied case identifier.
    ///
    /// # Errors
    ///
    /// Returns [`IdError::InvalidInput`] unless the input is `CASE-` followed by exactly 8
    /// uppercase hex characters.
    pub fn parse(input: &str) -> IdResult<Self> {
        let suffix = input.strip_prefix(CASE_PREFIX).ok_or_else(|| {
            IdError::InvalidInput(format!("case id must start with '{CASE_PREFIX}': '{input}'"))
        })?;

        let ok = suffix.len() == 8
            && suffix
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'A'..=b'F'));
        if !ok {
            return Err(IdError::InvalidInput(format!(
                "case id must end with 8 uppercase hex characters: '{input}'"
            )));
        }

        Ok(Self(input.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn sharded_file(&self, parent_dir: &Path) -> PathBuf {
        sharded_file(parent_dir, &self.0)
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CaseId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CaseId::parse(s)
    }
}

/// Correlation identifier for a single pipeline run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TraceId(Uuid);

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Returns `parent_dir/<h[0..2]>/<h[2..4]>/<h>.json` where `h` is the SHA-256 of `key`.
pub fn sharded_file(parent_dir: &Path, key: &str) -> PathBuf {
    let digest = ContentHash::digest(key.as_bytes());
    let h = digest.as_str();
    parent_dir
        .join(&h[0..2])
        .join(&h[2..4])
        .join(format!("{h}.json"))
}

#[cfg(feature = "serde")]
mod serde_impls {
    use super::{CaseId, SessionId, TraceId};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    impl Serialize for SessionId {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(self.as_str())
        }
    }

    impl<'de> Deserialize<'de> for SessionId {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let s = String::deserialize(deserializer)?;
            SessionId::parse(&s).map_err(serde::de::Error::custom)
        }
    }

    impl Serialize for CaseId {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(self.as_str())
        }
    }

    impl<'de> Deserialize<'de> for CaseId {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let s = String::deserialize(deserializer)?;
            CaseId::parse(&s).map_err(serde::de::Error::custom)
        }
    }

    impl Serialize for TraceId {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_str(self)
        }
    }

    impl<'de> Deserialize<'de> for TraceId {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let s = String::deserialize(deserializer)?;
            uuid::Uuid::parse_str(&s)
                .map(TraceId)
                .map_err(serde::de::Error::custom)
        }
    }
}
