use crate::integrity::BlockReason;
use medflow_ids::IdError;
use medflow_types::{HashError, TextError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failures raised by the triage latch and the session stores behind it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LatchError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session {0} is closed")]
    SessionClosed(String),
    #[error(
        "concurrent modification of session {session_id}: expected version {expected:?}, found {actual:?}"
    )]
    ConcurrentModification {
        session_id: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Latch(#[from] LatchError),
    #[error("integrity gate blocked the write: {0}")]
    IntegrityBlocked(BlockReason),
    #[error("pipeline failed: {0}")]
    PipelineFailed(String),
    #[error("EHR write failed: {0}")]
    EhrWrite(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to read file: {0}")]
    FileRead(std::io::Error),
    #[error("failed to write file: {0}")]
    FileWrite(std::io::Error),
    #[error("failed to serialize: {0}")]
    Serialization(serde_json::Error),
    #[error("failed to deserialize: {0}")]
    Deserialization(serde_json::Error),
    #[error("failed to deserialize YAML: {0}")]
    YamlDeserialization(String),

    #[error(transparent)]
    Id(#[from] IdError),
    #[error(transparent)]
    Text(#[from] TextError),
    #[error(transparent)]
    Hash(#[from] HashError),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Stable error codes carried in error bodies and response notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum ErrorCode {
    ConcurrentModification,
    SessionClosed,
    IntegrityBlocked,
    PipelineDegraded,
    PipelineFailed,
    InvalidInput,
    NotFound,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ConcurrentModification => "ConcurrentModification",
            ErrorCode::SessionClosed => "SessionClosed",
            ErrorCode::IntegrityBlocked => "IntegrityBlocked",
            ErrorCode::PipelineDegraded => "PipelineDegraded",
            ErrorCode::PipelineFailed => "PipelineFailed",
            ErrorCode::InvalidInput => "InvalidInput",
            ErrorCode::NotFound => "NotFound",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LatchError::NotFound(_) => ErrorCode::NotFound,
            LatchError::SessionClosed(_) => ErrorCode::SessionClosed,
            LatchError::ConcurrentModification { .. } => ErrorCode::ConcurrentModification,
            LatchError::StoreUnavailable(_) => ErrorCode::PipelineFailed,
        }
    }
}

impl CoreError {
    /// Maps the error onto the code exposed to callers.
    ///
    /// Storage and serialization faults surface as `PipelineFailed`: the request cannot be
    /// finalized and the caller has nothing to correct.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::InvalidInput(_)
            | CoreError::Id(_)
            | CoreError::Text(_)
            | CoreError::Hash(_)
            | CoreError::Config(_)
            | CoreError::YamlDeserialization(_) => ErrorCode::InvalidInput,
            CoreError::Latch(err) => err.code(),
            CoreError::IntegrityBlocked(_) => ErrorCode::IntegrityBlocked,
            CoreError::PipelineFailed(_)
            | CoreError::EhrWrite(_)
            | CoreError::FileRead(_)
            | CoreError::FileWrite(_)
            | CoreError::Serialization(_)
            | CoreError::Deserialization(_) => ErrorCode::PipelineFailed,
        }
    }

    /// True for errors a caller can resolve by re-reading state and retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::Latch(LatchError::ConcurrentModification { .. })
                | CoreError::Latch(LatchError::SessionClosed(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_errors_keep_their_codes_through_core_error() {
        let err: CoreError = LatchError::ConcurrentModification {
            session_id: "enc-1".into(),
            expected: Some(1),
            actual: Some(2),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::ConcurrentModification);
        assert!(err.is_recoverable());

        let err: CoreError = LatchError::StoreUnavailable("disk full".into()).into();
        assert_eq!(err.code(), ErrorCode::PipelineFailed);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn error_code_serializes_as_variant_name() {
        let json = serde_json::to_string(&ErrorCode::IntegrityBlocked).expect("serialize");
        assert_eq!(json, "\"IntegrityBlocked\"");
        assert_eq!(ErrorCode::PipelineDegraded.to_string(), "PipelineDegraded");
    }
}
