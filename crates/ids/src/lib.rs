//! Identifier types and sharded-path utilities.
//!
//! MedFlow addresses three kinds of things:
//!
//! - **Sessions**: one per patient encounter, keyed by a caller-supplied string
//!   ([`SessionId`]). Keys are validated against a conservative ASCII set so they can be used
//!   safely in URLs and log lines.
//! - **Cases**: clinical records handed to the EHR writer ([`CaseId`], `CASE-XXXXXXXX`).
//! - **Traces**: one per pipeline run ([`TraceId`], a UUID v4).
//!
//! ## Sharded directory layout
//!
//! Session and case keys are arbitrary strings, so the on-disk location is derived from the
//! SHA-256 of the key rather than the key itself:
//!
//! `parent_dir/<h[0..2]>/<h[2..4]>/<h>.json`
//!
//! This keeps directory fan-out bounded and makes path traversal through a key impossible.

mod service;

pub use service::{sharded_file, CaseId, SessionId, TraceId};

/// Error type for identifier operations.
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for identifier operations.
pub type IdResult<T> = Result<T, IdError>;
