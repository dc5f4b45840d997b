//! # MedFlow Core
//!
//! Core clinical logic for the MedFlow triage pipeline.
//!
//! This crate contains the deterministic safety machinery and the stage sequencing:
//! - Red-flag rule engine over free text and extracted facts
//! - Triage latch: per-session risk level that can only rise, with versioned CAS commits
//! - Pipeline orchestrator with per-stage timeouts, bounded retries and degraded fallbacks
//! - Safety gate (rule re-scan plus external judge, upgrade only)
//! - Integrity gate: content hashing at consent and verification before EHR writes
//! - Audit trail with a trace id per run
//!
//! **No API concerns**: HTTP servers and CLI parsing belong in `api-rest` and `cli`.
//! Generative stages are reached through the [`pipeline::Proposer`] trait; this crate never
//! talks to a model directly.

pub mod audit;
pub mod config;
pub mod constants;
pub mod ehr;
mod error;
pub mod integrity;
pub mod latch;
pub mod level;
pub mod pipeline;
pub mod rules;
pub mod session_store;

pub use audit::{AuditTrail, RunState, TraceStep};
pub use config::{parse_config_yaml, ConfigFile, CoreConfig, PipelineSettings};
pub use ehr::{EhrWriteResult, EhrWriter, FileEhrStore, InMemoryEhrStore, StoredCase, WriteStatus};
pub use error::{CoreError, CoreResult, ErrorCode, LatchError};
pub use integrity::{
    BlockReason, ClinicalContent, ClinicalRecord, IntegrityGate, SealedRecord, Verdict,
};
pub use latch::{Session, TimelineEntry, TriageLatch};
pub use level::TriageLevel;
pub use rules::{CategoryRule, RedFlag, RuleEngine, RuleTable, ScanReport};
pub use session_store::{FileSessionStore, InMemorySessionStore, SessionStore};

pub use medflow_ids::{CaseId, SessionId, TraceId};
pub use medflow_types::{ContentHash, NonEmptyText};
