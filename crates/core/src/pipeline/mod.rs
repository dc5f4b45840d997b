//! The multi-stage triage pipeline.
//!
//! Stages run in a fixed order: intake, rule scan, triage, latch, investigation, summary,
//! safety gate, memory commit and workflow. Generative stages are reached through a
//! [`Proposer`]; everything else is deterministic.

mod candidates;
mod decision;
mod orchestrator;
mod proposer;
mod remote;
mod response;
mod stage;

pub use candidates::{
    parse_candidate, Candidate, ClinicalSummary, ExtractedFacts, InvestigationProposal,
    SafetyJudgement, TriageProposal,
};
pub use decision::{SafetyReport, TriageDecision};
pub use orchestrator::{PipelineOrchestrator, StageFailure};
pub use proposer::{OfflineProposer, Proposer, ProposerError, Scripted, ScriptedProposer};
pub use remote::HttpProposer;
pub use response::{
    format_latency, ErrorBody, FollowUp, IntakeRequest, Notice, SessionView, TriageView,
    TurnMetadata, TurnResponse, WorkflowStatus,
};
pub use stage::{Stage, StageRequest};
