use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stages, in the order a run visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum Stage {
    Intake,
    Investigation,
    Triage,
    Summary,
    Evaluation,
    Workflow,
    Memory,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Intake,
        Stage::Investigation,
        Stage::Triage,
        Stage::Summary,
        Stage::Evaluation,
        Stage::Workflow,
        Stage::Memory,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Investigation => "investigation",
            Stage::Triage => "triage",
            Stage::Summary => "summary",
            Stage::Evaluation => "evaluation",
            Stage::Workflow => "workflow",
            Stage::Memory => "memory",
        }
    }

    /// Generative stages are served by a [`Proposer`](super::Proposer); their output is
    /// advisory and always validated before use.
    pub fn is_generative(self) -> bool {
        !matches!(self, Stage::Workflow | Stage::Memory)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload handed to a proposer for one generative stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRequest {
    pub stage: Stage,
    pub input: serde_json::Value,
    pub context: serde_json::Value,
}
