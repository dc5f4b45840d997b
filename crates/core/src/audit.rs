//! Per-run audit trail.
//!
//! Every pipeline run gets a [`TraceId`]. Steps and run-state changes are recorded in order
//! and also emitted as `tracing` events carrying the trace id, so log lines and the returned
//! trail can be correlated.

use crate::pipeline::Stage;
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use medflow_ids::TraceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// States of a single pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum RunState {
    Started,
    Extracted,
    RuleScanned,
    Merged,
    Latched,
    Investigated,
    Summarized,
    SafetyChecked,
    Sealed,
    Persisted,
    Blocked,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Persisted | RunState::Blocked | RunState::Failed)
    }

    /// Whether a run in `self` may move to `next`.
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Started, Extracted)
                | (Extracted, RuleScanned)
                | (RuleScanned, Merged)
                | (Merged, Latched)
                | (Latched, Investigated)
                | (Investigated, Summarized)
                | (Summarized, SafetyChecked)
                | (SafetyChecked, Sealed)
                | (Sealed, Persisted)
                | (Sealed, Blocked)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Started => "started",
            RunState::Extracted => "extracted",
            RunState::RuleScanned => "rule_scanned",
            RunState::Merged => "merged",
            RunState::Latched => "latched",
            RunState::Investigated => "investigated",
            RunState::Summarized => "summarized",
            RunState::SafetyChecked => "safety_checked",
            RunState::Sealed => "sealed",
            RunState::Persisted => "persisted",
            RunState::Blocked => "blocked",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TraceStep {
    pub stage: Stage,
    pub action: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AuditTrail {
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    pub trace_id: TraceId,
    pub steps: Vec<TraceStep>,
    pub states: Vec<RunState>,
    pub degraded_stages: Vec<Stage>,
    pub latency_ms: u64,
    #[serde(skip)]
    started: Option<Instant>,
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditTrail {
    pub fn new() -> Self {
        let trace_id = TraceId::new();
        tracing::info!(trace_id = %trace_id, state = %RunState::Started, "pipeline run started");
        Self {
            trace_id,
            steps: Vec::new(),
            states: vec![RunState::Started],
            degraded_stages: Vec::new(),
            latency_ms: 0,
            started: Some(Instant::now()),
        }
    }

    pub fn state(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Started)
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded_stages.is_empty()
    }

    pub fn record(&mut self, stage: Stage, action: impl Into<String>) {
        let action = action.into();
        tracing::info!(trace_id = %self.trace_id, stage = %stage, action = %action, "trace step");
        self.steps.push(TraceStep {
            stage,
            action,
            at: Utc::now(),
        });
    }

    /// Marks `stage` as having fallen back to its deterministic substitute.
    pub fn degrade(&mut self, stage: Stage, reason: &str) {
        tracing::warn!(trace_id = %self.trace_id, stage = %stage, reason = %reason, "stage degraded");
        if !self.degraded_stages.contains(&stage) {
            self.degraded_stages.push(stage);
        }
        self.steps.push(TraceStep {
            stage,
            action: format!("degraded: {reason}"),
            at: Utc::now(),
        });
    }

    /// Moves the run to `next`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::PipelineFailed` if the transition is not allowed from the current
    /// state.
    pub fn advance(&mut self, next: RunState) -> CoreResult<()> {
        let current = self.state();
        if !current.can_advance_to(next) {
            return Err(CoreError::PipelineFailed(format!(
                "invalid run transition {current} -> {next}"
            )));
        }
        tracing::debug!(trace_id = %self.trace_id, from = %current, to = %next, "run state");
        self.states.push(next);
        Ok(())
    }

    /// Stops the latency clock and returns the elapsed time in milliseconds.
    pub fn finish(&mut self) -> u64 {
        if let Some(started) = self.started.take() {
            self.latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        }
        tracing::info!(
            trace_id = %self.trace_id,
            state = %self.state(),
            latency_ms = self.latency_ms,
            degraded = self.is_degraded(),
            "pipeline run finished"
        );
        self.latency_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_persisted() {
        let mut trail = AuditTrail::new();
        for state in [
            RunState::Extracted,
            RunState::RuleScanned,
            RunState::Merged,
            RunState::Latched,
            RunState::Investigated,
            RunState::Summarized,
            RunState::SafetyChecked,
            RunState::Sealed,
            RunState::Persisted,
        ] {
            trail.advance(state).expect("allowed transition");
        }
        assert_eq!(trail.state(), RunState::Persisted);
        assert!(trail.advance(RunState::Failed).is_err());
    }

    #[test]
    fn skipping_states_is_rejected() {
        let mut trail = AuditTrail::new();
        assert!(trail.advance(RunState::Latched).is_err());
        assert!(trail.advance(RunState::Failed).is_ok());
    }

    #[test]
    fn degraded_stages_are_recorded_once() {
        let mut trail = AuditTrail::new();
        trail.degrade(Stage::Triage, "timeout");
        trail.degrade(Stage::Triage, "timeout");
        assert!(trail.is_degraded());
        assert_eq!(trail.degraded_stages, vec![Stage::Triage]);
        assert_eq!(trail.steps.len(), 2);
    }

    #[test]
    fn finish_freezes_latency() {
        let mut trail = AuditTrail::new();
        let first = trail.finish();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(trail.finish(), first);
    }
}
