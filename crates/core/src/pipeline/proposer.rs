use super::{Stage, StageRequest};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProposerError {
    /// No generative capability is configured for the stage.
    #[error("no proposer available for stage {0}")]
    Unavailable(Stage),
    #[error("proposer transport error: {0}")]
    Transport(String),
    #[error("proposer returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
}

impl ProposerError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProposerError::Unavailable(_) => false,
            ProposerError::Transport(_) | ProposerError::InvalidCandidate(_) => true,
            ProposerError::Status { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

/// Source of candidates for generative stages.
///
/// Implementations return raw JSON; the orchestrator owns parsing, validation, timeouts and
/// retries, so a proposer only needs to make one attempt per call.
#[async_trait]
pub trait Proposer: Send + Sync {
    async fn propose(&self, request: &StageRequest) -> Result<serde_json::Value, ProposerError>;
}

/// Proposer used when no generative service is configured.
///
/// Every stage reports [`ProposerError::Unavailable`], so runs go straight to the
/// deterministic fallbacks without waiting on retries.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineProposer;

#[async_trait]
impl Proposer for OfflineProposer {
    async fn propose(&self, request: &StageRequest) -> Result<serde_json::Value, ProposerError> {
        Err(ProposerError::Unavailable(request.stage))
    }
}

/// One scripted answer of a [`ScriptedProposer`].
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(serde_json::Value),
    Fail(String),
    /// Sleeps before replying; combined with a stage timeout this simulates a hung service.
    Delay(Duration, serde_json::Value),
}

/// Proposer that replays canned answers per stage, in order.
///
/// Once a stage's script is used up, the stage is reported unavailable. Every call is
/// recorded so tests can assert on attempts.
#[derive(Debug, Default)]
pub struct ScriptedProposer {
    scripts: Mutex<HashMap<Stage, VecDeque<Scripted>>>,
    calls: Mutex<Vec<Stage>>,
}

impl ScriptedProposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `answer` for `stage`.
    pub fn push(&self, stage: Stage, answer: Scripted) -> &Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(stage).or_default().push_back(answer);
        }
        self
    }

    pub fn reply(&self, stage: Stage, value: serde_json::Value) -> &Self {
        self.push(stage, Scripted::Reply(value))
    }

    /// Number of calls made for `stage`.
    pub fn calls(&self, stage: Stage) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.iter().filter(|s| **s == stage).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Proposer for ScriptedProposer {
    async fn propose(&self, request: &StageRequest) -> Result<serde_json::Value, ProposerError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.stage);
        }
        let next = self
            .scripts
            .lock()
            .map_err(|_| ProposerError::Transport("script lock poisoned".into()))?
            .get_mut(&request.stage)
            .and_then(VecDeque::pop_front);

        match next {
            Some(Scripted::Reply(value)) => Ok(value),
            Some(Scripted::Fail(message)) => Err(ProposerError::Transport(message)),
            Some(Scripted::Delay(delay, value)) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            None => Err(ProposerError::Unavailable(request.stage)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_proposer_is_unavailable_for_every_stage() {
        for stage in Stage::ALL.into_iter().filter(|s| s.is_generative()) {
            let request = StageRequest {
                stage,
                input: serde_json::Value::Null,
                context: serde_json::Value::Null,
            };
            let err = OfflineProposer
                .propose(&request)
                .await
                .expect_err("offline proposer never answers");
            assert!(matches!(err, ProposerError::Unavailable(s) if s == stage));
            assert!(!err.is_retryable());
        }
    }

    #[tokio::test]
    async fn scripted_proposer_replays_in_order_then_runs_dry() {
        let proposer = ScriptedProposer::new();
        proposer
            .reply(Stage::Triage, serde_json::json!({"n": 1}))
            .push(Stage::Triage, Scripted::Fail("boom".into()));
        let request = StageRequest {
            stage: Stage::Triage,
            input: serde_json::Value::Null,
            context: serde_json::Value::Null,
        };

        let first = proposer.propose(&request).await.expect("first reply");
        assert_eq!(first["n"], 1);
        assert!(matches!(
            proposer.propose(&request).await,
            Err(ProposerError::Transport(_))
        ));
        assert!(matches!(
            proposer.propose(&request).await,
            Err(ProposerError::Unavailable(Stage::Triage))
        ));
        assert_eq!(proposer.calls(Stage::Triage), 3);
        assert_eq!(proposer.calls(Stage::Intake), 0);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let bad_request = ProposerError::Status {
            status: 400,
            body: "bad".into(),
        };
        assert!(!bad_request.is_retryable());
        let overloaded = ProposerError::Status {
            status: 503,
            body: "busy".into(),
        };
        assert!(overloaded.is_retryable());
    }
}
