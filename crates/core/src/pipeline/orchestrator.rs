//! Sequencing of one patient turn.
//!
//! Generative stages are advisory. Their output passes through strict parsing, the rule
//! engine, the triage latch and the safety gate before it can reach the patient or the EHR,
//! and each of those layers can only raise the level.
//!
//! Ordering of side effects within a run:
//! 1. the session snapshot is read (or created) once, at the start
//! 2. every stage works on that snapshot; nothing is written while stages run
//! 3. the latch commit (CAS on the session) happens after the safety gate
//! 4. the EHR write, if consented, happens last
//!
//! A run cancelled before step 3 leaves the store untouched.

use super::{
    parse_candidate, Candidate, ClinicalSummary, ExtractedFacts, FollowUp, InvestigationProposal,
    IntakeRequest, Notice, Proposer, ProposerError, SafetyJudgement, SafetyReport, Stage,
    StageRequest, TriageDecision, TriageProposal, TriageView, TurnMetadata, TurnResponse,
    WorkflowStatus,
};
use crate::audit::{AuditTrail, RunState};
use crate::constants::{EMERGENCY_ADVICE, ROUTINE_ADVICE, TIMELINE_SUMMARY_CHARS, URGENT_ADVICE};
use crate::ehr::{EhrWriteResult, EhrWriter};
use crate::integrity::{ClinicalContent, ClinicalRecord, IntegrityGate};
use crate::latch::{Session, TimelineEntry, TriageLatch};
use crate::rules::{max_severity, normalize_text, RedFlag, RuleEngine};
use crate::session_store::SessionStore;
use crate::{CoreConfig, CoreError, CoreResult, ErrorCode, LatchError, TriageLevel};
use chrono::Utc;
use medflow_ids::{CaseId, SessionId};
use medflow_types::NonEmptyText;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Why a generative stage produced no usable candidate.
#[derive(Debug, thiserror::Error)]
pub enum StageFailure {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Proposer(#[from] ProposerError),
    #[error("candidate rejected: {0}")]
    Rejected(String),
}

impl StageFailure {
    fn is_retryable(&self) -> bool {
        match self {
            StageFailure::TimedOut(_) | StageFailure::Rejected(_) => true,
            StageFailure::Proposer(e) => e.is_retryable(),
        }
    }
}

/// Everything a finished run produces apart from the audit trail.
struct TurnDraft {
    triage: TriageView,
    follow_up: FollowUp,
    patient_id: String,
    session_id: String,
    latch_version: u64,
    clinical_summary: ClinicalSummary,
    red_flags: Vec<RedFlag>,
    workflow_status: WorkflowStatus,
    ehr: Option<EhrWriteResult>,
    notices: Vec<Notice>,
}

pub struct PipelineOrchestrator {
    config: Arc<CoreConfig>,
    rules: RuleEngine,
    latch: TriageLatch,
    proposer: Arc<dyn Proposer>,
    ehr: Arc<dyn EhrWriter>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: Arc<CoreConfig>,
        store: Arc<dyn SessionStore>,
        proposer: Arc<dyn Proposer>,
        ehr: Arc<dyn EhrWriter>,
    ) -> CoreResult<Self> {
        let rules = config.rule_engine()?;
        Ok(Self {
            config,
            rules,
            latch: TriageLatch::new(store),
            proposer,
            ehr,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    pub fn latch(&self) -> &TriageLatch {
        &self.latch
    }

    /// Runs one patient turn end to end.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for malformed ids or a blank message
    /// - `SessionClosed` if the session has been closed
    /// - `ConcurrentModification` if the latch commit keeps losing races beyond the retry budget
    /// - `PipelineFailed` if triage failed with nothing for the rules to work on and no level
    ///   latched earlier in the session, or the session store is unavailable
    ///
    /// Degraded stages do not fail the run; they are reported as a `PipelineDegraded` notice.
    pub async fn run(&self, request: IntakeRequest) -> CoreResult<TurnResponse> {
        let mut audit = AuditTrail::new();
        let draft = match self.execute(&request, &mut audit).await {
            Ok(draft) => draft,
            Err(err) => {
                if !audit.state().is_terminal() {
                    audit.advance(RunState::Failed)?;
                }
                audit.finish();
                tracing::error!(
                    trace_id = %audit.trace_id,
                    code = %err.code(),
                    error = %err,
                    "pipeline run failed"
                );
                return Err(err);
            }
        };

        let mut notices = draft.notices;
        if audit.is_degraded() {
            let stages: Vec<&str> = audit.degraded_stages.iter().map(|s| s.as_str()).collect();
            notices.insert(
                0,
                Notice {
                    code: ErrorCode::PipelineDegraded,
                    message: format!("fallbacks used for: {}", stages.join(", ")),
                },
            );
        }

        let latency_ms = audit.finish();
        Ok(TurnResponse {
            triage: draft.triage,
            follow_up: draft.follow_up,
            metadata: TurnMetadata {
                patient_id: draft.patient_id,
                latency: super::format_latency(latency_ms),
                trace_id: audit.trace_id.to_string(),
                session_id: draft.session_id,
                latch_version: draft.latch_version,
                degraded: audit.is_degraded(),
            },
            clinical_summary: draft.clinical_summary,
            red_flags: draft.red_flags,
            workflow_status: draft.workflow_status,
            ehr: draft.ehr,
            notices,
            audit,
        })
    }

    async fn execute(
        &self,
        request: &IntakeRequest,
        audit: &mut AuditTrail,
    ) -> CoreResult<TurnDraft> {
        let session_id = SessionId::parse(&request.session_id)?;
        let patient_id = NonEmptyText::new(&request.patient_id)
            .map_err(|_| CoreError::InvalidInput("patient_id cannot be empty".into()))?;
        let message = request.message.trim().to_owned();
        if message.is_empty() {
            return Err(CoreError::InvalidInput("message cannot be empty".into()));
        }

        let session = self.latch.open(&session_id, &patient_id)?;
        if session.is_closed() {
            return Err(LatchError::SessionClosed(session_id.to_string()).into());
        }

        let context = json!({
            "session_id": session_id.as_str(),
            "patient_id": patient_id.as_str(),
            "trace_id": audit.trace_id.to_string(),
            "previous_level": session.current_level(),
            "latch_version": session.latch_version(),
        });
        let input_summary = truncate_chars(&message, TIMELINE_SUMMARY_CHARS);
        let mut entries = Vec::new();

        // Intake: extraction.
        let facts = match self
            .invoke::<ExtractedFacts, _>(
                Stage::Intake,
                json!({ "message": message }),
                &context,
                audit,
                |_| Ok(()),
            )
            .await
        {
            Ok(facts) => facts,
            Err(failure) => {
                audit.degrade(Stage::Intake, &failure.to_string());
                ExtractedFacts::default()
            }
        };
        audit.advance(RunState::Extracted)?;
        entries.push(TimelineEntry::new(
            Stage::Intake.as_str(),
            input_summary.as_str(),
            format!("{} symptoms extracted", facts.symptoms.len()),
        ));

        // Deterministic red-flag scan.
        let mut flags = self.rules.evaluate(&message);
        flags.extend(self.rules.evaluate_facts(&facts));
        let flag_level = max_severity(&flags);
        audit.record(
            Stage::Triage,
            format!(
                "rule scan: {} flags, level {}",
                flags.len(),
                flag_level.map_or("none", TriageLevel::as_str)
            ),
        );
        audit.advance(RunState::RuleScanned)?;

        // Triage proposal merged with the rules.
        let proposal = self
            .invoke::<TriageProposal, _>(
                Stage::Triage,
                json!({
                    "message": message,
                    "facts": facts,
                    "red_flags": flags,
                    "rule_level": flag_level,
                }),
                &context,
                audit,
                |_| Ok(()),
            )
            .await;

        let primary_term = self
            .rules
            .primary_flag(&flags)
            .map(|f| f.matched_term.clone());
        let (merged, mut reasoning, confidence_score, ai_level, ai_action) = match proposal {
            Ok(p) => {
                let merged = flag_level.map_or(p.level, |level| level.max(p.level));
                let mut reasoning = p.reasoning;
                if merged > p.level {
                    reasoning.push_str(&format!(
                        " Escalated to {merged} by red flag: {}.",
                        primary_term.as_deref().unwrap_or("rule match")
                    ));
                }
                (merged, reasoning, p.confidence_score, Some(p.level), p.action)
            }
            Err(failure) => {
                audit.degrade(Stage::Triage, &failure.to_string());
                // A session that already holds a level can still degrade to it.
                if normalize_text(&message).is_empty()
                    && facts.is_empty()
                    && session.latch_version() == 0
                {
                    return Err(CoreError::PipelineFailed(
                        "triage stage failed with no usable input and no prior level".into(),
                    ));
                }
                let (level, reasoning) = match (flag_level, &primary_term) {
                    (Some(level), Some(term)) => (
                        level.max(TriageLevel::Urgent),
                        format!("Automated triage unavailable. Red flag detected: {term}."),
                    ),
                    _ => (
                        TriageLevel::Routine,
                        "Automated triage unavailable. No red flags detected.".to_owned(),
                    ),
                };
                (level, reasoning, 0.0, None, None)
            }
        };
        audit.advance(RunState::Merged)?;

        // Latch against the snapshot. The durable commit comes after the safety gate.
        let latched = session.latched_level(merged)?;
        if latched > merged {
            reasoning.push_str(&format!(
                " Level held at {latched} from earlier in this session."
            ));
        }
        audit.record(
            Stage::Memory,
            format!("latched {latched} (session at {})", session.current_level()),
        );
        audit.advance(RunState::Latched)?;
        entries.push(TimelineEntry::new(
            Stage::Triage.as_str(),
            input_summary.as_str(),
            format!("proposed {merged}, latched {latched}"),
        ));

        // Investigation, with the mandate enforced on the candidate.
        let investigation = self
            .invoke::<InvestigationProposal, _>(
                Stage::Investigation,
                json!({ "message": message, "facts": facts, "level": latched }),
                &context,
                audit,
                |p: &InvestigationProposal| {
                    if latched.requires_investigation() && p.questions_to_ask.is_empty() {
                        Err(format!("no follow-up questions for a {latched} decision"))
                    } else {
                        Ok(())
                    }
                },
            )
            .await;
        let (mut questions, investigation_advice) = match investigation {
            Ok(p) => (p.questions_to_ask, p.safety_net_advice),
            Err(failure) => {
                audit.degrade(Stage::Investigation, &failure.to_string());
                (Vec::new(), None)
            }
        };
        if latched.requires_investigation() && questions.is_empty() {
            questions = self.config.pipeline().safety_net_questions();
        }
        audit.advance(RunState::Investigated)?;

        // Summary.
        let mut summary = match self
            .invoke::<ClinicalSummary, _>(
                Stage::Summary,
                json!({
                    "message": message,
                    "facts": facts,
                    "level": latched,
                    "red_flags": flags,
                    "questions": questions,
                }),
                &context,
                audit,
                |_| Ok(()),
            )
            .await
        {
            Ok(summary) => summary,
            Err(failure) => {
                audit.degrade(Stage::Summary, &failure.to_string());
                fallback_summary(&message, &facts, &flags, latched)
            }
        };
        audit.advance(RunState::Summarized)?;

        // Safety gate: rule re-scan plus the external judge. Upgrade only.
        let judgement = match self
            .invoke::<SafetyJudgement, _>(
                Stage::Evaluation,
                json!({
                    "message": message,
                    "facts": facts,
                    "level": latched,
                    "summary": summary,
                    "questions": questions,
                }),
                &context,
                audit,
                |_| Ok(()),
            )
            .await
        {
            Ok(judgement) => Some(judgement),
            Err(failure) => {
                audit.degrade(Stage::Evaluation, &failure.to_string());
                None
            }
        };

        let mut rescan = self
            .rules
            .evaluate_all(std::iter::once(message.as_str()).chain(summary.scan_texts()));
        rescan.extend(self.rules.evaluate_facts(&facts));
        let mut safety =
            SafetyReport::assess(&facts, latched, rescan.iter().cloned().collect(), judgement);
        audit.record(
            Stage::Evaluation,
            format!(
                "safety audit score {} ({})",
                safety.final_safety_score,
                if safety.safety_pass { "pass" } else { "fail" }
            ),
        );
        let mut final_level = latched;
        if let Some(floor) = safety.floor().filter(|floor| *floor > latched) {
            final_level = session.latched_level(floor)?;
            safety.upgraded_from = Some(latched);
            safety.safety_pass = false;
            reasoning.push_str(&format!(
                " Safety review raised the level from {latched} to {final_level}."
            ));
            audit.record(
                Stage::Evaluation,
                format!("safety gate upgraded {latched} -> {final_level}"),
            );
        } else {
            audit.record(Stage::Evaluation, "safety gate passed");
        }
        flags.extend(rescan);
        audit.advance(RunState::SafetyChecked)?;
        entries.push(TimelineEntry::new(
            Stage::Evaluation.as_str(),
            input_summary.as_str(),
            format!("final level {final_level}"),
        ));

        // Memory: durable latch commit.
        let committed = self.commit_latch(&session, final_level, entries, audit)?;
        if committed.current_level() > final_level {
            reasoning.push_str(&format!(
                " Session level raised to {} by a concurrent update.",
                committed.current_level()
            ));
            final_level = committed.current_level();
        }
        if final_level.requires_investigation() && questions.is_empty() {
            questions = self.config.pipeline().safety_net_questions();
        }
        summary.risk_level = final_level;

        let safety_net_advice = match (ai_level, ai_action, investigation_advice) {
            (Some(level), Some(action), _) if level == final_level => action,
            (_, _, Some(advice)) if latched == final_level => advice,
            _ => default_advice(final_level).to_owned(),
        };

        let decision = TriageDecision {
            level: final_level,
            reasoning,
            confidence_score,
            questions: questions.clone(),
            flags: flags.into_iter().collect(),
            degraded: audit.is_degraded(),
        };

        // Workflow: seal, verify and write when consented.
        let mut notices = Vec::new();
        let (workflow_status, ehr) = if request.consent {
            let now = Utc::now();
            let record = ClinicalRecord {
                case_id: CaseId::new(),
                session_id: session_id.clone(),
                patient_id: patient_id.clone(),
                content: ClinicalContent {
                    extraction: facts,
                    decision: decision.clone(),
                    summary: summary.clone(),
                    safety,
                },
                modified_at: now,
                degraded: audit.is_degraded(),
            };
            let sealed = IntegrityGate::capture_consent(record, now)?;
            audit.record(
                Stage::Workflow,
                format!(
                    "sealed {} with hash {}",
                    sealed.record.case_id, sealed.content_hash
                ),
            );
            audit.advance(RunState::Sealed)?;

            match IntegrityGate::commit(&sealed, self.ehr.as_ref()) {
                Ok(result) => {
                    audit.record(Stage::Workflow, format!("saved {}", result.case_id));
                    audit.advance(RunState::Persisted)?;
                    (WorkflowStatus::Saved, Some(result))
                }
                Err(CoreError::IntegrityBlocked(reason)) => {
                    audit.record(Stage::Workflow, format!("blocked: {reason}"));
                    audit.advance(RunState::Blocked)?;
                    notices.push(Notice {
                        code: ErrorCode::IntegrityBlocked,
                        message: reason.to_string(),
                    });
                    (WorkflowStatus::Blocked, None)
                }
                Err(err) => {
                    tracing::error!(
                        trace_id = %audit.trace_id,
                        case_id = %sealed.record.case_id,
                        error = %err,
                        "EHR write failed"
                    );
                    audit.record(Stage::Workflow, format!("EHR write failed: {err}"));
                    audit.advance(RunState::Failed)?;
                    notices.push(Notice {
                        code: ErrorCode::PipelineFailed,
                        message: format!("decision recorded but EHR write failed: {err}"),
                    });
                    (
                        WorkflowStatus::Failed,
                        Some(EhrWriteResult::failed(&sealed, err.to_string())),
                    )
                }
            }
        } else {
            audit.record(Stage::Workflow, "no consent; decision logged without EHR write");
            (WorkflowStatus::Logged, None)
        };

        Ok(TurnDraft {
            triage: TriageView {
                level: decision.level,
                reasoning: decision.reasoning,
                questions: decision.questions,
                confidence_score: decision.confidence_score,
            },
            follow_up: FollowUp {
                safety_net_advice,
                questions_to_ask: questions,
            },
            patient_id: patient_id.into_inner(),
            session_id: session_id.to_string(),
            latch_version: committed.latch_version(),
            clinical_summary: summary,
            red_flags: decision.flags,
            workflow_status,
            ehr,
            notices,
        })
    }

    /// Calls a generative stage with per-attempt timeout, validation and bounded retries.
    ///
    /// Non-retryable failures (for example an unavailable stage) stop immediately.
    async fn invoke<T, F>(
        &self,
        stage: Stage,
        input: Value,
        context: &Value,
        audit: &mut AuditTrail,
        check: F,
    ) -> Result<T, StageFailure>
    where
        T: Candidate,
        F: Fn(&T) -> Result<(), String>,
    {
        let settings = self.config.pipeline();
        let timeout = settings.timeout_for(stage);
        let request = StageRequest {
            stage,
            input,
            context: context.clone(),
        };

        let mut retry = 0;
        loop {
            let outcome = match tokio::time::timeout(timeout, self.proposer.propose(&request)).await
            {
                Err(_) => Err(StageFailure::TimedOut(timeout)),
                Ok(Err(e)) => Err(StageFailure::Proposer(e)),
                Ok(Ok(value)) => parse_candidate::<T>(value)
                    .map_err(StageFailure::Proposer)
                    .and_then(|candidate| {
                        check(&candidate)
                            .map(|()| candidate)
                            .map_err(StageFailure::Rejected)
                    }),
            };

            match outcome {
                Ok(candidate) => {
                    audit.record(stage, format!("candidate accepted on attempt {}", retry + 1));
                    return Ok(candidate);
                }
                Err(failure) => {
                    tracing::warn!(
                        trace_id = %audit.trace_id,
                        stage = %stage,
                        attempt = retry + 1,
                        error = %failure,
                        "stage attempt failed"
                    );
                    if !failure.is_retryable() || retry >= settings.retry_budget {
                        return Err(failure);
                    }
                    retry += 1;
                    tokio::time::sleep(settings.backoff_for(retry)).await;
                }
            }
        }
    }

    /// Commits `level` to the session, re-reading on lost races within the retry budget.
    ///
    /// Re-applying after a re-read is safe because the new level is `max(stored, level)`.
    fn commit_latch(
        &self,
        snapshot: &Session,
        level: TriageLevel,
        entries: Vec<TimelineEntry>,
        audit: &mut AuditTrail,
    ) -> CoreResult<Session> {
        let session_id = snapshot.session_id();
        let mut expected = snapshot.latch_version();
        let mut retry = 0;
        loop {
            match self
                .latch
                .apply(session_id, expected, level, entries.clone())
            {
                Ok(committed) => {
                    audit.record(
                        Stage::Memory,
                        format!(
                            "latch committed {} at version {}",
                            committed.current_level(),
                            committed.latch_version()
                        ),
                    );
                    return Ok(committed);
                }
                Err(CoreError::Latch(LatchError::ConcurrentModification { actual, .. }))
                    if retry < self.config.pipeline().retry_budget =>
                {
                    retry += 1;
                    tracing::warn!(
                        trace_id = %audit.trace_id,
                        session_id = %session_id,
                        expected,
                        actual = ?actual,
                        retry,
                        "session changed during run, re-reading"
                    );
                    expected = self.latch.get(session_id)?.latch_version();
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn default_advice(level: TriageLevel) -> &'static str {
    match level {
        TriageLevel::Emergency => EMERGENCY_ADVICE,
        TriageLevel::Urgent => URGENT_ADVICE,
        TriageLevel::Routine => ROUTINE_ADVICE,
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_owned();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("...");
    out
}

/// Summary built from intake data when the summary stage is unavailable.
fn fallback_summary(
    message: &str,
    facts: &ExtractedFacts,
    flags: &BTreeSet<RedFlag>,
    level: TriageLevel,
) -> ClinicalSummary {
    let chief_complaint = facts
        .symptoms
        .first()
        .cloned()
        .unwrap_or_else(|| truncate_chars(message, 80));
    let history = facts
        .brief_summary
        .clone()
        .unwrap_or_else(|| truncate_chars(message, 400));

    ClinicalSummary {
        chief_complaint,
        history,
        red_flags_identified: flags.iter().map(|f| f.matched_term.clone()).collect(),
        risk_level: level,
        recommended_action: default_advice(level).to_owned(),
        clinician_note: "Automated summary unavailable; generated from intake data.".to_owned(),
    }
}
