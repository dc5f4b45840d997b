use super::{ExtractedFacts, SafetyJudgement};
use crate::constants::{AUDIT_CRITICAL_SYMPTOMS, SAFETY_PASS_SCORE};
use crate::rules::{contains_phrase, normalize_text};
use crate::{RedFlag, TriageLevel};
use serde::{Deserialize, Serialize};

/// The triage outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TriageDecision {
    pub level: TriageLevel,
    pub reasoning: String,
    pub confidence_score: f64,
    pub questions: Vec<String>,
    pub flags: Vec<RedFlag>,
    pub degraded: bool,
}

/// What the safety gate saw and did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SafetyReport {
    pub rescan_flags: Vec<RedFlag>,
    pub judgement: Option<SafetyJudgement>,
    /// Notes from the deterministic half of the audit.
    #[serde(default)]
    pub rule_audit: Vec<String>,
    /// Rule score plus weighted judge scores.
    #[serde(default)]
    pub final_safety_score: f64,
    /// Level before the gate when the gate raised it.
    pub upgraded_from: Option<TriageLevel>,
    pub safety_pass: bool,
}

impl SafetyReport {
    /// Scores a run proposed at `level`.
    ///
    /// The score is the rule audit plus `3 x clinical_accuracy + 2 x summary_clarity` from the
    /// judge. A run passes when the score exceeds [`SAFETY_PASS_SCORE`] and the judge reported
    /// no dangerous omissions; with no judgement the judge scores count as zero.
    pub fn assess(
        facts: &ExtractedFacts,
        level: TriageLevel,
        rescan_flags: Vec<RedFlag>,
        judgement: Option<SafetyJudgement>,
    ) -> Self {
        let (rule_score, rule_audit) = rule_audit(facts, level);
        let (accuracy, clarity, omissions) = judgement.as_ref().map_or((0.0, 0.0, false), |j| {
            (
                j.clinical_accuracy.unwrap_or(0.0),
                j.summary_clarity.unwrap_or(0.0),
                j.dangerous_omissions,
            )
        });
        let final_safety_score = rule_score + accuracy * 3.0 + clarity * 2.0;
        Self {
            rescan_flags,
            judgement,
            rule_audit,
            final_safety_score,
            upgraded_from: None,
            safety_pass: final_safety_score > SAFETY_PASS_SCORE && !omissions,
        }
    }

    /// Lowest level the gate will accept given its rescan and the judge's verdict.
    pub fn floor(&self) -> Option<TriageLevel> {
        let rescan = crate::rules::max_severity(&self.rescan_flags);
        let judged = self.judgement.as_ref().and_then(|j| {
            let omission = j.dangerous_omissions.then_some(TriageLevel::Urgent);
            omission.max(j.minimum_level)
        });
        rescan.max(judged)
    }
}

/// Deterministic checks on the extraction and the proposed level.
fn rule_audit(facts: &ExtractedFacts, level: TriageLevel) -> (f64, Vec<String>) {
    let mut score = 0.0;
    let mut notes = Vec::new();

    if !facts.red_flags.is_empty() {
        score += 20.0;
        notes.push("Red flags parsed from the narrative.".to_owned());
    }

    let critical = facts.symptoms.iter().find_map(|symptom| {
        let symptom = normalize_text(symptom);
        AUDIT_CRITICAL_SYMPTOMS
            .iter()
            .find(|trigger| contains_phrase(&symptom, trigger))
            .copied()
    });
    match critical {
        Some(trigger) if level != TriageLevel::Emergency => {
            score -= 60.0;
            notes.push(format!(
                "Critical: high-risk symptom '{trigger}' not triaged as emergency."
            ));
        }
        _ => {
            score += 20.0;
            notes.push("Triage level appears safe for the symptoms provided.".to_owned());
        }
    }
    (score, notes)
}
