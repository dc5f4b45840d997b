//! Typed candidates returned by generative stages.
//!
//! A proposer returns untyped JSON. Before the orchestrator uses any of it, the JSON is
//! strictly parsed into one of the types below and normalised by [`Candidate::validate`].
//! Anything that fails either step counts as an invalid attempt and is retried.

use super::ProposerError;
use crate::TriageLevel;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A stage output that can be checked and normalised after parsing.
pub trait Candidate: DeserializeOwned + Sized {
    /// Normalises the candidate, or explains why it is unusable.
    fn validate(self) -> Result<Self, String>;
}

/// Parse a JSON candidate with field-path error reporting, then validate it.
pub fn parse_candidate<T: Candidate>(value: serde_json::Value) -> Result<T, ProposerError> {
    match serde_path_to_error::deserialize::<_, T>(value) {
        Ok(parsed) => parsed.validate().map_err(ProposerError::InvalidCandidate),
        Err(err) => {
            let path = err.path().to_string();
            let source = err.into_inner();
            let path = if path.is_empty() || path == "." {
                "<root>"
            } else {
                path.as_str()
            };
            Err(ProposerError::InvalidCandidate(format!(
                "schema mismatch at {path}: {source}"
            )))
        }
    }
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|item| item.trim().to_owned())
        .filter(|item| !item.is_empty())
        .collect()
}

fn clean_opt(item: Option<String>) -> Option<String> {
    item.map(|s| s.trim().to_owned()).filter(|s| !s.is_empty())
}

/// Structured facts extracted from the patient narrative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ExtractedFacts {
    pub symptoms: Vec<String>,
    pub duration: Option<String>,
    pub severity: Option<String>,
    pub red_flags: Vec<String>,
    pub risk_factors: Vec<String>,
    pub brief_summary: Option<String>,
}

impl ExtractedFacts {
    /// True when extraction produced nothing the rule engine could scan.
    pub fn is_empty(&self) -> bool {
        self.symptoms.is_empty()
            && self.red_flags.is_empty()
            && self.risk_factors.is_empty()
            && self.duration.is_none()
            && self.severity.is_none()
            && self.brief_summary.is_none()
    }
}

impl Candidate for ExtractedFacts {
    fn validate(self) -> Result<Self, String> {
        Ok(Self {
            symptoms: clean_list(self.symptoms),
            duration: clean_opt(self.duration),
            severity: clean_opt(self.severity),
            red_flags: clean_list(self.red_flags),
            risk_factors: clean_list(self.risk_factors),
            brief_summary: clean_opt(self.brief_summary),
        })
    }
}

/// Advisory triage level proposed by the triage stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageProposal {
    pub level: TriageLevel,
    pub reasoning: String,
    #[serde(default)]
    pub action: Option<String>,
    pub confidence_score: f64,
}

impl Candidate for TriageProposal {
    fn validate(self) -> Result<Self, String> {
        if !(0.0..=1.0).contains(&self.confidence_score) {
            return Err(format!(
                "confidence_score must be within [0, 1], got {}",
                self.confidence_score
            ));
        }
        let reasoning = self.reasoning.trim().to_owned();
        if reasoning.is_empty() {
            return Err("reasoning cannot be empty".into());
        }
        Ok(Self {
            reasoning,
            action: clean_opt(self.action),
            ..self
        })
    }
}

/// Follow-up questions and safety-net advice from the investigation stage.
///
/// Blank questions are dropped here. Whether an empty list is acceptable depends on the
/// level being investigated, so that check lives with the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvestigationProposal {
    pub questions_to_ask: Vec<String>,
    pub safety_net_advice: Option<String>,
}

impl Candidate for InvestigationProposal {
    fn validate(self) -> Result<Self, String> {
        Ok(Self {
            questions_to_ask: clean_list(self.questions_to_ask),
            safety_net_advice: clean_opt(self.safety_net_advice),
        })
    }
}

/// Clinician-facing summary of the encounter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ClinicalSummary {
    pub chief_complaint: String,
    #[serde(default)]
    pub history: String,
    #[serde(default)]
    pub red_flags_identified: Vec<String>,
    #[serde(default)]
    pub risk_level: TriageLevel,
    #[serde(default)]
    pub recommended_action: String,
    #[serde(default)]
    pub clinician_note: String,
}

impl ClinicalSummary {
    /// Text fields that the safety gate re-scans for red flags.
    pub fn scan_texts(&self) -> impl Iterator<Item = &str> {
        [
            self.chief_complaint.as_str(),
            self.history.as_str(),
            self.recommended_action.as_str(),
            self.clinician_note.as_str(),
        ]
        .into_iter()
        .chain(self.red_flags_identified.iter().map(String::as_str))
    }
}

impl Candidate for ClinicalSummary {
    fn validate(self) -> Result<Self, String> {
        let chief_complaint = self.chief_complaint.trim().to_owned();
        if chief_complaint.is_empty() {
            return Err("chief_complaint cannot be empty".into());
        }
        Ok(Self {
            chief_complaint,
            history: self.history.trim().to_owned(),
            red_flags_identified: clean_list(self.red_flags_identified),
            recommended_action: self.recommended_action.trim().to_owned(),
            clinician_note: self.clinician_note.trim().to_owned(),
            ..self
        })
    }
}

/// Verdict of the external safety judge.
///
/// Scores are on a 0 to 10 scale. A missing score counts as zero in the audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SafetyJudgement {
    pub dangerous_omissions: bool,
    #[serde(default)]
    pub minimum_level: Option<TriageLevel>,
    #[serde(default)]
    pub clinical_accuracy: Option<f64>,
    #[serde(default)]
    pub triage_appropriateness: Option<f64>,
    #[serde(default)]
    pub summary_clarity: Option<f64>,
    #[serde(default)]
    pub comment: String,
}

impl Candidate for SafetyJudgement {
    fn validate(self) -> Result<Self, String> {
        for (name, score) in [
            ("clinical_accuracy", self.clinical_accuracy),
            ("triage_appropriateness", self.triage_appropriateness),
            ("summary_clarity", self.summary_clarity),
        ] {
            if let Some(score) = score {
                if !(0.0..=10.0).contains(&score) {
                    return Err(format!("{name} {score} outside 0..=10"));
                }
            }
        }
        Ok(Self {
            comment: self.comment.trim().to_owned(),
            ..self
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn facts_parse_with_missing_fields_and_drop_blanks() {
        let facts: ExtractedFacts = parse_candidate(json!({
            "symptoms": ["headache", "  ", " nausea "],
            "severity": "  ",
        }))
        .expect("valid facts");
        assert_eq!(facts.symptoms, vec!["headache", "nausea"]);
        assert_eq!(facts.severity, None);
        assert!(!facts.is_empty());
        assert!(ExtractedFacts::default().is_empty());
    }

    #[test]
    fn triage_proposal_rejects_out_of_range_confidence() {
        let err = parse_candidate::<TriageProposal>(json!({
            "level": "urgent",
            "reasoning": "fever",
            "confidence_score": 1.5,
        }))
        .expect_err("confidence out of range");
        assert!(matches!(err, ProposerError::InvalidCandidate(msg) if msg.contains("confidence_score")));
    }

    #[test]
    fn triage_proposal_reports_field_path_on_schema_mismatch() {
        let err = parse_candidate::<TriageProposal>(json!({
            "level": "critical",
            "reasoning": "x",
            "confidence_score": 0.5,
        }))
        .expect_err("unknown level");
        match err {
            ProposerError::InvalidCandidate(msg) => assert!(msg.contains("level"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn triage_proposal_accepts_self_care() {
        let proposal: TriageProposal = parse_candidate(json!({
            "level": "self-care",
            "reasoning": " mild symptoms ",
            "action": "",
            "confidence_score": 0.8,
        }))
        .expect("valid proposal");
        assert_eq!(proposal.level, TriageLevel::Routine);
        assert_eq!(proposal.reasoning, "mild symptoms");
        assert_eq!(proposal.action, None);
    }

    #[test]
    fn investigation_drops_blank_questions() {
        let proposal: InvestigationProposal = parse_candidate(json!({
            "questions_to_ask": ["", "   ", "Any fever?"],
        }))
        .expect("valid proposal");
        assert_eq!(proposal.questions_to_ask, vec!["Any fever?"]);
    }

    #[test]
    fn summary_requires_chief_complaint() {
        assert!(parse_candidate::<ClinicalSummary>(json!({"chief_complaint": " "})).is_err());
        let summary: ClinicalSummary =
            parse_candidate(json!({"chief_complaint": "headache"})).expect("valid summary");
        assert_eq!(summary.risk_level, TriageLevel::Routine);
        assert_eq!(summary.scan_texts().count(), 4);
    }

    #[test]
    fn judgement_scores_must_be_on_the_ten_point_scale() {
        let judgement: SafetyJudgement = parse_candidate(json!({
            "dangerous_omissions": false,
            "clinical_accuracy": 9,
            "summary_clarity": 7.5,
            "comment": " fine ",
        }))
        .expect("valid judgement");
        assert_eq!(judgement.clinical_accuracy, Some(9.0));
        assert_eq!(judgement.triage_appropriateness, None);
        assert_eq!(judgement.comment, "fine");

        let err = parse_candidate::<SafetyJudgement>(json!({
            "dangerous_omissions": false,
            "clinical_accuracy": 42,
        }))
        .expect_err("out of range");
        assert!(err.to_string().contains("clinical_accuracy"), "{err}");
    }
}
