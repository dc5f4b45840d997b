//! Request and response shapes of a pipeline turn.

use super::ClinicalSummary;
use crate::audit::AuditTrail;
use crate::ehr::EhrWriteResult;
use crate::latch::{Session, TimelineEntry};
use crate::{CoreError, ErrorCode, RedFlag, TriageLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One patient turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct IntakeRequest {
    pub session_id: String,
    pub patient_id: String,
    pub message: String,
    /// Whether the patient consented to the record being written to the EHR.
    #[serde(default)]
    pub consent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TriageView {
    pub level: TriageLevel,
    pub reasoning: String,
    pub questions: Vec<String>,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct FollowUp {
    pub safety_net_advice: String,
    pub questions_to_ask: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TurnMetadata {
    pub patient_id: String,
    /// Wall-clock duration of the run, e.g. `"0.412s"`.
    pub latency: String,
    pub trace_id: String,
    pub session_id: String,
    pub latch_version: u64,
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum WorkflowStatus {
    /// No consent: the decision is latched and traced, nothing is written to the EHR.
    Logged,
    Saved,
    Blocked,
    /// Consent was given but the EHR writer failed.
    Failed,
}

/// Non-fatal condition attached to a successful response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Notice {
    pub code: ErrorCode,
    pub message: String,
}

/// Error body returned by every API surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&CoreError> for ErrorBody {
    fn from(err: &CoreError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TurnResponse {
    pub triage: TriageView,
    pub follow_up: FollowUp,
    pub metadata: TurnMetadata,
    pub clinical_summary: ClinicalSummary,
    pub red_flags: Vec<RedFlag>,
    pub workflow_status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ehr: Option<EhrWriteResult>,
    pub notices: Vec<Notice>,
    pub audit: AuditTrail,
}

impl TurnResponse {
    pub fn has_notice(&self, code: ErrorCode) -> bool {
        self.notices.iter().any(|n| n.code == code)
    }
}

/// Read-only view of a session for API callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SessionView {
    pub session_id: String,
    pub patient_id: String,
    pub current_level: TriageLevel,
    pub latch_version: u64,
    pub closed: bool,
    pub history: Vec<TimelineEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.session_id().to_string(),
            patient_id: session.patient_id().to_string(),
            current_level: session.current_level(),
            latch_version: session.latch_version(),
            closed: session.is_closed(),
            history: session.history().to_vec(),
            created_at: session.created_at(),
            updated_at: session.updated_at(),
        }
    }
}

/// Formats a latency in milliseconds the way turn metadata reports it.
pub fn format_latency(ms: u64) -> String {
    format!("{:.3}s", ms as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LatchError;

    #[test]
    fn intake_request_defaults_consent_to_false() {
        let req: IntakeRequest = serde_json::from_str(
            r#"{"session_id":"enc-1","patient_id":"p-1","message":"headache"}"#,
        )
        .expect("valid request");
        assert!(!req.consent);
    }

    #[test]
    fn error_body_carries_code_and_message() {
        let err = CoreError::from(LatchError::SessionClosed("enc-1".into()));
        let body = ErrorBody::from(&err);
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(json["code"], "SessionClosed");
        assert!(json["message"].as_str().unwrap_or_default().contains("enc-1"));
    }

    #[test]
    fn latency_is_seconds_with_millis() {
        assert_eq!(format_latency(412), "0.412s");
        assert_eq!(format_latency(12_050), "12.050s");
    }
}
