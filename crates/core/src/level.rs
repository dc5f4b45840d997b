//! Triage acuity levels.

use crate::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Acuity of a triage decision.
///
/// Variants are declared in ascending severity, so the derived `Ord` gives
/// `Routine < Urgent < Emergency` and "most severe wins" is simply `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum TriageLevel {
    #[default]
    #[serde(alias = "self-care", alias = "self_care", alias = "selfcare")]
    Routine,
    Urgent,
    Emergency,
}

impl TriageLevel {
    pub const ALL: [TriageLevel; 3] = [
        TriageLevel::Routine,
        TriageLevel::Urgent,
        TriageLevel::Emergency,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TriageLevel::Routine => "routine",
            TriageLevel::Urgent => "urgent",
            TriageLevel::Emergency => "emergency",
        }
    }

    /// Routine and urgent outcomes send the patient away from immediate care, so they must
    /// always leave the patient with at least one follow-up question.
    pub fn requires_investigation(self) -> bool {
        matches!(self, TriageLevel::Routine | TriageLevel::Urgent)
    }
}

impl fmt::Display for TriageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriageLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "routine" | "self-care" | "self_care" | "selfcare" => Ok(TriageLevel::Routine),
            "urgent" => Ok(TriageLevel::Urgent),
            "emergency" => Ok(TriageLevel::Emergency),
            other => Err(CoreError::InvalidInput(format!(
                "unknown triage level: '{other}'"
            ))),
        }
    }
}
