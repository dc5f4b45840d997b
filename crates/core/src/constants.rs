//! Constants used throughout the MedFlow core crate.

use crate::TriageLevel;

/// Default directory for session and EHR data when no explicit directory is configured.
pub const DEFAULT_DATA_DIR: &str = "medflow_data";

/// Directory name for session state under the data directory.
pub const SESSIONS_DIR_NAME: &str = "sessions";

/// Directory name for written clinical records under the data directory.
pub const EHR_DIR_NAME: &str = "ehr";

/// Default number of retries after the first attempt of a generative stage.
pub const DEFAULT_RETRY_BUDGET: u32 = 2;

/// Upper bound accepted for the retry budget.
pub const MAX_RETRY_BUDGET: u32 = 5;

/// Base delay for exponential backoff between stage attempts.
pub const DEFAULT_BACKOFF_MS: u64 = 200;

/// Per-attempt timeout for generative stages without an explicit override.
pub const DEFAULT_STAGE_TIMEOUT_MS: u64 = 15_000;

/// Maximum characters of narrative kept in a timeline entry.
pub const TIMELINE_SUMMARY_CHARS: usize = 120;

/// Fallback follow-up questions used when the investigation stage cannot produce any.
pub const DEFAULT_SAFETY_NET_QUESTIONS: &[&str] = &[
    "Has your condition worsened?",
    "Are you experiencing any new pain?",
];

pub const EMERGENCY_ADVICE: &str =
    "Call emergency services now or go to the nearest emergency department.";
pub const URGENT_ADVICE: &str =
    "Seek same-day medical review. If symptoms worsen, contact emergency services.";
pub const ROUTINE_ADVICE: &str =
    "If symptoms worsen or new symptoms appear, contact your GP or emergency services.";

/// Symptoms the safety audit penalises when a run leaves them below emergency.
pub const AUDIT_CRITICAL_SYMPTOMS: &[&str] = &[
    "chest pain",
    "difficulty breathing",
    "shortness of breath",
    "stroke",
];

/// Audit score a run must exceed to pass the safety review.
pub const SAFETY_PASS_SCORE: f64 = 50.0;

/// Built-in red-flag table: `(category, severity, phrases)`, in precedence order.
pub const DEFAULT_RED_FLAG_TABLE: &[(&str, TriageLevel, &[&str])] = &[
    (
        "cardiac",
        TriageLevel::Emergency,
        &[
            "chest pain",
            "radiating arm pain",
            "shortness of breath",
            "crushing chest",
        ],
    ),
    (
        "neurological",
        TriageLevel::Emergency,
        &[
            "facial drooping",
            "slurred speech",
            "sudden confusion",
            "stroke",
            "seizure",
            "unconscious",
        ],
    ),
    (
        "respiratory",
        TriageLevel::Emergency,
        &["difficulty breathing", "can't breathe", "choking", "blue lips"],
    ),
    (
        "abdominal",
        TriageLevel::Emergency,
        &[
            "right lower quadrant pain",
            "rigid abdomen",
            "rebound tenderness",
        ],
    ),
    (
        "haemorrhage",
        TriageLevel::Emergency,
        &["heavy bleeding", "vomiting blood", "coughing up blood"],
    ),
    (
        "mental_health",
        TriageLevel::Emergency,
        &["suicidal ideation", "suicidal thoughts", "want to die"],
    ),
    (
        "infection",
        TriageLevel::Urgent,
        &["high fever", "stiff neck", "rash that does not fade"],
    ),
];

/// Groups that turn a moderate extracted severity into an urgent risk profile.
pub const DEFAULT_HIGH_RISK_GROUPS: &[&str] = &[
    "diabetes",
    "heart disease",
    "elderly",
    "infant",
    "immunocompromised",
    "pregnancy",
];

/// Category name used for flags raised from extracted severity and risk factors.
pub const RISK_PROFILE_CATEGORY: &str = "risk_profile";
