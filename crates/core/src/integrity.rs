//! Hash-and-consent gate in front of the EHR writer.
//!
//! A record is sealed when consent is captured: its canonical form is hashed and the hash is
//! kept alongside the consent timestamp. Before the write, the record is hashed again. The
//! write only goes ahead if the hash still matches and the consent is not older than the
//! record's last modification.
//!
//! Canonical form: the record's JSON value with object keys sorted, every string NFC
//! normalised, trimmed and with internal whitespace collapsed, written without insignificant
//! whitespace. Formatting-only differences therefore hash the same, while any change to
//! clinical content does not.

use crate::ehr::{EhrWriteResult, EhrWriter};
use crate::pipeline::{ClinicalSummary, ExtractedFacts, SafetyReport, TriageDecision};
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use medflow_ids::{CaseId, SessionId};
use medflow_types::{ContentHash, NonEmptyText};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use unicode_normalization::UnicodeNormalization;

/// Clinical payload of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ClinicalContent {
    pub extraction: ExtractedFacts,
    pub decision: TriageDecision,
    pub summary: ClinicalSummary,
    pub safety: SafetyReport,
}

/// A clinical record ready for consent and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ClinicalRecord {
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    pub case_id: CaseId,
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    pub session_id: SessionId,
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    pub patient_id: NonEmptyText,
    pub content: ClinicalContent,
    pub modified_at: DateTime<Utc>,
    pub degraded: bool,
}

impl ClinicalRecord {
    /// Replaces the clinical content and stamps the modification time.
    pub fn amend(&mut self, content: ClinicalContent) {
        self.content = content;
        self.modified_at = Utc::now();
    }
}

/// The part of a record covered by its content hash.
///
/// `case_id` and `modified_at` are bookkeeping and excluded; who the record is about is not.
#[derive(Serialize)]
struct HashedView<'a> {
    session_id: &'a SessionId,
    patient_id: &'a NonEmptyText,
    content: &'a ClinicalContent,
    degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum BlockReason {
    ContentMismatch {
        #[cfg_attr(feature = "openapi", schema(value_type = String))]
        expected: ContentHash,
        #[cfg_attr(feature = "openapi", schema(value_type = String))]
        actual: ContentHash,
    },
    ConsentPredatesModification {
        consent_at: DateTime<Utc>,
        modified_at: DateTime<Utc>,
    },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::ContentMismatch { expected, actual } => write!(
                f,
                "content hash mismatch (sealed {expected}, current {actual})"
            ),
            BlockReason::ConsentPredatesModification {
                consent_at,
                modified_at,
            } => write!(
                f,
                "consent captured at {} predates last modification at {}",
                consent_at.to_rfc3339(),
                modified_at.to_rfc3339()
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum Verdict {
    Allow,
    Block { reason: BlockReason },
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// A record with the hash and consent time captured when it was sealed.
///
/// This is the only thing an [`EhrWriter`] accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SealedRecord {
    pub record: ClinicalRecord,
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    pub content_hash: ContentHash,
    pub consent_captured_at: DateTime<Utc>,
}

pub struct IntegrityGate;

impl IntegrityGate {
    /// Canonical string form of `record`'s hashed view.
    pub fn canonicalize(record: &ClinicalRecord) -> CoreResult<String> {
        let view = HashedView {
            session_id: &record.session_id,
            patient_id: &record.patient_id,
            content: &record.content,
            degraded: record.degraded,
        };
        let value = serde_json::to_value(&view).map_err(CoreError::Serialization)?;
        canonical_json(&value)
    }

    pub fn seal(record: &ClinicalRecord) -> CoreResult<ContentHash> {
        Ok(ContentHash::digest(Self::canonicalize(record)?))
    }

    /// Seals `record` at the moment consent is captured.
    pub fn capture_consent(
        record: ClinicalRecord,
        consent_at: DateTime<Utc>,
    ) -> CoreResult<SealedRecord> {
        let content_hash = Self::seal(&record)?;
        Ok(SealedRecord {
            record,
            content_hash,
            consent_captured_at: consent_at,
        })
    }

    /// Decides whether `record` may be written under a seal taken at `consent_at`.
    pub fn verify(
        record: &ClinicalRecord,
        sealed_hash: &ContentHash,
        consent_at: DateTime<Utc>,
    ) -> CoreResult<Verdict> {
        let actual = Self::seal(record)?;
        if &actual != sealed_hash {
            return Ok(Verdict::Block {
                reason: BlockReason::ContentMismatch {
                    expected: sealed_hash.clone(),
                    actual,
                },
            });
        }
        if consent_at < record.modified_at {
            return Ok(Verdict::Block {
                reason: BlockReason::ConsentPredatesModification {
                    consent_at,
                    modified_at: record.modified_at,
                },
            });
        }
        Ok(Verdict::Allow)
    }

    /// Verifies `sealed` and hands it to `writer` only if the gate allows it.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::IntegrityBlocked` when the gate blocks; the writer is not called.
    pub fn commit(sealed: &SealedRecord, writer: &dyn EhrWriter) -> CoreResult<EhrWriteResult> {
        let verdict = Self::verify(
            &sealed.record,
            &sealed.content_hash,
            sealed.consent_captured_at,
        )?;
        match verdict {
            Verdict::Allow => writer.write(sealed),
            Verdict::Block { reason } => {
                tracing::warn!(
                    case_id = %sealed.record.case_id,
                    reason = %reason,
                    "integrity gate blocked EHR write"
                );
                Err(CoreError::IntegrityBlocked(reason))
            }
        }
    }
}

/// Trim, collapse internal whitespace and NFC-normalise.
pub fn normalize_string(input: &str) -> String {
    let nfc: String = input.nfc().collect();
    nfc.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Writes `value` in canonical form.
///
/// Keys are sorted explicitly rather than relying on the map type, so the output does not
/// depend on serde_json's `preserve_order` feature.
pub fn canonical_json(value: &Value) -> CoreResult<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> CoreResult<()> {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => {
            out.push_str(&serde_json::to_string(value).map_err(CoreError::Serialization)?);
        }
        Value::String(s) => {
            let normalized = normalize_string(s);
            out.push_str(&serde_json::to_string(&normalized).map_err(CoreError::Serialization)?);
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).map_err(CoreError::Serialization)?);
                out.push(':');
                if let Some(item) = map.get(key) {
                    write_canonical(item, out)?;
                }
            }
            out.push('}');
        }
    }
    Ok(())
}
