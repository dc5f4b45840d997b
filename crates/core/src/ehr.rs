//! EHR writers.
//!
//! Writers accept only [`SealedRecord`]s and never overwrite a case once written. Callers are
//! expected to go through [`IntegrityGate::commit`](crate::IntegrityGate::commit), which
//! verifies the seal before the writer sees the record.

use crate::integrity::SealedRecord;
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use medflow_ids::CaseId;
use medflow_types::ContentHash;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum WriteStatus {
    Saved,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EhrWriteResult {
    pub status: WriteStatus,
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    pub case_id: CaseId,
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    pub content_hash: ContentHash,
    pub message: String,
    pub written_at: DateTime<Utc>,
}

impl EhrWriteResult {
    pub fn saved(sealed: &SealedRecord, message: impl Into<String>) -> Self {
        Self {
            status: WriteStatus::Saved,
            case_id: sealed.record.case_id.clone(),
            content_hash: sealed.content_hash.clone(),
            message: message.into(),
            written_at: Utc::now(),
        }
    }

    pub fn failed(sealed: &SealedRecord, message: impl Into<String>) -> Self {
        Self {
            status: WriteStatus::Failed,
            ..Self::saved(sealed, message)
        }
    }
}

pub trait EhrWriter: Send + Sync {
    /// Persists a sealed record.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::EhrWrite` if the record cannot be stored, including when the case
    /// has already been written.
    fn write(&self, sealed: &SealedRecord) -> CoreResult<EhrWriteResult>;
}

/// On-disk form of a written case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCase {
    pub sealed: SealedRecord,
    pub written_at: DateTime<Utc>,
}

/// Writes each case to its own JSON file under a sharded directory tree.
#[derive(Debug, Clone)]
pub struct FileEhrStore {
    root: PathBuf,
}

impl FileEhrStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads a previously written case.
    pub fn read(&self, case_id: &CaseId) -> CoreResult<StoredCase> {
        let path = case_id.sharded_file(&self.root);
        let bytes = fs::read(&path).map_err(CoreError::FileRead)?;
        serde_json::from_slice(&bytes).map_err(CoreError::Deserialization)
    }
}

impl EhrWriter for FileEhrStore {
    fn write(&self, sealed: &SealedRecord) -> CoreResult<EhrWriteResult> {
        let case_id = &sealed.record.case_id;
        let path = case_id.sharded_file(&self.root);
        let failure = |what: &str, e: &dyn std::fmt::Display| {
            CoreError::EhrWrite(format!("{what} {}: {e}", path.display()))
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| failure("cannot create directory for", &e))?;
        }

        let result = EhrWriteResult::saved(sealed, "Record saved to EHR");
        let stored = StoredCase {
            sealed: sealed.clone(),
            written_at: result.written_at,
        };
        let json = serde_json::to_vec_pretty(&stored).map_err(|e| failure("cannot encode", &e))?;

        // create_new: a written case is never replaced.
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| failure("cannot create", &e))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| failure("cannot write", &e))?;

        tracing::info!(
            case_id = %case_id,
            content_hash = %sealed.content_hash,
            "case written to EHR"
        );
        Ok(result)
    }
}

/// In-process writer, mainly for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryEhrStore {
    cases: Mutex<Vec<StoredCase>>,
}

impl InMemoryEhrStore {
    pub fn len(&self) -> usize {
        self.cases.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cases(&self) -> Vec<StoredCase> {
        self.cases.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl EhrWriter for InMemoryEhrStore {
    fn write(&self, sealed: &SealedRecord) -> CoreResult<EhrWriteResult> {
        let mut cases = self
            .cases
            .lock()
            .map_err(|_| CoreError::EhrWrite("EHR store lock poisoned".into()))?;
        if cases
            .iter()
            .any(|c| c.sealed.record.case_id == sealed.record.case_id)
        {
            return Err(CoreError::EhrWrite(format!(
                "case {} already written",
                sealed.record.case_id
            )));
        }
        let result = EhrWriteResult::saved(sealed, "Record saved to EHR");
        cases.push(StoredCase {
            sealed: sealed.clone(),
            written_at: result.written_at,
        });
        Ok(result)
    }
}
