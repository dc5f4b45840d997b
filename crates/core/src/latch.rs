//! Sticky per-session triage state.
//!
//! A session's level can only go up while the session is open. Every transition bumps
//! `latch_version`, and the store only accepts a write whose expected version matches what it
//! holds, so two writers racing from the same snapshot cannot both win.
//!
//! The transition itself is pure ([`Session::transition`]); [`TriageLatch`] pairs it with a
//! [`SessionStore`] for the read-modify-CAS cycle.

use crate::session_store::SessionStore;
use crate::{CoreError, CoreResult, LatchError, TriageLevel};
use chrono::{DateTime, Utc};
use medflow_ids::SessionId;
use medflow_types::NonEmptyText;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Name recorded in the timeline when a session is closed.
pub const CLOSURE_ENTRY: &str = "closure";

/// One append-only line of a session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TimelineEntry {
    pub stage: String,
    pub input_summary: String,
    pub output: String,
    pub recorded_at: DateTime<Utc>,
}

impl TimelineEntry {
    pub fn new(
        stage: impl Into<String>,
        input_summary: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            input_summary: input_summary.into(),
            output: output.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Encounter state owned by the session store.
///
/// Fields are private: the only ways to obtain a modified session are [`Session::transition`]
/// and [`Session::close`], which enforce monotonic levels and version bumps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    session_id: SessionId,
    patient_id: NonEmptyText,
    current_level: TriageLevel,
    latch_version: u64,
    closed: bool,
    history: Vec<TimelineEntry>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Session {
    /// A fresh, open session at `Routine` and version 0.
    pub fn new(session_id: SessionId, patient_id: NonEmptyText) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            patient_id,
            current_level: TriageLevel::Routine,
            latch_version: 0,
            closed: false,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn patient_id(&self) -> &NonEmptyText {
        &self.patient_id
    }

    pub fn current_level(&self) -> TriageLevel {
        self.current_level
    }

    pub fn latch_version(&self) -> u64 {
        self.latch_version
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn history(&self) -> &[TimelineEntry] {
        &self.history
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Level the session would hold after accepting `proposed`, without producing a new
    /// session.
    pub fn latched_level(&self, proposed: TriageLevel) -> Result<TriageLevel, LatchError> {
        if self.closed {
            return Err(LatchError::SessionClosed(self.session_id.to_string()));
        }
        Ok(self.current_level.max(proposed))
    }

    /// Applies a proposed level and returns the next session state.
    ///
    /// The new level is `max(current, proposed)`, the version goes up by one and `entries`
    /// are appended to the history.
    ///
    /// # Errors
    ///
    /// Returns [`LatchError::SessionClosed`] if the session is closed.
    pub fn transition(
        &self,
        proposed: TriageLevel,
        entries: Vec<TimelineEntry>,
    ) -> Result<Session, LatchError> {
        let level = self.latched_level(proposed)?;
        let mut next = self.clone();
        next.current_level = level;
        next.latch_version += 1;
        next.history.extend(entries);
        next.updated_at = Utc::now();
        Ok(next)
    }

    /// Returns the closed form of this session.
    ///
    /// # Errors
    ///
    /// Returns [`LatchError::SessionClosed`] if the session is already closed.
    pub fn close(&self) -> Result<Session, LatchError> {
        if self.closed {
            return Err(LatchError::SessionClosed(self.session_id.to_string()));
        }
        let mut next = self.clone();
        next.closed = true;
        next.latch_version += 1;
        next.history.push(TimelineEntry::new(
            CLOSURE_ENTRY,
            "",
            format!("closed at {}", next.current_level),
        ));
        next.updated_at = Utc::now();
        Ok(next)
    }
}

/// Store-backed latch operations.
#[derive(Clone)]
pub struct TriageLatch {
    store: Arc<dyn SessionStore>,
}

impl TriageLatch {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Loads a session.
    ///
    /// # Errors
    ///
    /// Returns [`LatchError::NotFound`] if the session does not exist.
    pub fn get(&self, session_id: &SessionId) -> CoreResult<Session> {
        self.store
            .load(session_id)?
            .ok_or_else(|| LatchError::NotFound(session_id.to_string()).into())
    }

    /// Returns the existing session or creates a new one for `patient_id`.
    ///
    /// Creation is insert-if-absent; if another writer created the session first, theirs is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the session exists for a different patient.
    pub fn open(&self, session_id: &SessionId, patient_id: &NonEmptyText) -> CoreResult<Session> {
        let session = match self.store.load(session_id)? {
            Some(existing) => existing,
            None => {
                let fresh = Session::new(session_id.clone(), patient_id.clone());
                match self.store.compare_and_swap(None, fresh) {
                    Ok(created) => {
                        tracing::info!(session_id = %session_id, "session created");
                        created
                    }
                    Err(LatchError::ConcurrentModification { .. }) => self.get(session_id)?,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        if session.patient_id() != patient_id {
            return Err(CoreError::InvalidInput(format!(
                "session {session_id} belongs to a different patient"
            )));
        }

        Ok(session)
    }

    /// Applies `proposed` to the session, provided it is still at `expected_version`.
    ///
    /// # Errors
    ///
    /// - [`LatchError::NotFound`] if the session does not exist
    /// - [`LatchError::SessionClosed`] if it is closed
    /// - [`LatchError::ConcurrentModification`] if its version is not `expected_version`
    pub fn apply(
        &self,
        session_id: &SessionId,
        expected_version: u64,
        proposed: TriageLevel,
        entries: Vec<TimelineEntry>,
    ) -> CoreResult<Session> {
        let current = self.get(session_id)?;
        let next = current.transition(proposed, entries)?;
        if current.latch_version() != expected_version {
            return Err(LatchError::ConcurrentModification {
                session_id: session_id.to_string(),
                expected: Some(expected_version),
                actual: Some(current.latch_version()),
            }
            .into());
        }

        let committed = self.store.compare_and_swap(Some(expected_version), next)?;
        tracing::info!(
            session_id = %session_id,
            level = %committed.current_level(),
            latch_version = committed.latch_version(),
            "latch committed"
        );
        Ok(committed)
    }

    /// Closes the session. This is the only way a session leaves its risk level.
    pub fn close(&self, session_id: &SessionId, expected_version: u64) -> CoreResult<Session> {
        let current = self.get(session_id)?;
        let next = current.close()?;
        if current.latch_version() != expected_version {
            return Err(LatchError::ConcurrentModification {
                session_id: session_id.to_string(),
                expected: Some(expected_version),
                actual: Some(current.latch_version()),
            }
            .into());
        }

        let committed = self.store.compare_and_swap(Some(expected_version), next)?;
        tracing::info!(session_id = %session_id, "session closed");
        Ok(committed)
    }
}
