//! Session persistence behind a compare-and-swap contract.
//!
//! Stores never interpret session contents; they only guarantee that a write lands when the
//! stored version is the one the writer read. `expected_version = None` means "insert only if
//! absent".

use crate::latch::Session;
use crate::LatchError;
use medflow_ids::SessionId;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait SessionStore: Send + Sync {
    fn load(&self, session_id: &SessionId) -> Result<Option<Session>, LatchError>;

    /// Writes `next` if the stored version equals `expected_version` and returns it.
    ///
    /// # Errors
    ///
    /// - [`LatchError::ConcurrentModification`] when the stored version differs
    /// - [`LatchError::StoreUnavailable`] when the backing storage fails
    fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        next: Session,
    ) -> Result<Session, LatchError>;
}

fn check_version(
    session_id: &SessionId,
    expected: Option<u64>,
    current: Option<&Session>,
) -> Result<(), LatchError> {
    let actual = current.map(Session::latch_version);
    if actual != expected {
        return Err(LatchError::ConcurrentModification {
            session_id: session_id.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn poisoned<T>(_: T) -> LatchError {
    LatchError::StoreUnavailable("session store lock poisoned".into())
}

/// Mutex-guarded in-process store.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl SessionStore for InMemorySessionStore {
    fn load(&self, session_id: &SessionId) -> Result<Option<Session>, LatchError> {
        let sessions = self.sessions.lock().map_err(poisoned)?;
        Ok(sessions.get(session_id).cloned())
    }

    fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        next: Session,
    ) -> Result<Session, LatchError> {
        let mut sessions = self.sessions.lock().map_err(poisoned)?;
        let id = next.session_id().clone();
        check_version(&id, expected_version, sessions.get(&id))?;
        sessions.insert(id, next.clone());
        Ok(next)
    }
}

/// One JSON file per session under a sharded directory tree.
///
/// Files live at `root/<h[0..2]>/<h[2..4]>/<h>.json` where `h` is the SHA-256 of the session
/// key. Writes go to a temporary file in the same directory and are renamed into place, so a
/// reader never sees a half-written session. CAS is serialised by a store-wide lock, which
/// covers writers within one process.
#[derive(Debug)]
pub struct FileSessionStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileSessionStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`LatchError::StoreUnavailable`] if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, LatchError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            LatchError::StoreUnavailable(format!(
                "cannot create session directory {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self, session_id: &SessionId) -> Result<Option<Session>, LatchError> {
        let path = session_id.sharded_file(&self.root);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LatchError::StoreUnavailable(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        let session: Session = serde_json::from_slice(&bytes).map_err(|e| {
            LatchError::StoreUnavailable(format!("corrupt session file {}: {e}", path.display()))
        })?;
        Ok(Some(session))
    }

    fn write_atomic(&self, session: &Session) -> Result<(), LatchError> {
        let path = session.session_id().sharded_file(&self.root);
        let unavailable =
            |e: &dyn std::fmt::Display| LatchError::StoreUnavailable(format!("{}: {e}", path.display()));

        let parent = path
            .parent()
            .ok_or_else(|| LatchError::StoreUnavailable("session path has no parent".into()))?;
        fs::create_dir_all(parent).map_err(|e| unavailable(&e))?;

        let json = serde_json::to_vec_pretty(session).map_err(|e| unavailable(&e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| unavailable(&e))?;
        tmp.write_all(&json).map_err(|e| unavailable(&e))?;
        tmp.as_file().sync_all().map_err(|e| unavailable(&e))?;
        tmp.persist(&path).map_err(|e| unavailable(&e.error))?;
        Ok(())
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, session_id: &SessionId) -> Result<Option<Session>, LatchError> {
        self.read(session_id)
    }

    fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        next: Session,
    ) -> Result<Session, LatchError> {
        let _guard = self.lock.lock().map_err(poisoned)?;
        let current = self.read(next.session_id())?;
        check_version(next.session_id(), expected_version, current.as_ref())?;
        self.write_atomic(&next)?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TriageLevel;
    use medflow_types::NonEmptyText;
    use tempfile::TempDir;

    fn session(id: &str) -> Session {
        Session::new(
            SessionId::parse(id).expect("valid id"),
            NonEmptyText::new("p-1").expect("valid patient"),
        )
    }

    #[test]
    fn in_memory_insert_if_absent() {
        let store = InMemorySessionStore::default();
        store
            .compare_and_swap(None, session("enc-1"))
            .expect("insert");
        let err = store
            .compare_and_swap(None, session("enc-1"))
            .expect_err("already present");
        assert!(matches!(
            err,
            LatchError::ConcurrentModification {
                expected: None,
                actual: Some(0),
                ..
            }
        ));
    }

    #[test]
    fn file_store_round_trips_sessions() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileSessionStore::open(dir.path().join("sessions")).expect("store");
        let id = SessionId::parse("enc-1").expect("valid id");
        assert_eq!(store.load(&id).expect("load"), None);

        let created = store
            .compare_and_swap(None, session("enc-1"))
            .expect("insert");
        let next = created
            .transition(TriageLevel::Urgent, vec![])
            .expect("open session");
        store
            .compare_and_swap(Some(0), next.clone())
            .expect("cas write");

        let loaded = store.load(&id).expect("load").expect("present");
        assert_eq!(loaded, next);

        let path = id.sharded_file(store.root());
        assert!(path.is_file());
    }

    #[test]
    fn file_store_rejects_stale_versions() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileSessionStore::open(dir.path()).expect("store");
        let created = store
            .compare_and_swap(None, session("enc-2"))
            .expect("insert");
        let first = created
            .transition(TriageLevel::Emergency, vec![])
            .expect("open");
        let second = created
            .transition(TriageLevel::Routine, vec![])
            .expect("open");

        store.compare_and_swap(Some(0), first).expect("first wins");
        let err = store
            .compare_and_swap(Some(0), second)
            .expect_err("second is stale");
        assert!(matches!(err, LatchError::ConcurrentModification { .. }));

        let id = SessionId::parse("enc-2").expect("valid id");
        let stored = store.load(&id).expect("load").expect("present");
        assert_eq!(stored.current_level(), TriageLevel::Emergency);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        {
            let store = FileSessionStore::open(dir.path()).expect("store");
            store
                .compare_and_swap(None, session("enc-3"))
                .expect("insert");
        }
        let reopened = FileSessionStore::open(dir.path()).expect("store");
        let id = SessionId::parse("enc-3").expect("valid id");
        assert!(reopened.load(&id).expect("load").is_some());
    }

    #[test]
    fn corrupt_file_is_store_unavailable() {
        let dir = TempDir::new().expect("tempdir");
        let store = FileSessionStore::open(dir.path()).expect("store");
        let id = SessionId::parse("enc-4").expect("valid id");
        let path = id.sharded_file(store.root());
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, b"{not json").expect("write");

        let err = store.load(&id).expect_err("corrupt");
        assert!(matches!(err, LatchError::StoreUnavailable(_)));
    }
}
