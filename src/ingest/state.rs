//! Processed-id tracking across runs.
//!
//! The state file is a JSON array of entry ids. It is loaded once at run start
//! and replaced wholesale (temp file + rename) after a successful commit. The
//! revision check and the rename happen under `<state>.lock`, created
//! exclusively, so two committers cannot both pass the check.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::StateError;

/// Ids known to be durably committed, as loaded from one state file revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedState {
    ids: BTreeSet<String>,
    /// Digest of the file bytes this state was loaded from (`None` = no file).
    revision: Option<[u8; 32]>,
}

impl ProcessedState {
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

/// A lock older than this was left by a crashed committer.
const STALE_LOCK: Duration = Duration::from_secs(60);

/// Removes the lock file when the commit is done, whatever the outcome.
struct CommitLock {
    path: PathBuf,
}

impl Drop for CommitLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub struct StateTracker {
    path: PathBuf,
}

impl StateTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or empty file is a cold start. Anything unparseable is fatal.
    pub fn load(&self) -> Result<ProcessedState, StateError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "state file not found, starting empty");
                return Ok(ProcessedState::default());
            }
            Err(e) => return Err(self.io_err(e)),
        };
        let revision = Some(digest(&bytes));
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(ProcessedState {
                ids: BTreeSet::new(),
                revision,
            });
        }
        let ids: BTreeSet<String> =
            serde_json::from_slice(&bytes).map_err(|source| StateError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        Ok(ProcessedState { ids, revision })
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("json.lock")
    }

    /// Add `new_ids` to `base` and atomically replace the file.
    ///
    /// Fails with `StateError::Conflict` if the file no longer matches the
    /// revision `base` was loaded from, and with `StateError::Busy` while
    /// another commit holds the lock. Never removes ids.
    pub fn commit<'a, I>(
        &self,
        base: &ProcessedState,
        new_ids: I,
    ) -> Result<ProcessedState, StateError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let _lock = self.lock()?;
        let on_disk = match fs::read(&self.path) {
            Ok(b) => Some(digest(&b)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(self.io_err(e)),
        };
        if on_disk != base.revision {
            return Err(StateError::Conflict {
                path: self.path.clone(),
            });
        }

        let mut ids = base.ids.clone();
        ids.extend(new_ids.into_iter().map(str::to_string));

        let json = serde_json::to_vec(&ids).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        self.replace_file(&json).map_err(|e| self.io_err(e))?;

        tracing::debug!(path = %self.path.display(), ids = ids.len(), "state committed");
        Ok(ProcessedState {
            ids,
            revision: Some(digest(&json)),
        })
    }

    fn lock(&self) -> Result<CommitLock, StateError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;
        }
        let path = self.lock_path();
        for _ in 0..2 {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(CommitLock { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if !is_stale(&path) {
                        break;
                    }
                    tracing::warn!(lock = %path.display(), "breaking stale state lock");
                    let _ = fs::remove_file(&path);
                }
                Err(e) => return Err(self.io_err(e)),
            }
        }
        Err(StateError::Busy { lock: path })
    }

    fn replace_file(&self, bytes: &[u8]) -> io::Result<()> {
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path).inspect_err(|_| {
            let _ = fs::remove_file(&tmp);
        })
    }

    fn io_err(&self, source: io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn is_stale(lock: &Path) -> bool {
    fs::metadata(lock)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .is_some_and(|age| age > STALE_LOCK)
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_then_empty_file_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StateTracker::new(dir.path().join("state.json"));
        assert!(tracker.load().unwrap().is_empty());

        fs::write(tracker.path(), "  \n").unwrap();
        assert!(tracker.load().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StateTracker::new(dir.path().join("state.json"));
        fs::write(tracker.path(), "[\"a\", ").unwrap();
        assert!(matches!(tracker.load(), Err(StateError::Corrupt { .. })));
    }

    #[test]
    fn commit_is_additive_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StateTracker::new(dir.path().join("nested/state.json"));

        let s0 = tracker.load().unwrap();
        let s1 = tracker.commit(&s0, ["a", "b"]).unwrap();
        let s2 = tracker.commit(&s1, ["b", "c"]).unwrap();
        assert_eq!(s2.ids().collect::<Vec<_>>(), vec!["a", "b", "c"]);

        let reloaded = tracker.load().unwrap();
        assert_eq!(reloaded, s2);
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n != "state.json")
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn stale_base_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StateTracker::new(dir.path().join("state.json"));

        let stale = tracker.load().unwrap();
        let fresh = tracker.commit(&stale, ["a"]).unwrap();

        let err = tracker.commit(&stale, ["b"]).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(tracker.load().unwrap(), fresh);
    }

    #[test]
    fn held_lock_makes_commit_busy() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StateTracker::new(dir.path().join("state.json"));
        let base = tracker.commit(&tracker.load().unwrap(), ["a"]).unwrap();

        fs::write(tracker.lock_path(), b"").unwrap();
        let err = tracker.commit(&base, ["b"]).unwrap_err();
        assert!(matches!(err, StateError::Busy { .. }));
        assert!(err.is_retryable());
        assert_eq!(tracker.load().unwrap(), base);
    }

    #[test]
    fn stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StateTracker::new(dir.path().join("state.json"));
        let base = tracker.load().unwrap();

        let lock = fs::File::create(tracker.lock_path()).unwrap();
        let old = std::time::SystemTime::now() - STALE_LOCK * 2;
        lock.set_modified(old).unwrap();
        drop(lock);

        let s = tracker.commit(&base, ["a"]).unwrap();
        assert!(s.contains("a"));
        assert!(!tracker.lock_path().exists());
    }

    #[test]
    fn concurrent_committers_never_lose_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let tracker = StateTracker::new(&path);
                std::thread::spawn(move || {
                    let id = format!("id-{i}");
                    for _ in 0..2_000 {
                        let base = tracker.load().unwrap();
                        match tracker.commit(&base, [id.as_str()]) {
                            Ok(_) => return,
                            Err(e) if e.is_retryable() => {
                                std::thread::sleep(Duration::from_millis(1))
                            }
                            Err(e) => panic!("{e}"),
                        }
                    }
                    panic!("worker {i} never committed");
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let state = StateTracker::new(&path).load().unwrap();
        assert_eq!(state.len(), 8);
    }
}
