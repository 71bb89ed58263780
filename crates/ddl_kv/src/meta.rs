//! Strongly consistent coordination store.
//!
//! The store is an ordered string-keyed map with etcd-style revisions:
//! - every successful mutation bumps one global revision,
//! - each entry remembers the revision that created and last modified it,
//! - `txn` applies a batch of puts/deletes atomically iff all compares hold.
//!
//! Watchers observe the global revision through a `tokio::sync::watch`
//! channel. When opened with a path, the full state is persisted as JSON after
//! every mutation so a restarted process resumes from the same revision.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: u64,
    pub mod_revision: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetaState {
    revision: u64,
    entries: BTreeMap<String, MetaEntry>,
}

/// Guard evaluated before a `txn` applies its operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// The key's modification revision equals `revision`; `0` means absent.
    ModRevision { key: String, revision: u64 },
}

impl Compare {
    pub fn absent(key: impl Into<String>) -> Self {
        Compare::ModRevision {
            key: key.into(),
            revision: 0,
        }
    }

    pub fn revision(key: impl Into<String>, revision: u64) -> Self {
        Compare::ModRevision {
            key: key.into(),
            revision,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl MetaOp {
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        MetaOp::Put {
            key: key.into(),
            value,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        MetaOp::Delete { key: key.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResponse {
    pub succeeded: bool,
    /// Store revision after the call.
    pub revision: u64,
}

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("coordination service unavailable: {0}")]
    Unavailable(String),
    #[error("persist coordination state: {0}")]
    Persist(String),
}

impl MetaError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, MetaError::Unavailable(_))
    }
}

pub struct MetaStore {
    state: RwLock<MetaState>,
    path: Option<PathBuf>,
    revision_tx: watch::Sender<u64>,
    injected_failures: AtomicUsize,
}

impl MetaStore {
    pub fn in_memory() -> Self {
        Self::from_state(MetaState::default(), None)
    }

    /// Loads persisted state from `path`, or initializes an empty store that
    /// persists there.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path) {
            Ok(data) => serde_json::from_slice::<MetaState>(&data)
                .with_context(|| format!("decode coordination state {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => MetaState::default(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read coordination state {}", path.display()))
            }
        };
        let store = Self::from_state(state, Some(path));
        {
            let guard = store.read_state();
            store.persist(&guard).map_err(anyhow::Error::from)?;
        }
        Ok(store)
    }

    fn from_state(state: MetaState, path: Option<PathBuf>) -> Self {
        let (revision_tx, _) = watch::channel(state.revision);
        Self {
            state: RwLock::new(state),
            path,
            revision_tx,
            injected_failures: AtomicUsize::new(0),
        }
    }

    pub fn revision(&self) -> u64 {
        self.read_state().revision
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    /// Makes the next `count` operations fail with `MetaError::Unavailable`.
    pub fn inject_failures(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Result<Option<MetaEntry>, MetaError> {
        self.check_available()?;
        Ok(self.read_state().entries.get(key).cloned())
    }

    /// Returns all entries whose key starts with `prefix`, ordered by key.
    pub fn list_prefix(&self, prefix: &str) -> Result<Vec<MetaEntry>, MetaError> {
        self.check_available()?;
        let guard = self.read_state();
        Ok(guard
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    pub fn put(&self, key: impl Into<String>, value: Vec<u8>) -> Result<u64, MetaError> {
        let response = self.txn(&[], vec![MetaOp::put(key, value)])?;
        Ok(response.revision)
    }

    pub fn delete(&self, key: impl Into<String>) -> Result<u64, MetaError> {
        let response = self.txn(&[], vec![MetaOp::delete(key)])?;
        Ok(response.revision)
    }

    pub fn txn(&self, compares: &[Compare], ops: Vec<MetaOp>) -> Result<TxnResponse, MetaError> {
        self.check_available()?;
        let mut guard = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let holds = compares.iter().all(|compare| match compare {
            Compare::ModRevision { key, revision } => {
                let current = guard.entries.get(key).map(|e| e.mod_revision).unwrap_or(0);
                current == *revision
            }
        });
        if !holds {
            return Ok(TxnResponse {
                succeeded: false,
                revision: guard.revision,
            });
        }
        if ops.is_empty() {
            return Ok(TxnResponse {
                succeeded: true,
                revision: guard.revision,
            });
        }

        // Ops apply in place; the undo log restores the previous entries if
        // the new state cannot be persisted.
        let revision = guard.revision + 1;
        let mut undo = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                MetaOp::Put { key, value } => {
                    let create_revision = guard
                        .entries
                        .get(&key)
                        .map(|e| e.create_revision)
                        .unwrap_or(revision);
                    let replaced = guard.entries.insert(
                        key.clone(),
                        MetaEntry {
                            key: key.clone(),
                            value,
                            create_revision,
                            mod_revision: revision,
                        },
                    );
                    undo.push((key, replaced));
                }
                MetaOp::Delete { key } => {
                    let replaced = guard.entries.remove(&key);
                    undo.push((key, replaced));
                }
            }
        }
        guard.revision = revision;

        if let Err(err) = self.persist(&guard) {
            for (key, replaced) in undo.into_iter().rev() {
                match replaced {
                    Some(entry) => guard.entries.insert(key, entry),
                    None => guard.entries.remove(&key),
                };
            }
            guard.revision = revision - 1;
            return Err(err);
        }
        drop(guard);
        self.revision_tx.send_replace(revision);
        Ok(TxnResponse {
            succeeded: true,
            revision,
        })
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, MetaState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), MetaError> {
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(MetaError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn persist(&self, state: &MetaState) -> Result<(), MetaError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        let data = serde_json::to_vec(state).map_err(|err| MetaError::Persist(err.to_string()))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)
            .and_then(|_| fs::rename(&tmp, path))
            .map_err(|err| MetaError::Persist(format!("{}: {err}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_applies_only_when_compares_hold() {
        let store = MetaStore::in_memory();
        let first = store
            .txn(&[Compare::absent("/a")], vec![MetaOp::put("/a", b"1".to_vec())])
            .unwrap();
        assert!(first.succeeded);

        let again = store
            .txn(&[Compare::absent("/a")], vec![MetaOp::put("/a", b"2".to_vec())])
            .unwrap();
        assert!(!again.succeeded);

        let entry = store.get("/a").unwrap().unwrap();
        assert_eq!(entry.value, b"1".to_vec());
        let swapped = store
            .txn(
                &[Compare::revision("/a", entry.mod_revision)],
                vec![MetaOp::put("/a", b"3".to_vec()), MetaOp::put("/b", b"x".to_vec())],
            )
            .unwrap();
        assert!(swapped.succeeded);
        assert_eq!(swapped.revision, entry.mod_revision + 1);

        let updated = store.get("/a").unwrap().unwrap();
        assert_eq!(updated.create_revision, entry.create_revision);
        assert_eq!(updated.mod_revision, swapped.revision);
    }

    #[test]
    fn list_prefix_is_ordered_and_bounded() {
        let store = MetaStore::in_memory();
        store.put("/job/2", vec![2]).unwrap();
        store.put("/job/1", vec![1]).unwrap();
        store.put("/jobs", vec![9]).unwrap();
        store.put("/lease/1", vec![0]).unwrap();

        let keys = store
            .list_prefix("/job/")
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["/job/1".to_string(), "/job/2".to_string()]);
    }

    #[test]
    fn watch_observes_new_revisions() {
        let store = MetaStore::in_memory();
        let rx = store.watch();
        store.put("/k", vec![1]).unwrap();
        assert_eq!(*rx.borrow(), store.revision());
    }

    #[test]
    fn injected_failures_are_retryable() {
        let store = MetaStore::in_memory();
        store.inject_failures(1);
        let err = store.put("/k", vec![1]).unwrap_err();
        assert!(err.is_retryable());
        store.put("/k", vec![1]).unwrap();
    }

    #[test]
    fn reopened_store_resumes_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let revision = {
            let store = MetaStore::open(&path).unwrap();
            store.put("/schema/version", b"7".to_vec()).unwrap();
            store.revision()
        };

        let reopened = MetaStore::open(&path).unwrap();
        assert_eq!(reopened.revision(), revision);
        assert_eq!(
            reopened.get("/schema/version").unwrap().unwrap().value,
            b"7".to_vec()
        );
    }

    #[test]
    fn failed_persist_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let store = MetaStore::open(&path).unwrap();
        store.put("/a", b"1".to_vec()).unwrap();
        let before = store.get("/a").unwrap().unwrap();
        let revision = store.revision();

        std::fs::remove_dir_all(dir.path()).unwrap();
        let err = store
            .txn(
                &[],
                vec![
                    MetaOp::put("/a", b"2".to_vec()),
                    MetaOp::delete("/a"),
                    MetaOp::put("/b", b"x".to_vec()),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, MetaError::Persist(_)));
        assert_eq!(store.revision(), revision);
        assert_eq!(*store.watch().borrow(), revision);
        assert_eq!(store.get("/a").unwrap(), Some(before));
        assert!(store.get("/b").unwrap().is_none());
    }
}
