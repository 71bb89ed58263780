//! Multi-version transactional key/value storage.
//!
//! `KvEngine` owns the versioned rows. `TxnStore` layers optimistic snapshot
//! transactions on top of an engine with a single timestamp oracle:
//! - a transaction reads at the last fully applied commit timestamp,
//! - commit validates write-write conflicts against that start timestamp,
//! - mutations become visible atomically when the commit timestamp publishes.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::debug;

/// Commit/read timestamp issued by the `TxnStore` oracle.
pub type Timestamp = u64;

/// One buffered write of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    /// Participates in conflict detection without changing the stored value.
    Lock { key: Vec<u8> },
}

impl Mutation {
    pub fn key(&self) -> &[u8] {
        match self {
            Mutation::Put { key, .. } | Mutation::Delete { key } | Mutation::Lock { key } => key,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("write conflict on key {key}: committed at ts={conflict_ts} after txn start ts={start_ts}")]
    WriteConflict {
        key: String,
        start_ts: Timestamp,
        conflict_ts: Timestamp,
    },
    #[error("storage temporarily unavailable: {0}")]
    Unavailable(String),
}

impl KvError {
    /// Conflicts and availability blips are resolved by running the
    /// transaction again from a fresh snapshot.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::WriteConflict { .. } | KvError::Unavailable(_))
    }
}

pub trait KvEngine: Send + Sync + 'static {
    fn get(&self, key: &[u8], ts: Timestamp) -> Option<Vec<u8>>;
    /// Returns visible rows in `[start, end)` ordered by key. An empty `end`
    /// is unbounded.
    fn scan(&self, start: &[u8], end: &[u8], ts: Timestamp, limit: usize)
        -> Vec<(Vec<u8>, Vec<u8>)>;
    /// Commit timestamp of the newest write or lock on `key`.
    fn last_write_ts(&self, key: &[u8]) -> Option<Timestamp>;
    fn apply(&self, mutations: &[Mutation], commit_ts: Timestamp);
}

#[derive(Debug, Default)]
struct KeyHistory {
    versions: Vec<VersionedValue>,
    last_write: Timestamp,
}

#[derive(Debug)]
struct VersionedValue {
    ts: Timestamp,
    /// `None` is a tombstone.
    value: Option<Vec<u8>>,
}

impl KeyHistory {
    fn visible_at(&self, ts: Timestamp) -> Option<&Vec<u8>> {
        self.versions
            .iter()
            .rev()
            .find(|version| version.ts <= ts)
            .and_then(|version| version.value.as_ref())
    }
}

/// Ordered in-memory engine. Versions are appended in commit order.
#[derive(Debug, Default)]
pub struct MemEngine {
    inner: RwLock<BTreeMap<Vec<u8>, KeyHistory>>,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvEngine for MemEngine {
    fn get(&self, key: &[u8], ts: Timestamp) -> Option<Vec<u8>> {
        let guard = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.get(key)?.visible_at(ts).cloned()
    }

    fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        ts: Timestamp,
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let guard = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end.to_vec())
        };
        let mut out = Vec::new();
        if limit == 0 {
            return out;
        }
        for (key, history) in guard.range((Bound::Included(start.to_vec()), upper)) {
            if let Some(value) = history.visible_at(ts) {
                out.push((key.clone(), value.clone()));
                if out.len() >= limit {
                    break;
                }
            }
        }
        out
    }

    fn last_write_ts(&self, key: &[u8]) -> Option<Timestamp> {
        let guard = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.get(key).map(|history| history.last_write)
    }

    fn apply(&self, mutations: &[Mutation], commit_ts: Timestamp) {
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        for mutation in mutations {
            let history = guard.entry(mutation.key().to_vec()).or_default();
            history.last_write = history.last_write.max(commit_ts);
            match mutation {
                Mutation::Put { value, .. } => history.versions.push(VersionedValue {
                    ts: commit_ts,
                    value: Some(value.clone()),
                }),
                Mutation::Delete { .. } => history.versions.push(VersionedValue {
                    ts: commit_ts,
                    value: None,
                }),
                Mutation::Lock { .. } => {}
            }
        }
    }
}

/// Snapshot-isolated transactions over a `KvEngine`.
pub struct TxnStore {
    engine: Arc<dyn KvEngine>,
    /// Last commit timestamp whose mutations are fully applied.
    applied_ts: AtomicU64,
    commit_lock: Mutex<()>,
    injected_commit_failures: AtomicUsize,
}

impl TxnStore {
    pub fn new(engine: Arc<dyn KvEngine>) -> Self {
        Self {
            engine,
            applied_ts: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
            injected_commit_failures: AtomicUsize::new(0),
        }
    }

    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::new(Arc::new(MemEngine::new())))
    }

    /// Starts a transaction reading at the newest applied commit.
    pub fn begin(self: &Arc<Self>) -> Txn {
        Txn {
            store: Arc::clone(self),
            start_ts: self.current_ts(),
            writes: BTreeMap::new(),
        }
    }

    pub fn current_ts(&self) -> Timestamp {
        self.applied_ts.load(Ordering::SeqCst)
    }

    /// Makes the next `count` commits fail with a retryable error.
    pub fn inject_commit_failures(&self, count: usize) {
        self.injected_commit_failures.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_commit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn commit_writes(
        &self,
        start_ts: Timestamp,
        writes: &BTreeMap<Vec<u8>, Mutation>,
    ) -> Result<Timestamp, KvError> {
        if self.take_injected_failure() {
            return Err(KvError::Unavailable("injected commit failure".to_string()));
        }

        let _guard = self
            .commit_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for key in writes.keys() {
            if let Some(conflict_ts) = self.engine.last_write_ts(key) {
                if conflict_ts > start_ts {
                    debug!(
                        key = %hex::encode(key),
                        start_ts,
                        conflict_ts,
                        "kv commit aborted on write conflict"
                    );
                    return Err(KvError::WriteConflict {
                        key: hex::encode(key),
                        start_ts,
                        conflict_ts,
                    });
                }
            }
        }

        let commit_ts = self.applied_ts.load(Ordering::SeqCst) + 1;
        let mutations = writes.values().cloned().collect::<Vec<_>>();
        self.engine.apply(&mutations, commit_ts);
        self.applied_ts.store(commit_ts, Ordering::SeqCst);
        Ok(commit_ts)
    }
}

/// One optimistic transaction. Writes are buffered until `commit`.
pub struct Txn {
    store: Arc<TxnStore>,
    start_ts: Timestamp,
    writes: BTreeMap<Vec<u8>, Mutation>,
}

impl Txn {
    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.writes.get(key) {
            Some(Mutation::Put { value, .. }) => Some(value.clone()),
            Some(Mutation::Delete { .. }) => None,
            Some(Mutation::Lock { .. }) | None => self.store.engine.get(key, self.start_ts),
        }
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes
            .insert(key.clone(), Mutation::Put { key, value });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key.clone(), Mutation::Delete { key });
    }

    /// Adds `key` to the conflict set without writing it.
    pub fn lock_key(&mut self, key: Vec<u8>) {
        self.writes
            .entry(key.clone())
            .or_insert(Mutation::Lock { key });
    }

    /// Scans `[start, end)` at the snapshot, overlaid with buffered writes.
    pub fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        if limit == 0 {
            return Vec::new();
        }
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end.to_vec())
        };
        let local = self
            .writes
            .range((Bound::Included(start.to_vec()), upper))
            .collect::<Vec<_>>();
        let local_deletes = local
            .iter()
            .filter(|(_, mutation)| matches!(mutation, Mutation::Delete { .. }))
            .count();

        let mut merged = self
            .store
            .engine
            .scan(start, end, self.start_ts, limit.saturating_add(local_deletes))
            .into_iter()
            .collect::<BTreeMap<_, _>>();
        for (key, mutation) in local {
            match mutation {
                Mutation::Put { value, .. } => {
                    merged.insert(key.clone(), value.clone());
                }
                Mutation::Delete { .. } => {
                    merged.remove(key);
                }
                Mutation::Lock { .. } => {}
            }
        }
        merged.into_iter().take(limit).collect()
    }

    /// Commits buffered writes. Read-only transactions return their start
    /// timestamp without touching the oracle.
    pub fn commit(self) -> Result<Timestamp, KvError> {
        if self.writes.is_empty() {
            return Ok(self.start_ts);
        }
        self.store.commit_writes(self.start_ts, &self.writes)
    }

    pub fn rollback(self) {}
}

/// Returns the smallest key greater than every key starting with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    for idx in (0..out.len()).rev() {
        if out[idx] != 0xFF {
            out[idx] = out[idx].saturating_add(1);
            out.truncate(idx + 1);
            return Some(out);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> Vec<u8> {
        raw.as_bytes().to_vec()
    }

    #[test]
    fn snapshot_never_observes_later_commits() {
        let store = TxnStore::in_memory();
        let mut writer = store.begin();
        writer.set(key("a"), b"1".to_vec());
        writer.commit().unwrap();

        let reader = store.begin();
        let mut later = store.begin();
        later.set(key("a"), b"2".to_vec());
        later.set(key("b"), b"x".to_vec());
        later.commit().unwrap();

        assert_eq!(reader.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(reader.get(b"b"), None);
        assert_eq!(reader.scan(b"", b"", 10).len(), 1);
        assert_eq!(store.begin().get(b"a"), Some(b"2".to_vec()));
    }

    #[test]
    fn concurrent_writers_on_same_key_conflict() {
        let store = TxnStore::in_memory();
        let mut first = store.begin();
        let mut second = store.begin();
        first.set(key("k"), b"first".to_vec());
        second.set(key("k"), b"second".to_vec());
        first.commit().unwrap();

        let err = second.commit().unwrap_err();
        assert!(matches!(err, KvError::WriteConflict { .. }));
        assert!(err.is_retryable());
        assert_eq!(store.begin().get(b"k"), Some(b"first".to_vec()));
    }

    #[test]
    fn lock_key_conflicts_without_changing_value() {
        let store = TxnStore::in_memory();
        let mut seed = store.begin();
        seed.set(key("row"), b"v1".to_vec());
        seed.commit().unwrap();

        let mut locker = store.begin();
        let mut updater = store.begin();
        locker.lock_key(key("row"));
        locker.set(key("idx"), b"entry".to_vec());
        locker.commit().unwrap();

        updater.set(key("row"), b"v2".to_vec());
        assert!(updater.commit().is_err());
        assert_eq!(store.begin().get(b"row"), Some(b"v1".to_vec()));
    }

    #[test]
    fn scan_overlays_buffered_writes_and_respects_limit() {
        let store = TxnStore::in_memory();
        let mut seed = store.begin();
        for name in ["a", "b", "c", "d"] {
            seed.set(key(name), name.as_bytes().to_vec());
        }
        seed.commit().unwrap();

        let mut txn = store.begin();
        txn.delete(key("a"));
        txn.delete(key("b"));
        txn.set(key("bb"), b"bb".to_vec());
        let rows = txn.scan(b"", b"", 2);
        let keys = rows.into_iter().map(|(k, _)| k).collect::<Vec<_>>();
        assert_eq!(keys, vec![key("bb"), key("c")]);

        let bounded = txn.scan(b"b", b"d", 10);
        assert_eq!(bounded.len(), 2);
    }

    #[test]
    fn injected_failures_are_retryable_and_leave_no_effects() {
        let store = TxnStore::in_memory();
        store.inject_commit_failures(1);
        let mut txn = store.begin();
        txn.set(key("k"), b"v".to_vec());
        let err = txn.commit().unwrap_err();
        assert!(matches!(err, KvError::Unavailable(_)));
        assert_eq!(store.begin().get(b"k"), None);

        let mut retry = store.begin();
        retry.set(key("k"), b"v".to_vec());
        retry.commit().unwrap();
        assert_eq!(store.begin().get(b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn prefix_end_handles_trailing_ff() {
        assert_eq!(prefix_end(&[0x01, 0xFF]), Some(vec![0x02]));
        assert_eq!(prefix_end(&[0xFF, 0xFF]), None);
    }
}
