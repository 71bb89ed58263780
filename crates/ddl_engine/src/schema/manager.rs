//! Per-node schema cache and the lease protocol that bounds its staleness.
//!
//! Design:
//! - Inputs: the committed schema version, snapshots and diffs in the
//!   coordination store.
//! - Outputs: immutable `InfoSchema` snapshots for transactions, a published
//!   lease per node, and the commit-time schema check.
//!
//! A node acknowledges a version by publishing its lease only after the
//! version is installed under the write side of the commit gate, so every
//! commit validated against an older version has already reached storage
//! when the acknowledgement becomes visible.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};

use ddl_kv::MetaStore;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::info_schema::{InfoSchema, SchemaSnapshotRecord};
use super::model::{SchemaDiff, SchemaVersion, TableId};
use crate::config::DdlConfig;
use crate::error::{DdlError, DdlResult};
use crate::meta_keys::{
    lease_key, now_unix_ms, schema_diff_key, schema_snapshot_key, LEASE_PREFIX,
    SCHEMA_VERSION_KEY,
};
use crate::metrics::DdlMetrics;

/// Lease record a node publishes after installing a schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaLease {
    pub node_id: u64,
    pub version: SchemaVersion,
    pub expires_at_unix_ms: u64,
}

struct SchemaCache {
    current: SchemaVersion,
    snapshots: BTreeMap<SchemaVersion, Arc<InfoSchema>>,
    diffs: BTreeMap<SchemaVersion, SchemaDiff>,
}

pub struct SchemaVersionManager {
    node_id: u64,
    meta: Arc<MetaStore>,
    lease: Duration,
    reload_interval: Duration,
    retention: usize,
    cache: RwLock<SchemaCache>,
    commit_gate: RwLock<()>,
    /// Start instant of the last reload whose lease was published.
    last_synced: Mutex<Option<Instant>>,
    metrics: Arc<DdlMetrics>,
}

impl SchemaVersionManager {
    pub fn new(config: &DdlConfig, meta: Arc<MetaStore>, metrics: Arc<DdlMetrics>) -> Self {
        let mut snapshots = BTreeMap::new();
        snapshots.insert(0, Arc::new(InfoSchema::empty()));
        Self {
            node_id: config.node_id,
            meta,
            lease: config.schema_lease,
            reload_interval: config.reload_interval,
            retention: config.snapshot_retention.max(2),
            cache: RwLock::new(SchemaCache {
                current: 0,
                snapshots,
                diffs: BTreeMap::new(),
            }),
            commit_gate: RwLock::new(()),
            last_synced: Mutex::new(None),
            metrics,
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn current_version(&self) -> SchemaVersion {
        self.read_cache().current
    }

    pub fn current(&self) -> Arc<InfoSchema> {
        let cache = self.read_cache();
        cache
            .snapshots
            .get(&cache.current)
            .cloned()
            .unwrap_or_else(|| Arc::new(InfoSchema::empty()))
    }

    /// Returns the snapshot at `as_of`, or the current one.
    ///
    /// Versions older than the retained window are `InfoSchemaExpired`.
    pub fn snapshot(&self, as_of: Option<SchemaVersion>) -> DdlResult<Arc<InfoSchema>> {
        let Some(version) = as_of else {
            return Ok(self.current());
        };
        if version > self.current_version() {
            self.reload()?;
        }
        let cache = self.read_cache();
        if let Some(snapshot) = cache.snapshots.get(&version) {
            return Ok(Arc::clone(snapshot));
        }
        if version > cache.current {
            return Err(DdlError::internal(format!(
                "schema version {version} is not committed yet (latest {})",
                cache.current
            )));
        }
        Err(DdlError::InfoSchemaExpired)
    }

    /// Loads any newer committed version and renews this node's lease.
    pub fn reload(&self) -> DdlResult<SchemaVersion> {
        let started = Instant::now();
        let result = self
            .load_and_install()
            .and_then(|version| self.publish_lease(version).map(|_| version));
        match result {
            Ok(version) => {
                *self
                    .last_synced
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(started);
                Ok(version)
            }
            Err(err) => {
                self.metrics.record_schema_reload_failure();
                Err(err)
            }
        }
    }

    /// Reloads when the last successful sync is older than the reload interval.
    pub fn reload_if_stale(&self) -> DdlResult<()> {
        let stale = self
            .last_synced_at()
            .map_or(true, |at| at.elapsed() >= self.reload_interval);
        if stale {
            self.reload()?;
        }
        Ok(())
    }

    /// Fails with `InfoSchemaExpired` once a full lease passed without a
    /// successful reload.
    pub fn check_lease(&self) -> DdlResult<()> {
        match self.last_synced_at() {
            Some(at) if at.elapsed() < self.lease => Ok(()),
            _ => Err(DdlError::InfoSchemaExpired),
        }
    }

    /// Read side of the commit gate. Hold it across the schema check and the
    /// storage commit.
    pub fn commit_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validates a transaction that started at `start_version` and touched
    /// `related` tables against the currently installed version.
    ///
    /// At most one intervening transition on a related table is accepted;
    /// states one step apart are mutually compatible.
    pub fn check_transaction_schema(
        &self,
        start_version: SchemaVersion,
        related: &BTreeSet<TableId>,
    ) -> DdlResult<()> {
        self.check_lease()?;
        let cache = self.read_cache();
        if start_version >= cache.current {
            return Ok(());
        }
        let changed = || DdlError::InfoSchemaChanged {
            start_version,
            current_version: cache.current,
        };

        let mut related_changes = 0usize;
        for version in (start_version + 1)..=cache.current {
            let Some(diff) = cache.diffs.get(&version) else {
                self.metrics.record_schema_check_rejection();
                return Err(changed());
            };
            if related.contains(&diff.table_id) {
                related_changes += 1;
            }
        }
        if related_changes > 1 {
            self.metrics.record_schema_check_rejection();
            tracing::debug!(
                node_id = self.node_id,
                start_version,
                current_version = cache.current,
                related_changes,
                "transaction rejected by schema check"
            );
            return Err(changed());
        }
        Ok(())
    }

    /// Diffs retained locally for versions in `(after, current]`.
    pub fn diffs_since(&self, after: SchemaVersion) -> Vec<SchemaDiff> {
        self.read_cache()
            .diffs
            .range(after + 1..)
            .map(|(_, diff)| diff.clone())
            .collect()
    }

    /// All published leases, including expired ones.
    pub fn leases(&self) -> DdlResult<Vec<SchemaLease>> {
        self.meta
            .list_prefix(LEASE_PREFIX)?
            .into_iter()
            .map(|entry| serde_json::from_slice(&entry.value).map_err(DdlError::from))
            .collect()
    }

    /// Live nodes whose lease has not acknowledged `version` yet.
    pub fn pending_nodes(&self, version: SchemaVersion) -> DdlResult<Vec<u64>> {
        let now = now_unix_ms();
        Ok(self
            .leases()?
            .into_iter()
            .filter(|lease| lease.version < version && lease.expires_at_unix_ms > now)
            .map(|lease| lease.node_id)
            .collect())
    }

    /// Waits until every live lease acknowledged `version`.
    ///
    /// Returns `false` when `timeout` elapsed first. Leases that expire drop
    /// out of the pending set on their own.
    pub async fn wait_schema_synced(
        &self,
        version: SchemaVersion,
        timeout: Duration,
    ) -> DdlResult<bool> {
        let deadline = Instant::now() + timeout;
        let poll = (self.lease / 20).clamp(Duration::from_millis(2), Duration::from_millis(50));
        loop {
            let pending = self.pending_nodes(version)?;
            if pending.is_empty() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                self.metrics.record_lease_wait_timeout();
                tracing::warn!(
                    node_id = self.node_id,
                    version,
                    pending = ?pending,
                    "timed out waiting for schema leases"
                );
                return Ok(false);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Withdraws this node's lease on shutdown.
    pub fn release_lease(&self) -> DdlResult<()> {
        *self
            .last_synced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        self.meta.delete(lease_key(self.node_id))?;
        Ok(())
    }

    pub fn spawn_reload_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.reload_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                if let Err(err) = self.reload() {
                    tracing::warn!(node_id = self.node_id, error = %err, "schema reload failed");
                }
            }
            tracing::debug!(node_id = self.node_id, "schema reload loop stopped");
        })
    }

    fn load_and_install(&self) -> DdlResult<SchemaVersion> {
        let latest = read_schema_version(&self.meta)?;
        let current = self.current_version();
        if latest <= current {
            return Ok(current);
        }

        let window_start = latest.saturating_sub(self.retention as u64 - 1);
        let first = (current + 1).max(window_start).max(1);
        let mut snapshots = Vec::new();
        let mut diffs = Vec::new();
        for version in first..=latest {
            if let Some(entry) = self.meta.get(&schema_snapshot_key(version))? {
                let record: SchemaSnapshotRecord = serde_json::from_slice(&entry.value)?;
                snapshots.push((version, Arc::new(InfoSchema::from_record(record))));
            }
            if let Some(entry) = self.meta.get(&schema_diff_key(version))? {
                let diff: SchemaDiff = serde_json::from_slice(&entry.value)?;
                diffs.push((version, diff));
            }
        }
        if snapshots.last().map(|(version, _)| *version) != Some(latest) {
            return Err(DdlError::internal(format!(
                "snapshot for schema version {latest} is missing"
            )));
        }

        {
            let _gate = self
                .commit_gate
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut cache = self
                .cache
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if latest <= cache.current {
                return Ok(cache.current);
            }
            cache.snapshots.extend(snapshots);
            cache.diffs.extend(diffs);
            cache.current = latest;
            while cache.snapshots.len() > self.retention {
                cache.snapshots.pop_first();
            }
            while cache.diffs.len() > self.retention {
                cache.diffs.pop_first();
            }
        }

        self.metrics.record_schema_reload();
        tracing::info!(
            node_id = self.node_id,
            from_version = current,
            to_version = latest,
            "installed newer schema version"
        );
        Ok(latest)
    }

    fn publish_lease(&self, version: SchemaVersion) -> DdlResult<()> {
        let lease = SchemaLease {
            node_id: self.node_id,
            version,
            expires_at_unix_ms: now_unix_ms() + self.lease.as_millis() as u64,
        };
        self.meta
            .put(lease_key(self.node_id), serde_json::to_vec(&lease)?)?;
        Ok(())
    }

    fn last_synced_at(&self) -> Option<Instant> {
        *self
            .last_synced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, SchemaCache> {
        self.cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Latest committed schema version; `0` before the first DDL.
pub fn read_schema_version(meta: &MetaStore) -> DdlResult<SchemaVersion> {
    match meta.get(SCHEMA_VERSION_KEY)? {
        Some(entry) => Ok(serde_json::from_slice(&entry.value)?),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddl::JobKind;
    use crate::schema::model::{SchemaState, TableInfo};

    fn publish(meta: &MetaStore, schema: &InfoSchema, table_id: TableId) {
        let version = schema.version();
        let diff = SchemaDiff {
            version,
            job_id: version,
            table_id,
            kind: JobKind::CreateTable,
            object: format!("t{table_id}"),
            from_state: SchemaState::None,
            to_state: SchemaState::Public,
        };
        meta.put(
            schema_snapshot_key(version),
            serde_json::to_vec(&schema.to_record()).unwrap(),
        )
        .unwrap();
        meta.put(schema_diff_key(version), serde_json::to_vec(&diff).unwrap())
            .unwrap();
        meta.put(SCHEMA_VERSION_KEY, serde_json::to_vec(&version).unwrap())
            .unwrap();
    }

    fn table(id: TableId) -> TableInfo {
        TableInfo {
            id,
            name: format!("t{id}"),
            columns: Vec::new(),
            indices: Vec::new(),
            state: SchemaState::Public,
        }
    }

    fn manager(meta: &Arc<MetaStore>, node_id: u64, retention: usize) -> SchemaVersionManager {
        let mut cfg = DdlConfig::for_tests(node_id);
        cfg.snapshot_retention = retention;
        SchemaVersionManager::new(&cfg, Arc::clone(meta), Arc::new(DdlMetrics::default()))
    }

    #[test]
    fn reload_installs_latest_and_publishes_lease() {
        let meta = Arc::new(MetaStore::in_memory());
        let mgr = manager(&meta, 1, 16);
        assert!(matches!(mgr.check_lease(), Err(DdlError::InfoSchemaExpired)));

        let v1 = InfoSchema::empty().with_table(1, table(10));
        publish(&meta, &v1, 10);
        assert_eq!(mgr.reload().unwrap(), 1);
        assert!(mgr.check_lease().is_ok());
        assert!(mgr.current().table_by_id(10).is_some());

        let leases = mgr.leases().unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].version, 1);
    }

    #[test]
    fn at_most_one_related_transition_is_tolerated() {
        let meta = Arc::new(MetaStore::in_memory());
        let mgr = manager(&meta, 1, 16);
        let v1 = InfoSchema::empty().with_table(1, table(5));
        publish(&meta, &v1, 5);
        let v2 = v1.with_table(2, table(6));
        publish(&meta, &v2, 6);
        let v3 = v2.with_table(3, table(5));
        publish(&meta, &v3, 5);
        mgr.reload().unwrap();

        let only_six = BTreeSet::from([6]);
        assert!(mgr.check_transaction_schema(1, &only_six).is_ok());
        let five = BTreeSet::from([5]);
        assert!(mgr.check_transaction_schema(2, &five).is_ok());
        let both = BTreeSet::from([5, 6]);
        let err = mgr.check_transaction_schema(1, &both).unwrap_err();
        assert!(matches!(
            err,
            DdlError::InfoSchemaChanged {
                start_version: 1,
                current_version: 3
            }
        ));
        assert!(mgr.check_transaction_schema(0, &five).is_err());
    }

    #[test]
    fn snapshots_outside_retention_are_expired() {
        let meta = Arc::new(MetaStore::in_memory());
        let mgr = manager(&meta, 1, 2);
        let mut schema = InfoSchema::empty();
        for version in 1..=4 {
            schema = schema.with_table(version, table(version));
            publish(&meta, &schema, version);
        }
        mgr.reload().unwrap();
        assert!(matches!(mgr.snapshot(Some(1)), Err(DdlError::InfoSchemaExpired)));
        assert_eq!(mgr.snapshot(Some(3)).unwrap().version(), 3);
        assert_eq!(mgr.snapshot(None).unwrap().version(), 4);
        assert!(mgr.snapshot(Some(9)).is_err());
    }

    #[test]
    fn lease_lapses_without_reload() {
        let meta = Arc::new(MetaStore::in_memory());
        let mut cfg = DdlConfig::for_tests(1);
        cfg.schema_lease = Duration::from_millis(30);
        let mgr = SchemaVersionManager::new(&cfg, meta, Arc::new(DdlMetrics::default()));
        mgr.reload().unwrap();
        assert!(mgr.check_lease().is_ok());
        std::thread::sleep(Duration::from_millis(50));
        assert!(matches!(mgr.check_lease(), Err(DdlError::InfoSchemaExpired)));
        let err = mgr
            .check_transaction_schema(0, &BTreeSet::new())
            .unwrap_err();
        assert_eq!(err.sql_code(), 8027);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_for_sync_tracks_every_live_lease() -> anyhow::Result<()> {
        let meta = Arc::new(MetaStore::in_memory());
        let first = manager(&meta, 1, 16);
        let second = manager(&meta, 2, 16);
        first.reload()?;
        second.reload()?;

        let v1 = InfoSchema::empty().with_table(1, table(1));
        publish(&meta, &v1, 1);
        first.reload()?;
        assert_eq!(first.pending_nodes(1)?, vec![2]);
        assert!(!first.wait_schema_synced(1, Duration::from_millis(40)).await?);

        second.reload()?;
        assert!(first.wait_schema_synced(1, Duration::from_millis(40)).await?);

        second.release_lease()?;
        assert_eq!(first.leases()?.len(), 1);
        Ok(())
    }
}
