//! Foreground transactions bound to one schema snapshot.

use std::collections::BTreeSet;
use std::sync::Arc;

use ddl_kv::{prefix_end, Timestamp, Txn, TxnStore};

use crate::error::{DdlError, DdlResult};
use crate::metrics::DdlMetrics;
use crate::schema::{
    Datum, Handle, InfoSchema, SchemaVersion, SchemaVersionManager, TableId, TableInfo,
};
use crate::table::codec::{decode_record_key, decode_row, record_prefix};
use crate::table::TableWriter;

/// Row-level transaction. Every statement resolves tables in the snapshot
/// captured at `begin`; `commit` validates that snapshot against the schema
/// installed at commit time.
pub struct Transaction {
    schema: Arc<SchemaVersionManager>,
    snapshot: Arc<InfoSchema>,
    txn: Txn,
    /// Tables written by this transaction.
    related: BTreeSet<TableId>,
    metrics: Arc<DdlMetrics>,
}

impl Transaction {
    pub(crate) fn new(
        schema: Arc<SchemaVersionManager>,
        store: &Arc<TxnStore>,
        metrics: Arc<DdlMetrics>,
    ) -> Self {
        let snapshot = schema.current();
        Self {
            schema,
            snapshot,
            txn: store.begin(),
            related: BTreeSet::new(),
            metrics,
        }
    }

    pub fn schema_version(&self) -> SchemaVersion {
        self.snapshot.version()
    }

    pub fn info_schema(&self) -> &Arc<InfoSchema> {
        &self.snapshot
    }

    pub fn start_ts(&self) -> Timestamp {
        self.txn.start_ts()
    }

    pub fn insert(&mut self, table: &str, handle: Handle, values: Vec<Datum>) -> DdlResult<()> {
        let snapshot = Arc::clone(&self.snapshot);
        let table = public_table(&snapshot, table)?;
        self.related.insert(table.id);
        TableWriter::new(table).add_record(&mut self.txn, handle, values)
    }

    /// Returns `false` when the row does not exist.
    pub fn update(
        &mut self,
        table: &str,
        handle: Handle,
        assignments: &[(&str, Datum)],
    ) -> DdlResult<bool> {
        let snapshot = Arc::clone(&self.snapshot);
        let table = public_table(&snapshot, table)?;
        self.related.insert(table.id);
        TableWriter::new(table).update_record(&mut self.txn, handle, assignments)
    }

    /// Returns `false` when the row does not exist.
    pub fn delete(&mut self, table: &str, handle: Handle) -> DdlResult<bool> {
        let snapshot = Arc::clone(&self.snapshot);
        let table = public_table(&snapshot, table)?;
        self.related.insert(table.id);
        TableWriter::new(table).remove_record(&mut self.txn, handle)
    }

    pub fn get(&self, table: &str, handle: Handle) -> DdlResult<Option<Vec<Datum>>> {
        let table = public_table(&self.snapshot, table)?;
        TableWriter::new(table).get_record(&self.txn, handle)
    }

    /// Up to `limit` rows in handle order, public columns only.
    pub fn scan(&self, table: &str, limit: usize) -> DdlResult<Vec<(Handle, Vec<Datum>)>> {
        let table = public_table(&self.snapshot, table)?;
        let writer = TableWriter::new(table);
        let prefix = record_prefix(table.id);
        let end = prefix_end(&prefix).unwrap_or_default();
        self.txn
            .scan(&prefix, &end, limit)
            .into_iter()
            .map(|(key, value)| {
                let (_, handle) = decode_record_key(&key).ok_or_else(|| {
                    DdlError::internal(format!("malformed row key {}", hex::encode(&key)))
                })?;
                Ok((handle, writer.public_values(&decode_row(&value)?)))
            })
            .collect()
    }

    /// Validates the snapshot and commits while holding the commit gate, so
    /// no schema version can be acknowledged between the check and the write.
    pub fn commit(self) -> DdlResult<Timestamp> {
        let Transaction {
            schema,
            snapshot,
            txn,
            related,
            metrics,
        } = self;
        if txn.is_read_only() {
            return Ok(txn.commit()?);
        }
        let _gate = schema.commit_gate();
        schema.check_transaction_schema(snapshot.version(), &related)?;
        let commit_ts = txn.commit()?;
        metrics.record_txn_commit();
        Ok(commit_ts)
    }

    pub fn rollback(self) {
        self.txn.rollback();
    }
}

fn public_table<'a>(snapshot: &'a InfoSchema, name: &str) -> DdlResult<&'a TableInfo> {
    snapshot
        .public_table(name)
        .ok_or_else(|| DdlError::NoSuchTable(name.to_string()))
}
