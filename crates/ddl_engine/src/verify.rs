//! Row/index consistency check at a single storage snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ddl_kv::{Timestamp, TxnStore};
use serde::Serialize;

use crate::error::{DdlError, DdlResult};
use crate::schema::{Handle, IndexInfo, TableInfo};
use crate::table::codec::{
    decode_handle, decode_record_key, decode_row, encode_index_key, index_prefix, record_prefix,
    scan_prefix,
};

const VERIFY_PAGE_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discrepancy {
    /// Row has no index entry.
    MissingInIndex { handle: Handle },
    /// Index entry points at a row that does not exist.
    DanglingIndexEntry { handle: Handle },
    /// More than one entry points at the same row.
    DuplicateIndexEntry { handle: Handle },
    /// Entry points at an existing row but encodes different column values.
    StaleIndexEntry { handle: Handle },
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub table: String,
    pub index: String,
    pub snapshot_ts: Timestamp,
    pub rows: usize,
    pub index_entries: usize,
    pub discrepancies: Vec<Discrepancy>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

/// Compares every row of `table` with the entries of `index`.
pub fn verify_index(
    store: &Arc<TxnStore>,
    table: &TableInfo,
    index: &IndexInfo,
) -> DdlResult<VerifyReport> {
    let txn = store.begin();

    let mut expected: BTreeMap<Handle, Vec<u8>> = BTreeMap::new();
    scan_prefix(&txn, &record_prefix(table.id), VERIFY_PAGE_SIZE, |key, value| {
        let (_, handle) = decode_record_key(key)
            .ok_or_else(|| DdlError::internal(format!("malformed row key {}", hex::encode(key))))?;
        let row = decode_row(value)?;
        let (entry_key, _) = encode_index_key(table, index, &row, handle)?;
        expected.insert(handle, entry_key);
        Ok(())
    })?;

    let mut discrepancies = Vec::new();
    let mut covered = BTreeSet::new();
    let mut index_entries = 0usize;
    scan_prefix(&txn, &index_prefix(table.id, index), VERIFY_PAGE_SIZE, |key, value| {
        index_entries += 1;
        let handle = decode_handle(value).ok_or_else(|| {
            DdlError::internal(format!("malformed index value {}", hex::encode(value)))
        })?;
        match expected.get(&handle) {
            None => discrepancies.push(Discrepancy::DanglingIndexEntry { handle }),
            Some(_) if !covered.insert(handle) => {
                discrepancies.push(Discrepancy::DuplicateIndexEntry { handle })
            }
            Some(entry_key) if entry_key.as_slice() != key => {
                discrepancies.push(Discrepancy::StaleIndexEntry { handle })
            }
            Some(_) => {}
        }
        Ok(())
    })?;
    for handle in expected.keys() {
        if !covered.contains(handle) {
            discrepancies.push(Discrepancy::MissingInIndex { handle: *handle });
        }
    }

    let report = VerifyReport {
        table: table.name.clone(),
        index: index.name.clone(),
        snapshot_ts: txn.start_ts(),
        rows: expected.len(),
        index_entries,
        discrepancies,
    };
    txn.rollback();
    if report.is_consistent() {
        tracing::debug!(
            table = %report.table,
            index = %report.index,
            rows = report.rows,
            "index consistent with table"
        );
    } else {
        tracing::warn!(
            table = %report.table,
            index = %report.index,
            rows = report.rows,
            index_entries = report.index_entries,
            discrepancies = report.discrepancies.len(),
            "index inconsistent with table"
        );
    }
    Ok(report)
}

/// Checks every public index of `table`.
pub fn verify_table(store: &Arc<TxnStore>, table: &TableInfo) -> DdlResult<Vec<VerifyReport>> {
    table
        .indices
        .iter()
        .filter(|index| index.state.is_public())
        .map(|index| verify_index(store, table, index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnInfo, ColumnType, Datum, SchemaState};
    use crate::table::codec::{encode_handle, encode_row, record_key, StoredRow};
    use crate::table::TableWriter;

    fn table() -> TableInfo {
        TableInfo {
            id: 1,
            name: "t".to_string(),
            columns: vec![ColumnInfo {
                id: 1,
                name: "c".to_string(),
                column_type: ColumnType::Int,
                nullable: true,
                default: Datum::Null,
                state: SchemaState::Public,
            }],
            indices: vec![IndexInfo {
                id: 2,
                name: "idx_c".to_string(),
                columns: vec!["c".to_string()],
                unique: false,
                state: SchemaState::Public,
            }],
            state: SchemaState::Public,
        }
    }

    #[test]
    fn consistent_table_reports_nothing() {
        let store = TxnStore::in_memory();
        let table = table();
        let mut txn = store.begin();
        for handle in 0..10 {
            TableWriter::new(&table)
                .add_record(&mut txn, handle, vec![Datum::Int(handle % 3)])
                .unwrap();
        }
        txn.commit().unwrap();

        let report = verify_index(&store, &table, &table.indices[0]).unwrap();
        assert!(report.is_consistent(), "{report:?}");
        assert_eq!(report.rows, 10);
        assert_eq!(report.index_entries, 10);
        assert_eq!(verify_table(&store, &table).unwrap().len(), 1);
    }

    #[test]
    fn every_discrepancy_kind_is_detected() {
        let store = TxnStore::in_memory();
        let table = table();
        let index = &table.indices[0];
        let row = |v| StoredRow::from([(1, Datum::Int(v))]);

        let mut txn = store.begin();
        // handle 1: row without entry
        txn.set(record_key(1, 1), encode_row(&row(10)).unwrap());
        // handle 2: entry without row
        let (key, _) = encode_index_key(&table, index, &row(20), 2).unwrap();
        txn.set(key, encode_handle(2));
        // handle 3: correct entry plus a stale extra one
        txn.set(record_key(1, 3), encode_row(&row(30)).unwrap());
        let (key, _) = encode_index_key(&table, index, &row(30), 3).unwrap();
        txn.set(key, encode_handle(3));
        let (key, _) = encode_index_key(&table, index, &row(31), 3).unwrap();
        txn.set(key, encode_handle(3));
        // handle 4: only a stale entry
        txn.set(record_key(1, 4), encode_row(&row(40)).unwrap());
        let (key, _) = encode_index_key(&table, index, &row(41), 4).unwrap();
        txn.set(key, encode_handle(4));
        txn.commit().unwrap();

        let report = verify_index(&store, &table, index).unwrap();
        let found = report.discrepancies.iter().copied().collect::<BTreeSet<_>>();
        assert!(found.contains(&Discrepancy::MissingInIndex { handle: 1 }));
        assert!(found.contains(&Discrepancy::DanglingIndexEntry { handle: 2 }));
        assert!(found.contains(&Discrepancy::DuplicateIndexEntry { handle: 3 }));
        assert!(found.contains(&Discrepancy::StaleIndexEntry { handle: 4 }));
    }
}
