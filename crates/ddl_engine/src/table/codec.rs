//! Storage layout of rows, index entries and backfill cursors.
//!
//! - row: `0x11 | table_id | handle`
//! - non-unique index entry: `0x21 | table_id | index_id | tuple | handle`
//! - unique index entry: `0x22 | table_id | index_id | tuple` (plus the
//!   handle when any key column is NULL, so NULLs never collide)
//! - backfill cursor: `0x31 | job_id | partition`
//!
//! Every index entry's value is the row handle.

use std::collections::BTreeMap;

use ddl_kv::{prefix_end, Txn};

use crate::error::{DdlError, DdlResult};
use crate::schema::{ColumnId, Datum, Handle, IndexId, IndexInfo, JobId, TableId, TableInfo};

const DATA_PREFIX_ROW: u8 = 0x11;
const DATA_PREFIX_INDEX: u8 = 0x21;
const DATA_PREFIX_INDEX_UNIQUE: u8 = 0x22;
const DATA_PREFIX_REORG_CURSOR: u8 = 0x31;
const KEY_NULL_MARKER: u8 = 0x00;
const KEY_NOT_NULL_MARKER: u8 = 0x01;
const SIGN_FLIP_MASK: u64 = 1u64 << 63;
const TEXT_TERMINATOR: u8 = 0x00;
const TEXT_ESCAPE: u8 = 0xFF;

/// Stored row: column id to value. Columns absent from the map read as
/// their default.
pub type StoredRow = BTreeMap<ColumnId, Datum>;

fn encode_i64_ordered(value: i64) -> [u8; 8] {
    (value as u64 ^ SIGN_FLIP_MASK).to_be_bytes()
}

fn decode_i64_ordered(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ SIGN_FLIP_MASK) as i64
}

fn encode_f64_ordered(value: f64) -> [u8; 8] {
    let bits = value.to_bits();
    let ordered = if value.is_sign_negative() {
        !bits
    } else {
        bits ^ SIGN_FLIP_MASK
    };
    ordered.to_be_bytes()
}

/// `0x00` bytes are escaped as `0x00 0xFF` and the value ends with
/// `0x00 0x00`, so byte order matches string order and a prefix sorts first.
fn encode_text_ordered(value: &str, out: &mut Vec<u8>) {
    for byte in value.bytes() {
        out.push(byte);
        if byte == TEXT_TERMINATOR {
            out.push(TEXT_ESCAPE);
        }
    }
    out.extend_from_slice(&[TEXT_TERMINATOR, TEXT_TERMINATOR]);
}

fn table_scoped_prefix(tag: u8, table_id: TableId) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 + 8 + 8);
    out.push(tag);
    out.extend_from_slice(&table_id.to_be_bytes());
    out
}

pub fn record_prefix(table_id: TableId) -> Vec<u8> {
    table_scoped_prefix(DATA_PREFIX_ROW, table_id)
}

pub fn record_key(table_id: TableId, handle: Handle) -> Vec<u8> {
    let mut out = record_prefix(table_id);
    out.extend_from_slice(&encode_i64_ordered(handle));
    out
}

pub fn decode_record_key(key: &[u8]) -> Option<(TableId, Handle)> {
    if key.len() != 17 || key[0] != DATA_PREFIX_ROW {
        return None;
    }
    let table_id = u64::from_be_bytes(key[1..9].try_into().ok()?);
    let handle = decode_i64_ordered(key[9..17].try_into().ok()?);
    Some((table_id, handle))
}

/// Prefix covering every entry of one index, unique or not.
pub fn index_prefix(table_id: TableId, index: &IndexInfo) -> Vec<u8> {
    index_prefix_for(table_id, index.id, index.unique)
}

pub fn index_prefix_for(table_id: TableId, index_id: IndexId, unique: bool) -> Vec<u8> {
    let tag = if unique {
        DATA_PREFIX_INDEX_UNIQUE
    } else {
        DATA_PREFIX_INDEX
    };
    let mut out = table_scoped_prefix(tag, table_id);
    out.extend_from_slice(&index_id.to_be_bytes());
    out
}

/// Key ranges holding every row and index entry of a table.
pub fn table_ranges(table_id: TableId) -> Vec<Vec<u8>> {
    vec![
        table_scoped_prefix(DATA_PREFIX_ROW, table_id),
        table_scoped_prefix(DATA_PREFIX_INDEX, table_id),
        table_scoped_prefix(DATA_PREFIX_INDEX_UNIQUE, table_id),
    ]
}

pub fn reorg_cursor_prefix(job_id: JobId) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 + 4);
    out.push(DATA_PREFIX_REORG_CURSOR);
    out.extend_from_slice(&job_id.to_be_bytes());
    out
}

pub fn reorg_cursor_key(job_id: JobId, partition: usize) -> Vec<u8> {
    let mut out = reorg_cursor_prefix(job_id);
    out.extend_from_slice(&(partition as u32).to_be_bytes());
    out
}

pub fn encode_handle(handle: Handle) -> Vec<u8> {
    encode_i64_ordered(handle).to_vec()
}

pub fn decode_handle(value: &[u8]) -> Option<Handle> {
    Some(decode_i64_ordered(value.try_into().ok()?))
}

pub fn encode_row(row: &StoredRow) -> DdlResult<Vec<u8>> {
    Ok(serde_json::to_vec(row)?)
}

pub fn decode_row(raw: &[u8]) -> DdlResult<StoredRow> {
    Ok(serde_json::from_slice(raw)?)
}

/// Value of a column in a stored row, falling back to the column default.
pub fn column_value<'a>(table: &'a TableInfo, row: &'a StoredRow, column: &str) -> DdlResult<&'a Datum> {
    let info = table.find_column(column).ok_or_else(|| DdlError::BadField {
        table: table.name.clone(),
        column: column.to_string(),
    })?;
    Ok(row.get(&info.id).unwrap_or(&info.default))
}

fn encode_index_tuple(table: &TableInfo, index: &IndexInfo, row: &StoredRow) -> DdlResult<(Vec<u8>, bool)> {
    let mut tuple = Vec::new();
    let mut any_null = false;
    for column in &index.columns {
        // Ints and floats are fixed width; text carries its own terminator.
        match column_value(table, row, column)? {
            Datum::Null => {
                tuple.push(KEY_NULL_MARKER);
                any_null = true;
            }
            Datum::Int(v) => {
                tuple.push(KEY_NOT_NULL_MARKER);
                tuple.extend_from_slice(&encode_i64_ordered(*v));
            }
            Datum::Float(v) => {
                tuple.push(KEY_NOT_NULL_MARKER);
                tuple.extend_from_slice(&encode_f64_ordered(*v));
            }
            Datum::Text(v) => {
                tuple.push(KEY_NOT_NULL_MARKER);
                encode_text_ordered(v, &mut tuple);
            }
        }
    }
    Ok((tuple, any_null))
}

/// Index entry key for `row`. The boolean is true when the key takes part in
/// uniqueness checks.
pub fn encode_index_key(
    table: &TableInfo,
    index: &IndexInfo,
    row: &StoredRow,
    handle: Handle,
) -> DdlResult<(Vec<u8>, bool)> {
    let (tuple, any_null) = encode_index_tuple(table, index, row)?;
    let mut out = index_prefix(table.id, index);
    out.extend_from_slice(&tuple);
    let distinct = index.unique && !any_null;
    if !distinct {
        out.extend_from_slice(&encode_i64_ordered(handle));
    }
    Ok((out, distinct))
}

/// Human-readable key tuple used in duplicate-entry errors.
pub fn describe_index_values(table: &TableInfo, index: &IndexInfo, row: &StoredRow) -> String {
    index
        .columns
        .iter()
        .map(|column| match column_value(table, row, column) {
            Ok(value) => value.to_string(),
            Err(_) => "?".to_string(),
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Scans every key under `prefix` page by page at the transaction snapshot.
pub fn scan_prefix(
    txn: &Txn,
    prefix: &[u8],
    page_size: usize,
    mut visit: impl FnMut(&[u8], &[u8]) -> DdlResult<()>,
) -> DdlResult<()> {
    let end = prefix_end(prefix).unwrap_or_default();
    let mut start = prefix.to_vec();
    loop {
        let page = txn.scan(&start, &end, page_size.max(1));
        let Some((last, _)) = page.last() else {
            return Ok(());
        };
        let mut next = last.clone();
        next.push(0);
        for (key, value) in &page {
            visit(key, value)?;
        }
        if page.len() < page_size.max(1) {
            return Ok(());
        }
        start = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnInfo, ColumnType, SchemaState};

    fn table() -> TableInfo {
        let column = |id, name: &str| ColumnInfo {
            id,
            name: name.to_string(),
            column_type: ColumnType::Int,
            nullable: true,
            default: Datum::Null,
            state: SchemaState::Public,
        };
        TableInfo {
            id: 3,
            name: "t".to_string(),
            columns: vec![column(1, "c1"), column(2, "c2")],
            indices: vec![
                IndexInfo {
                    id: 4,
                    name: "idx".to_string(),
                    columns: vec!["c1".to_string()],
                    unique: false,
                    state: SchemaState::Public,
                },
                IndexInfo {
                    id: 5,
                    name: "uniq".to_string(),
                    columns: vec!["c2".to_string()],
                    unique: true,
                    state: SchemaState::Public,
                },
            ],
            state: SchemaState::Public,
        }
    }

    #[test]
    fn record_keys_order_by_signed_handle() {
        assert!(record_key(1, -5) < record_key(1, 0));
        assert!(record_key(1, 0) < record_key(1, 7));
        assert_eq!(decode_record_key(&record_key(9, -42)), Some((9, -42)));
        assert!(record_key(1, i64::MAX).starts_with(&record_prefix(1)));
    }

    #[test]
    fn unique_keys_drop_the_handle_unless_null() {
        let table = table();
        let unique = &table.indices[1];
        let row = StoredRow::from([(1, Datum::Int(1)), (2, Datum::Int(8))]);
        let (a, distinct) = encode_index_key(&table, unique, &row, 1).unwrap();
        let (b, _) = encode_index_key(&table, unique, &row, 2).unwrap();
        assert!(distinct);
        assert_eq!(a, b);

        let null_row = StoredRow::from([(1, Datum::Int(1))]);
        let (a, distinct) = encode_index_key(&table, unique, &null_row, 1).unwrap();
        let (b, _) = encode_index_key(&table, unique, &null_row, 2).unwrap();
        assert!(!distinct);
        assert_ne!(a, b);
    }

    #[test]
    fn non_unique_keys_sort_by_value_then_handle() {
        let table = table();
        let index = &table.indices[0];
        let low = StoredRow::from([(1, Datum::Int(-3))]);
        let high = StoredRow::from([(1, Datum::Int(10))]);
        let (k1, _) = encode_index_key(&table, index, &low, 99).unwrap();
        let (k2, _) = encode_index_key(&table, index, &high, 1).unwrap();
        let (k3, _) = encode_index_key(&table, index, &high, 2).unwrap();
        assert!(k1 < k2 && k2 < k3);
        assert!(k1.starts_with(&index_prefix(table.id, index)));
        assert_eq!(decode_handle(&encode_handle(-77)), Some(-77));
    }

    #[test]
    fn text_keys_sort_like_strings() {
        let mut table = table();
        table.columns[0].column_type = ColumnType::Text;
        let index = &table.indices[0];
        let key = |value: &str| {
            let row = StoredRow::from([(1, Datum::Text(value.to_string()))]);
            encode_index_key(&table, index, &row, 1).unwrap().0
        };
        let values = ["", "a", "a\0", "a\0b", "a\u{1}", "ab", "b", "ba"];
        for pair in values.windows(2) {
            assert!(key(pair[0]) < key(pair[1]), "{:?} !< {:?}", pair[0], pair[1]);
        }
        // Length no longer dominates.
        assert!(key("zz") > key("aaaa"));
        let null = encode_index_key(&table, index, &StoredRow::new(), 1).unwrap().0;
        assert!(null < key(""));
    }

    #[test]
    fn paged_scan_visits_every_key_once() {
        let store = ddl_kv::TxnStore::in_memory();
        let mut txn = store.begin();
        for handle in 0..25 {
            txn.set(record_key(2, handle), b"{}".to_vec());
        }
        txn.set(record_key(3, 0), b"{}".to_vec());
        txn.commit().unwrap();

        let mut seen = Vec::new();
        scan_prefix(&store.begin(), &record_prefix(2), 4, |key, _| {
            seen.push(decode_record_key(key).unwrap().1);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, (0..25).collect::<Vec<_>>());
    }
}
