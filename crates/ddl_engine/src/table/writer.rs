//! Foreground row mutation that keeps index entries consistent with the
//! schema state each index and column is in.

use ddl_kv::Txn;

use super::codec::{
    decode_handle, decode_row, describe_index_values, encode_handle, encode_index_key,
    encode_row, record_key, StoredRow,
};
use crate::error::{DdlError, DdlResult};
use crate::schema::{ColumnType, Datum, Handle, IndexInfo, TableInfo};

/// Row writer bound to one table definition from a schema snapshot.
pub struct TableWriter<'a> {
    table: &'a TableInfo,
}

impl<'a> TableWriter<'a> {
    pub fn new(table: &'a TableInfo) -> Self {
        Self { table }
    }

    /// Inserts a row. `values` follow the order of the table's public columns.
    pub fn add_record(&self, txn: &mut Txn, handle: Handle, values: Vec<Datum>) -> DdlResult<()> {
        let key = record_key(self.table.id, handle);
        if txn.get(&key).is_some() {
            return Err(DdlError::DupEntry {
                index: "PRIMARY".to_string(),
                key: handle.to_string(),
            });
        }

        let public = self.table.public_columns().collect::<Vec<_>>();
        if values.len() != public.len() {
            return Err(DdlError::internal(format!(
                "column count mismatch for table '{}': expected {}, got {}",
                self.table.name,
                public.len(),
                values.len()
            )));
        }
        let mut row = StoredRow::new();
        for (column, value) in public.into_iter().zip(values) {
            self.check_value(&column.name, column.column_type, column.nullable, &value)?;
            row.insert(column.id, value);
        }
        self.fill_hidden_defaults(&mut row);

        let entries = self.checked_index_entries(txn, &row, handle)?;
        txn.set(key, encode_row(&row)?);
        for entry in entries {
            txn.set(entry, encode_handle(handle));
        }
        Ok(())
    }

    /// Applies `assignments` to public columns of an existing row.
    /// Returns `false` when the row does not exist.
    pub fn update_record(
        &self,
        txn: &mut Txn,
        handle: Handle,
        assignments: &[(&str, Datum)],
    ) -> DdlResult<bool> {
        let key = record_key(self.table.id, handle);
        let Some(raw) = txn.get(&key) else {
            return Ok(false);
        };
        let old = decode_row(&raw)?;
        let mut new = old.clone();
        for (name, value) in assignments {
            let column = self
                .table
                .find_column(name)
                .filter(|column| column.state.is_public())
                .ok_or_else(|| DdlError::BadField {
                    table: self.table.name.clone(),
                    column: name.to_string(),
                })?;
            self.check_value(&column.name, column.column_type, column.nullable, value)?;
            new.insert(column.id, value.clone());
        }
        self.fill_hidden_defaults(&mut new);

        let entries = self.checked_index_entries(txn, &new, handle)?;
        txn.set(key, encode_row(&new)?);
        for index in self.table.maintained_indices() {
            let (old_key, _) = encode_index_key(self.table, index, &old, handle)?;
            if !entries.contains(&old_key) {
                self.remove_index_entry(txn, old_key, handle);
            }
        }
        for entry in entries {
            txn.set(entry, encode_handle(handle));
        }
        Ok(true)
    }

    /// Deletes a row and every maintained index entry pointing at it.
    pub fn remove_record(&self, txn: &mut Txn, handle: Handle) -> DdlResult<bool> {
        let key = record_key(self.table.id, handle);
        let Some(raw) = txn.get(&key) else {
            return Ok(false);
        };
        let old = decode_row(&raw)?;
        txn.delete(key);
        for index in self.table.maintained_indices() {
            let (old_key, _) = encode_index_key(self.table, index, &old, handle)?;
            self.remove_index_entry(txn, old_key, handle);
        }
        Ok(true)
    }

    /// Public column values of a row.
    pub fn get_record(&self, txn: &Txn, handle: Handle) -> DdlResult<Option<Vec<Datum>>> {
        match txn.get(&record_key(self.table.id, handle)) {
            Some(raw) => Ok(Some(self.public_values(&decode_row(&raw)?))),
            None => Ok(None),
        }
    }

    pub fn public_values(&self, row: &StoredRow) -> Vec<Datum> {
        self.table
            .public_columns()
            .map(|column| row.get(&column.id).cloned().unwrap_or_else(|| column.default.clone()))
            .collect()
    }

    fn check_value(
        &self,
        column: &str,
        column_type: ColumnType,
        nullable: bool,
        value: &Datum,
    ) -> DdlResult<()> {
        if value.is_null() && !nullable {
            return Err(DdlError::internal(format!(
                "column '{column}' of table '{}' cannot be null",
                self.table.name
            )));
        }
        if !value.fits(column_type) {
            return Err(DdlError::internal(format!(
                "value {value} does not fit column '{column}' ({column_type:?})"
            )));
        }
        Ok(())
    }

    /// Columns being added or dropped receive their default once they are
    /// write-visible; delete-only columns are never written.
    fn fill_hidden_defaults(&self, row: &mut StoredRow) {
        for column in &self.table.columns {
            if column.state.is_public() {
                continue;
            }
            if column.state.maintains_writes() {
                row.entry(column.id).or_insert_with(|| column.default.clone());
            } else {
                row.remove(&column.id);
            }
        }
    }

    /// Entry keys `row` needs in every write-visible index, after checking
    /// unique ones. Nothing is written when a check fails.
    fn checked_index_entries(
        &self,
        txn: &Txn,
        row: &StoredRow,
        handle: Handle,
    ) -> DdlResult<Vec<Vec<u8>>> {
        let mut entries = Vec::new();
        for index in self.table.indices.iter() {
            if !index.state.maintains_writes() {
                continue;
            }
            let (key, distinct) = encode_index_key(self.table, index, row, handle)?;
            if distinct {
                self.check_unique(txn, index, &key, row, handle)?;
            }
            entries.push(key);
        }
        Ok(entries)
    }

    fn check_unique(
        &self,
        txn: &Txn,
        index: &IndexInfo,
        key: &[u8],
        row: &StoredRow,
        handle: Handle,
    ) -> DdlResult<()> {
        match txn.get(key).as_deref().and_then(decode_handle) {
            Some(existing) if existing != handle => Err(DdlError::DupEntry {
                index: index.name.clone(),
                key: describe_index_values(self.table, index, row),
            }),
            _ => Ok(()),
        }
    }

    /// Unique entries are only removed when they still point at `handle`.
    fn remove_index_entry(&self, txn: &mut Txn, key: Vec<u8>, handle: Handle) {
        match txn.get(&key).as_deref().and_then(decode_handle) {
            Some(existing) if existing != handle => {}
            _ => txn.delete(key),
        }
    }
}
