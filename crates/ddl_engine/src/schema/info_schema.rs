use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::model::{IndexId, IndexInfo, SchemaVersion, TableId, TableInfo};

/// Immutable catalog snapshot at one schema version.
///
/// Readers hold an `Arc<InfoSchema>` for the whole transaction; new versions
/// are built with `with_table` / `without_table` and never mutate in place.
#[derive(Debug, Clone, Default)]
pub struct InfoSchema {
    version: SchemaVersion,
    tables: BTreeMap<TableId, TableInfo>,
    by_name: BTreeMap<String, TableId>,
    index_owner: BTreeMap<IndexId, TableId>,
}

/// Persisted form of an `InfoSchema`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshotRecord {
    pub version: SchemaVersion,
    pub tables: Vec<TableInfo>,
}

impl InfoSchema {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_record(record: SchemaSnapshotRecord) -> Self {
        Self::from_tables(record.version, record.tables)
    }

    pub fn to_record(&self) -> SchemaSnapshotRecord {
        SchemaSnapshotRecord {
            version: self.version,
            tables: self.tables.values().cloned().collect(),
        }
    }

    fn from_tables(version: SchemaVersion, tables: impl IntoIterator<Item = TableInfo>) -> Self {
        let mut out = Self {
            version,
            ..Self::default()
        };
        for table in tables {
            out.by_name.insert(table.name.to_ascii_lowercase(), table.id);
            for index in &table.indices {
                out.index_owner.insert(index.id, table.id);
            }
            out.tables.insert(table.id, table);
        }
        out
    }

    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables.values()
    }

    /// Looks up a table in any state by name.
    pub fn table_by_name(&self, name: &str) -> Option<&TableInfo> {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .and_then(|id| self.tables.get(id))
    }

    /// Looks up a table visible to foreground statements.
    pub fn public_table(&self, name: &str) -> Option<&TableInfo> {
        self.table_by_name(name)
            .filter(|table| table.state.is_public())
    }

    pub fn table_by_id(&self, table_id: TableId) -> Option<&TableInfo> {
        self.tables.get(&table_id)
    }

    pub fn table_of_index(&self, index_id: IndexId) -> Option<(&TableInfo, &IndexInfo)> {
        let table = self.tables.get(self.index_owner.get(&index_id)?)?;
        let index = table.index_by_id(index_id)?;
        Some((table, index))
    }

    /// Builds the next version with `table` inserted or replaced.
    pub fn with_table(&self, version: SchemaVersion, table: TableInfo) -> Self {
        let mut tables = self.tables.clone();
        tables.insert(table.id, table);
        Self::from_tables(version, tables.into_values())
    }

    /// Builds the next version with `table_id` removed.
    pub fn without_table(&self, version: SchemaVersion, table_id: TableId) -> Self {
        let mut tables = self.tables.clone();
        tables.remove(&table_id);
        Self::from_tables(version, tables.into_values())
    }

    /// Same tables, new version number; for transitions that only touch job state.
    pub fn bumped(&self, version: SchemaVersion) -> Self {
        Self::from_tables(version, self.tables.values().cloned())
    }
}
