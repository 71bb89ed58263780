use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ddl::JobKind;

pub type SchemaVersion = u64;
pub type TableId = u64;
pub type IndexId = u64;
pub type ColumnId = u64;
pub type JobId = u64;
/// Row identifier shared by a table row and its index entries.
pub type Handle = i64;

/// Visibility state of one schema object during an online change.
///
/// The ordering is the add path; drop paths walk it backwards. Foreground
/// writers consult it to decide whether an object is maintained:
/// - `DeleteOnly`: removals are applied, inserts are not,
/// - `WriteOnly` / `WriteReorganization`: inserts and removals are applied,
///   reads never use the object,
/// - `Public`: fully visible.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum SchemaState {
    #[default]
    None,
    DeleteOnly,
    WriteOnly,
    WriteReorganization,
    Public,
}

impl SchemaState {
    pub fn as_str(self) -> &'static str {
        match self {
            SchemaState::None => "none",
            SchemaState::DeleteOnly => "delete only",
            SchemaState::WriteOnly => "write only",
            SchemaState::WriteReorganization => "write reorganization",
            SchemaState::Public => "public",
        }
    }

    pub fn maintains_deletes(self) -> bool {
        self >= SchemaState::DeleteOnly
    }

    pub fn maintains_writes(self) -> bool {
        self >= SchemaState::WriteOnly
    }

    pub fn is_public(self) -> bool {
        self == SchemaState::Public
    }
}

impl fmt::Display for SchemaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int,
    Float,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Datum {
    #[default]
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn fits(&self, column_type: ColumnType) -> bool {
        matches!(
            (self, column_type),
            (Datum::Null, _)
                | (Datum::Int(_), ColumnType::Int)
                | (Datum::Float(_), ColumnType::Float)
                | (Datum::Text(_), ColumnType::Text)
        )
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => f.write_str("NULL"),
            Datum::Int(v) => write!(f, "{v}"),
            Datum::Float(v) => write!(f, "{v}"),
            Datum::Text(v) => f.write_str(v),
        }
    }
}

/// Column definition supplied by CREATE TABLE / ADD COLUMN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    #[serde(default)]
    pub default: Datum,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            default: Datum::Null,
        }
    }

    pub fn with_default(mut self, default: Datum) -> Self {
        self.default = default;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub id: ColumnId,
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub default: Datum,
    pub state: SchemaState,
}

impl ColumnInfo {
    pub fn from_def(id: ColumnId, def: &ColumnDef, state: SchemaState) -> Self {
        Self {
            id,
            name: def.name.to_ascii_lowercase(),
            column_type: def.column_type,
            nullable: def.nullable,
            default: def.default.clone(),
            state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub id: IndexId,
    pub name: String,
    /// Lower-cased key column names in key order.
    pub columns: Vec<String>,
    pub unique: bool,
    pub state: SchemaState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: TableId,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub indices: Vec<IndexInfo>,
    pub state: SchemaState,
}

impl TableInfo {
    pub fn find_column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn find_column_mut(&mut self, name: &str) -> Option<&mut ColumnInfo> {
        self.columns
            .iter_mut()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn find_index(&self, name: &str) -> Option<&IndexInfo> {
        self.indices
            .iter()
            .find(|index| index.name.eq_ignore_ascii_case(name))
    }

    pub fn index_by_id(&self, index_id: IndexId) -> Option<&IndexInfo> {
        self.indices.iter().find(|index| index.id == index_id)
    }

    pub fn index_by_id_mut(&mut self, index_id: IndexId) -> Option<&mut IndexInfo> {
        self.indices.iter_mut().find(|index| index.id == index_id)
    }

    pub fn column_by_id_mut(&mut self, column_id: ColumnId) -> Option<&mut ColumnInfo> {
        self.columns.iter_mut().find(|column| column.id == column_id)
    }

    /// Columns visible to reads, in declaration order.
    pub fn public_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter().filter(|column| column.state.is_public())
    }

    /// Indexes foreground writers must keep consistent.
    pub fn maintained_indices(&self) -> impl Iterator<Item = &IndexInfo> {
        self.indices
            .iter()
            .filter(|index| index.state.maintains_deletes())
    }
}

/// Record of one committed schema-state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub version: SchemaVersion,
    pub job_id: JobId,
    pub table_id: TableId,
    pub kind: JobKind,
    /// Lower-cased name of the table/index/column that changed.
    pub object: String,
    pub from_state: SchemaState,
    pub to_state: SchemaState,
}
