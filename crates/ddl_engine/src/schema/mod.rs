//! Versioned catalog: object model, immutable snapshots and the per-node
//! version manager.

pub mod info_schema;
pub mod manager;
pub mod model;

pub use info_schema::{InfoSchema, SchemaSnapshotRecord};
pub use manager::{read_schema_version, SchemaLease, SchemaVersionManager};
pub use model::{
    ColumnDef, ColumnId, ColumnInfo, ColumnType, Datum, Handle, IndexId, IndexInfo, JobId,
    SchemaDiff, SchemaState, SchemaVersion, TableId, TableInfo,
};
