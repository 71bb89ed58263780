use ddl_kv::{KvError, MetaError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::SchemaVersion;

/// Stable error identities surfaced to SQL clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DdlErrorCode {
    InfoSchemaExpired,
    InfoSchemaChanged,
    DupEntry,
    NoSuchTable,
    TableExists,
    DupKeyName,
    CantDropFieldOrKey,
    BadField,
    DupFieldName,
    DdlJobNotFound,
    CancelledDdlJob,
    DuplicateJob,
    PoolClosed,
    WriteConflict,
    StorageUnavailable,
    Internal,
}

impl DdlErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            DdlErrorCode::InfoSchemaExpired => "info_schema_expired",
            DdlErrorCode::InfoSchemaChanged => "info_schema_changed",
            DdlErrorCode::DupEntry => "dup_entry",
            DdlErrorCode::NoSuchTable => "no_such_table",
            DdlErrorCode::TableExists => "table_exists",
            DdlErrorCode::DupKeyName => "dup_key_name",
            DdlErrorCode::CantDropFieldOrKey => "cant_drop_field_or_key",
            DdlErrorCode::BadField => "bad_field",
            DdlErrorCode::DupFieldName => "dup_field_name",
            DdlErrorCode::DdlJobNotFound => "ddl_job_not_found",
            DdlErrorCode::CancelledDdlJob => "cancelled_ddl_job",
            DdlErrorCode::DuplicateJob => "duplicate_job",
            DdlErrorCode::PoolClosed => "pool_closed",
            DdlErrorCode::WriteConflict => "write_conflict",
            DdlErrorCode::StorageUnavailable => "storage_unavailable",
            DdlErrorCode::Internal => "internal",
        }
    }

    /// Numeric code carried on the wire protocol.
    pub fn sql_code(self) -> u16 {
        match self {
            DdlErrorCode::InfoSchemaExpired => 8027,
            DdlErrorCode::InfoSchemaChanged => 8028,
            DdlErrorCode::DupEntry => 1062,
            DdlErrorCode::NoSuchTable => 1146,
            DdlErrorCode::TableExists => 1050,
            DdlErrorCode::DupKeyName => 1061,
            DdlErrorCode::CantDropFieldOrKey => 1091,
            DdlErrorCode::BadField => 1054,
            DdlErrorCode::DupFieldName => 1060,
            DdlErrorCode::DdlJobNotFound => 8212,
            DdlErrorCode::CancelledDdlJob => 8214,
            DdlErrorCode::DuplicateJob => 8215,
            DdlErrorCode::PoolClosed => 8216,
            DdlErrorCode::WriteConflict => 9007,
            DdlErrorCode::StorageUnavailable => 9005,
            DdlErrorCode::Internal => 1105,
        }
    }
}

#[derive(Debug, Error)]
pub enum DdlError {
    #[error("information schema is out of date: schema failed to update within one lease")]
    InfoSchemaExpired,
    #[error("information schema is changed during the execution of the statement (started at version {start_version}, now {current_version})")]
    InfoSchemaChanged {
        start_version: SchemaVersion,
        current_version: SchemaVersion,
    },
    #[error("duplicate entry '{key}' for key '{index}'")]
    DupEntry { index: String, key: String },
    #[error("table '{0}' doesn't exist")]
    NoSuchTable(String),
    #[error("table '{0}' already exists")]
    TableExists(String),
    #[error("duplicate key name '{0}'")]
    DupKeyName(String),
    #[error("can't drop '{0}'; check that column/key exists")]
    CantDropFieldOrKey(String),
    #[error("unknown column '{column}' in '{table}'")]
    BadField { table: String, column: String },
    #[error("duplicate column name '{0}'")]
    DupFieldName(String),
    #[error("ddl job {0} not found")]
    DdlJobNotFound(u64),
    #[error("cancelled ddl job {0}")]
    CancelledDdlJob(u64),
    #[error("an equivalent ddl job {existing} is already queued for {object}")]
    DuplicateJob { existing: u64, object: String },
    #[error("session pool closed")]
    PoolClosed,
    /// Terminal error recorded on a finished job, as seen by waiters.
    #[error("ddl job {job_id} failed: {message}")]
    JobFailed {
        job_id: u64,
        code: DdlErrorCode,
        message: String,
    },
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error("{0}")]
    Internal(String),
}

impl DdlError {
    pub fn code(&self) -> DdlErrorCode {
        match self {
            DdlError::InfoSchemaExpired => DdlErrorCode::InfoSchemaExpired,
            DdlError::InfoSchemaChanged { .. } => DdlErrorCode::InfoSchemaChanged,
            DdlError::DupEntry { .. } => DdlErrorCode::DupEntry,
            DdlError::NoSuchTable(_) => DdlErrorCode::NoSuchTable,
            DdlError::TableExists(_) => DdlErrorCode::TableExists,
            DdlError::DupKeyName(_) => DdlErrorCode::DupKeyName,
            DdlError::CantDropFieldOrKey(_) => DdlErrorCode::CantDropFieldOrKey,
            DdlError::BadField { .. } => DdlErrorCode::BadField,
            DdlError::DupFieldName(_) => DdlErrorCode::DupFieldName,
            DdlError::DdlJobNotFound(_) => DdlErrorCode::DdlJobNotFound,
            DdlError::CancelledDdlJob(_) => DdlErrorCode::CancelledDdlJob,
            DdlError::DuplicateJob { .. } => DdlErrorCode::DuplicateJob,
            DdlError::PoolClosed => DdlErrorCode::PoolClosed,
            DdlError::JobFailed { code, .. } => *code,
            DdlError::Kv(KvError::WriteConflict { .. }) => DdlErrorCode::WriteConflict,
            DdlError::Kv(KvError::Unavailable(_)) => DdlErrorCode::StorageUnavailable,
            DdlError::Meta(_) => DdlErrorCode::StorageUnavailable,
            DdlError::Internal(_) => DdlErrorCode::Internal,
        }
    }

    pub fn sql_code(&self) -> u16 {
        self.code().sql_code()
    }

    /// Transient storage/coordination failures. Stale-schema errors are
    /// deliberately excluded: the caller owns that retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            DdlError::Kv(err) => err.is_retryable(),
            DdlError::Meta(err) => err.is_retryable(),
            _ => false,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        DdlError::Internal(message.into())
    }
}

impl From<serde_json::Error> for DdlError {
    fn from(err: serde_json::Error) -> Self {
        DdlError::Internal(format!("metadata codec: {err}"))
    }
}

pub type DdlResult<T> = std::result::Result<T, DdlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_codes_match_wire_protocol() {
        assert_eq!(DdlError::InfoSchemaExpired.sql_code(), 8027);
        let changed = DdlError::InfoSchemaChanged {
            start_version: 3,
            current_version: 5,
        };
        assert_eq!(changed.sql_code(), 8028);
        assert_eq!(changed.code().as_str(), "info_schema_changed");
    }

    #[test]
    fn pool_closed_message_is_stable() {
        assert_eq!(DdlError::PoolClosed.to_string(), "session pool closed");
        assert_eq!(DdlError::PoolClosed.code(), DdlErrorCode::PoolClosed);
    }

    #[test]
    fn only_storage_errors_are_retryable() {
        let conflict = DdlError::from(KvError::WriteConflict {
            key: "00".to_string(),
            start_ts: 1,
            conflict_ts: 2,
        });
        assert!(conflict.is_retryable());
        assert_eq!(conflict.sql_code(), 9007);
        assert!(DdlError::from(MetaError::Unavailable("down".into())).is_retryable());
        assert!(!DdlError::InfoSchemaExpired.is_retryable());
        assert!(!DdlError::DupEntry {
            index: "idx".into(),
            key: "1".into()
        }
        .is_retryable());
    }
}
