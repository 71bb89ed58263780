//! Persisted DDL job records.

use serde::{Deserialize, Serialize};

use crate::error::{DdlError, DdlErrorCode, DdlResult};
use crate::meta_keys::now_unix_ms;
use crate::schema::{
    ColumnDef, ColumnId, ColumnInfo, Handle, IndexId, IndexInfo, JobId, SchemaState,
    SchemaVersion, TableId, TableInfo,
};

/// DDL statement as submitted by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum DdlRequest {
    CreateTable {
        table: String,
        columns: Vec<ColumnDef>,
    },
    DropTable {
        table: String,
    },
    AddIndex {
        table: String,
        index: String,
        columns: Vec<String>,
        unique: bool,
    },
    DropIndex {
        table: String,
        index: String,
    },
    AddColumn {
        table: String,
        column: ColumnDef,
    },
    DropColumn {
        table: String,
        column: String,
    },
}

impl DdlRequest {
    pub fn table_name(&self) -> &str {
        match self {
            DdlRequest::CreateTable { table, .. }
            | DdlRequest::DropTable { table }
            | DdlRequest::AddIndex { table, .. }
            | DdlRequest::DropIndex { table, .. }
            | DdlRequest::AddColumn { table, .. }
            | DdlRequest::DropColumn { table, .. } => table,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    CreateTable,
    DropTable,
    AddIndex,
    DropIndex,
    AddColumn,
    DropColumn,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::CreateTable => "create table",
            JobKind::DropTable => "drop table",
            JobKind::AddIndex => "add index",
            JobKind::DropIndex => "drop index",
            JobKind::AddColumn => "add column",
            JobKind::DropColumn => "drop column",
        }
    }

    /// Drop jobs start from `Public` and walk the state path backwards.
    pub fn is_drop(self) -> bool {
        matches!(
            self,
            JobKind::DropTable | JobKind::DropIndex | JobKind::DropColumn
        )
    }

    pub fn initial_state(self) -> SchemaState {
        if self.is_drop() {
            SchemaState::Public
        } else {
            SchemaState::None
        }
    }
}

/// Kind-specific arguments, with object ids allocated at submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobAction {
    CreateTable { table: TableInfo },
    DropTable,
    AddIndex { index: IndexInfo },
    DropIndex { index: String, index_id: IndexId },
    AddColumn { column: ColumnInfo },
    DropColumn { column: String, column_id: ColumnId },
}

impl JobAction {
    pub fn kind(&self) -> JobKind {
        match self {
            JobAction::CreateTable { .. } => JobKind::CreateTable,
            JobAction::DropTable => JobKind::DropTable,
            JobAction::AddIndex { .. } => JobKind::AddIndex,
            JobAction::DropIndex { .. } => JobKind::DropIndex,
            JobAction::AddColumn { .. } => JobKind::AddColumn,
            JobAction::DropColumn { .. } => JobKind::DropColumn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    RollingBack,
    Done,
    RollbackDone,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Done | JobState::RollbackDone | JobState::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: DdlErrorCode,
    pub message: String,
}

impl From<&DdlError> for JobError {
    fn from(err: &DdlError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Handle range `[start, end)` scanned by one backfill worker; `end: None`
/// is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRange {
    pub start: Handle,
    pub end: Option<Handle>,
}

impl HandleRange {
    pub fn contains(&self, handle: Handle) -> bool {
        handle >= self.start && self.end.map_or(true, |end| handle < end)
    }
}

/// Reorganization plan fixed when backfill starts. Progress lives in
/// per-partition cursors in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgInfo {
    pub partitions: Vec<HandleRange>,
    /// Storage timestamp the partitions were computed at.
    pub planned_at_ts: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdlJob {
    pub id: JobId,
    pub table_id: TableId,
    pub table_name: String,
    pub action: JobAction,
    pub state: JobState,
    /// State of the object being changed.
    pub schema_state: SchemaState,
    /// Every object state this job committed, in order.
    #[serde(default)]
    pub state_history: Vec<SchemaState>,
    /// Last schema version minted by this job.
    pub schema_version: SchemaVersion,
    pub error: Option<JobError>,
    pub reorg: Option<ReorgInfo>,
    /// Rows indexed by backfill.
    #[serde(default)]
    pub row_count: u64,
    #[serde(default)]
    pub cancel_requested: bool,
    pub submitted_by: u64,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
}

impl DdlJob {
    pub fn new(
        id: JobId,
        table_id: TableId,
        table_name: &str,
        action: JobAction,
        submitted_by: u64,
    ) -> Self {
        let now = now_unix_ms();
        let schema_state = action.kind().initial_state();
        Self {
            id,
            table_id,
            table_name: table_name.to_ascii_lowercase(),
            action,
            state: JobState::Queued,
            schema_state,
            state_history: vec![schema_state],
            schema_version: 0,
            error: None,
            reorg: None,
            row_count: 0,
            cancel_requested: false,
            submitted_by,
            created_at_unix_ms: now,
            updated_at_unix_ms: now,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.action.kind()
    }

    /// Lower-cased name of the object this job changes.
    pub fn object_name(&self) -> String {
        match &self.action {
            JobAction::CreateTable { .. } | JobAction::DropTable => self.table_name.clone(),
            JobAction::AddIndex { index } => index.name.to_ascii_lowercase(),
            JobAction::DropIndex { index, .. } => index.to_ascii_lowercase(),
            JobAction::AddColumn { column } => column.name.to_ascii_lowercase(),
            JobAction::DropColumn { column, .. } => column.to_ascii_lowercase(),
        }
    }

    /// Two jobs are equivalent when they change the same object the same way.
    pub fn is_equivalent(&self, kind: JobKind, table_name: &str, object: &str) -> bool {
        self.kind() == kind
            && self.table_name.eq_ignore_ascii_case(table_name)
            && self.object_name().eq_ignore_ascii_case(object)
    }

    /// Outcome seen by a waiting client once the job is terminal.
    pub fn outcome(self) -> DdlResult<DdlJob> {
        match self.state {
            JobState::Done => Ok(self),
            JobState::Cancelled => Err(DdlError::CancelledDdlJob(self.id)),
            JobState::RollbackDone
                if self
                    .error
                    .as_ref()
                    .is_some_and(|error| error.code == DdlErrorCode::CancelledDdlJob) =>
            {
                Err(DdlError::CancelledDdlJob(self.id))
            }
            JobState::RollbackDone => {
                let error = self.error.clone().unwrap_or(JobError {
                    code: DdlErrorCode::Internal,
                    message: "rolled back".to_string(),
                });
                Err(DdlError::JobFailed {
                    job_id: self.id,
                    code: error.code,
                    message: error.message,
                })
            }
            state => Err(DdlError::internal(format!(
                "ddl job {} is not finished ({state:?})",
                self.id
            ))),
        }
    }

    pub fn encode(&self) -> DdlResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(raw: &[u8]) -> DdlResult<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_index_job() -> DdlJob {
        DdlJob::new(
            7,
            3,
            "Orders",
            JobAction::AddIndex {
                index: IndexInfo {
                    id: 8,
                    name: "idx_C1".to_string(),
                    columns: vec!["c1".to_string()],
                    unique: false,
                    state: SchemaState::None,
                },
            },
            1,
        )
    }

    #[test]
    fn new_jobs_start_queued_at_the_kind_initial_state() {
        let job = add_index_job();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.schema_state, SchemaState::None);
        assert_eq!(JobKind::DropIndex.initial_state(), SchemaState::Public);
        assert!(job.is_equivalent(JobKind::AddIndex, "orders", "IDX_c1"));
        assert!(!job.is_equivalent(JobKind::DropIndex, "orders", "idx_c1"));
    }

    #[test]
    fn job_records_survive_encoding() {
        let mut job = add_index_job();
        job.reorg = Some(ReorgInfo {
            partitions: vec![HandleRange {
                start: -3,
                end: None,
            }],
            planned_at_ts: 11,
        });
        let decoded = DdlJob::decode(&job.encode().unwrap()).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn terminal_outcomes_map_to_client_errors() {
        let mut job = add_index_job();
        job.state = JobState::RollbackDone;
        job.error = Some(JobError::from(&DdlError::DupEntry {
            index: "idx_c1".into(),
            key: "4".into(),
        }));
        let err = job.clone().outcome().unwrap_err();
        assert_eq!(err.code(), DdlErrorCode::DupEntry);

        job.state = JobState::Cancelled;
        assert!(matches!(
            job.clone().outcome(),
            Err(DdlError::CancelledDdlJob(7))
        ));
        job.state = JobState::Done;
        assert!(job.outcome().is_ok());
    }

    #[test]
    fn handle_ranges_are_half_open() {
        let range = HandleRange {
            start: 0,
            end: Some(10),
        };
        assert!(range.contains(0));
        assert!(!range.contains(10));
        assert!(HandleRange { start: 5, end: None }.contains(i64::MAX));
    }
}
