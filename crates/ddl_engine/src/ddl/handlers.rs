//! Per-(kind, state) planning of the next job step.
//!
//! Planning is pure: it reads the job and the owner's current schema and
//! says what the coordinator should do next. Add paths walk
//! `None -> DeleteOnly -> WriteOnly -> WriteReorganization -> Public`; drop
//! paths walk `Public -> WriteOnly -> DeleteOnly -> None` and purge storage
//! afterwards. Rolling back an add walks back through `DeleteOnly` to `None`.

use crate::error::{DdlError, DdlResult};
use crate::schema::{IndexId, IndexInfo, InfoSchema, SchemaState, TableId, TableInfo};
use crate::table::codec::{index_prefix_for, table_ranges};

use super::job::{DdlJob, JobAction, JobState};

/// Catalog change committed together with a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
    Put(TableInfo),
    Remove(TableId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Commit the object's next state under a new schema version.
    Transition {
        to: SchemaState,
        change: SchemaChange,
        finish: Option<JobState>,
    },
    /// Fix the backfill partitions before any row is read.
    PlanReorg { table: TableInfo },
    /// Index every pre-existing row, then publish the index.
    Backfill { table: TableInfo, index: IndexInfo },
    /// Delete storage of an object no node can reach any more.
    Purge {
        prefixes: Vec<Vec<u8>>,
        finish: JobState,
    },
    /// Finish without touching the schema.
    Finish(JobState),
}

/// Terminal state for a job on its current path.
fn completion(job: &DdlJob) -> JobState {
    if job.state == JobState::RollingBack {
        JobState::RollbackDone
    } else {
        JobState::Done
    }
}

/// Reaction to a pending cancel request, if the job can still honor it.
///
/// Jobs that have not changed the schema finish `Cancelled`. Adds already
/// under way roll back. Drops past `Public` cannot be cancelled.
pub fn cancel_step(job: &mut DdlJob) -> Option<Step> {
    if !job.cancel_requested || job.state != JobState::Running {
        return None;
    }
    let untouched = job.schema_state == job.kind().initial_state();
    if untouched {
        return Some(Step::Finish(JobState::Cancelled));
    }
    if !job.kind().is_drop() && job.schema_state != SchemaState::Public {
        job.state = JobState::RollingBack;
        job.error = Some((&DdlError::CancelledDdlJob(job.id)).into());
    }
    None
}

pub fn plan_step(job: &DdlJob, schema: &InfoSchema) -> DdlResult<Step> {
    match &job.action {
        JobAction::CreateTable { table } => plan_create_table(job, schema, table),
        JobAction::DropTable => plan_drop_table(job, schema),
        JobAction::AddIndex { index } => plan_add_index(job, schema, index),
        JobAction::DropIndex { index, index_id } => plan_drop_index(job, schema, index, *index_id),
        JobAction::AddColumn { column } => plan_add_column(job, schema, &column.name, column.id),
        JobAction::DropColumn { column, column_id } => {
            plan_drop_column(job, schema, column, *column_id)
        }
    }
}

fn table_for(job: &DdlJob, schema: &InfoSchema) -> DdlResult<TableInfo> {
    schema
        .table_by_id(job.table_id)
        .cloned()
        .ok_or_else(|| DdlError::NoSuchTable(job.table_name.clone()))
}

fn transition(to: SchemaState, table: TableInfo) -> Step {
    Step::Transition {
        to,
        change: SchemaChange::Put(table),
        finish: None,
    }
}

fn plan_create_table(job: &DdlJob, schema: &InfoSchema, table: &TableInfo) -> DdlResult<Step> {
    if job.state == JobState::RollingBack || job.schema_state != SchemaState::None {
        return Ok(Step::Finish(completion(job)));
    }
    if schema.table_by_name(&table.name).is_some() {
        return Err(DdlError::TableExists(table.name.clone()));
    }
    let mut created = table.clone();
    created.state = SchemaState::Public;
    Ok(Step::Transition {
        to: SchemaState::Public,
        change: SchemaChange::Put(created),
        finish: Some(JobState::Done),
    })
}

fn plan_drop_table(job: &DdlJob, schema: &InfoSchema) -> DdlResult<Step> {
    if job.state == JobState::RollingBack && job.schema_state == SchemaState::Public {
        return Ok(Step::Finish(JobState::RollbackDone));
    }
    let next = match job.schema_state {
        SchemaState::Public => SchemaState::WriteOnly,
        SchemaState::WriteOnly | SchemaState::WriteReorganization => SchemaState::DeleteOnly,
        SchemaState::DeleteOnly => {
            return Ok(Step::Transition {
                to: SchemaState::None,
                change: SchemaChange::Remove(job.table_id),
                finish: None,
            })
        }
        SchemaState::None => {
            return Ok(Step::Purge {
                prefixes: table_ranges(job.table_id),
                finish: completion(job),
            })
        }
    };
    let mut table = table_for(job, schema)?;
    if job.schema_state == SchemaState::Public && !table.state.is_public() {
        return Err(DdlError::NoSuchTable(job.table_name.clone()));
    }
    table.state = next;
    Ok(transition(next, table))
}

fn plan_add_index(job: &DdlJob, schema: &InfoSchema, index: &IndexInfo) -> DdlResult<Step> {
    if job.state == JobState::RollingBack {
        return plan_add_index_rollback(job, schema, index);
    }
    let mut table = table_for(job, schema)?;
    match job.schema_state {
        SchemaState::None => {
            if !table.state.is_public() {
                return Err(DdlError::NoSuchTable(job.table_name.clone()));
            }
            if table.find_index(&index.name).is_some() {
                return Err(DdlError::DupKeyName(index.name.clone()));
            }
            for column in &index.columns {
                if !table.find_column(column).is_some_and(|c| c.state.is_public()) {
                    return Err(DdlError::BadField {
                        table: table.name.clone(),
                        column: column.clone(),
                    });
                }
            }
            let mut added = index.clone();
            added.state = SchemaState::DeleteOnly;
            table.indices.push(added);
            Ok(transition(SchemaState::DeleteOnly, table))
        }
        SchemaState::DeleteOnly => {
            set_index_state(&mut table, index.id, SchemaState::WriteOnly)?;
            Ok(transition(SchemaState::WriteOnly, table))
        }
        SchemaState::WriteOnly => {
            set_index_state(&mut table, index.id, SchemaState::WriteReorganization)?;
            Ok(transition(SchemaState::WriteReorganization, table))
        }
        SchemaState::WriteReorganization => {
            let current = table
                .index_by_id(index.id)
                .cloned()
                .ok_or_else(|| DdlError::internal(format!("index {} vanished", index.name)))?;
            if job.reorg.is_none() {
                Ok(Step::PlanReorg { table })
            } else {
                Ok(Step::Backfill {
                    table,
                    index: current,
                })
            }
        }
        SchemaState::Public => Ok(Step::Finish(JobState::Done)),
    }
}

fn plan_add_index_rollback(job: &DdlJob, schema: &InfoSchema, index: &IndexInfo) -> DdlResult<Step> {
    match job.schema_state {
        SchemaState::WriteReorganization | SchemaState::WriteOnly => {
            let mut table = table_for(job, schema)?;
            set_index_state(&mut table, index.id, SchemaState::DeleteOnly)?;
            Ok(transition(SchemaState::DeleteOnly, table))
        }
        SchemaState::DeleteOnly => {
            let mut table = table_for(job, schema)?;
            table.indices.retain(|existing| existing.id != index.id);
            Ok(transition(SchemaState::None, table))
        }
        SchemaState::None => Ok(Step::Purge {
            prefixes: vec![
                index_prefix_for(job.table_id, index.id, index.unique),
            ],
            finish: JobState::RollbackDone,
        }),
        SchemaState::Public => Ok(Step::Finish(JobState::RollbackDone)),
    }
}

/// Marks a backfilled index public; the last transition of an add.
pub fn publish_index(mut table: TableInfo, index_id: IndexId) -> DdlResult<Step> {
    set_index_state(&mut table, index_id, SchemaState::Public)?;
    Ok(Step::Transition {
        to: SchemaState::Public,
        change: SchemaChange::Put(table),
        finish: Some(JobState::Done),
    })
}

fn plan_drop_index(
    job: &DdlJob,
    schema: &InfoSchema,
    name: &str,
    index_id: IndexId,
) -> DdlResult<Step> {
    if job.state == JobState::RollingBack && job.schema_state == SchemaState::Public {
        return Ok(Step::Finish(JobState::RollbackDone));
    }
    if job.schema_state == SchemaState::None {
        return Ok(Step::Purge {
            prefixes: vec![
                index_prefix_for(job.table_id, index_id, false),
                index_prefix_for(job.table_id, index_id, true),
            ],
            finish: completion(job),
        });
    }
    let mut table = table_for(job, schema)?;
    if table.index_by_id(index_id).is_none() {
        return Err(DdlError::CantDropFieldOrKey(name.to_string()));
    }
    match job.schema_state {
        SchemaState::Public => {
            set_index_state(&mut table, index_id, SchemaState::WriteOnly)?;
            Ok(transition(SchemaState::WriteOnly, table))
        }
        SchemaState::WriteOnly | SchemaState::WriteReorganization => {
            set_index_state(&mut table, index_id, SchemaState::DeleteOnly)?;
            Ok(transition(SchemaState::DeleteOnly, table))
        }
        _ => {
            table.indices.retain(|existing| existing.id != index_id);
            Ok(transition(SchemaState::None, table))
        }
    }
}

fn plan_add_column(
    job: &DdlJob,
    schema: &InfoSchema,
    name: &str,
    column_id: u64,
) -> DdlResult<Step> {
    if job.state == JobState::RollingBack {
        return plan_add_column_rollback(job, schema, column_id);
    }
    let mut table = table_for(job, schema)?;
    match job.schema_state {
        SchemaState::None => {
            if !table.state.is_public() {
                return Err(DdlError::NoSuchTable(job.table_name.clone()));
            }
            if table.find_column(name).is_some() {
                return Err(DdlError::DupFieldName(name.to_string()));
            }
            let JobAction::AddColumn { column } = &job.action else {
                return Err(DdlError::internal("add column job without column"));
            };
            let mut added = column.clone();
            added.state = SchemaState::DeleteOnly;
            table.columns.push(added);
            Ok(transition(SchemaState::DeleteOnly, table))
        }
        SchemaState::DeleteOnly => {
            set_column_state(&mut table, column_id, SchemaState::WriteOnly)?;
            Ok(transition(SchemaState::WriteOnly, table))
        }
        SchemaState::WriteOnly => {
            set_column_state(&mut table, column_id, SchemaState::WriteReorganization)?;
            Ok(transition(SchemaState::WriteReorganization, table))
        }
        SchemaState::WriteReorganization => {
            // Rows without the column read its default; nothing to rewrite.
            set_column_state(&mut table, column_id, SchemaState::Public)?;
            Ok(Step::Transition {
                to: SchemaState::Public,
                change: SchemaChange::Put(table),
                finish: Some(JobState::Done),
            })
        }
        SchemaState::Public => Ok(Step::Finish(JobState::Done)),
    }
}

/// A rejected add may name a table dropped by an earlier job; only the
/// intermediate states need the table.
fn plan_add_column_rollback(job: &DdlJob, schema: &InfoSchema, column_id: u64) -> DdlResult<Step> {
    match job.schema_state {
        SchemaState::WriteReorganization | SchemaState::WriteOnly => {
            let mut table = table_for(job, schema)?;
            set_column_state(&mut table, column_id, SchemaState::DeleteOnly)?;
            Ok(transition(SchemaState::DeleteOnly, table))
        }
        SchemaState::DeleteOnly => {
            let mut table = table_for(job, schema)?;
            table.columns.retain(|column| column.id != column_id);
            Ok(Step::Transition {
                to: SchemaState::None,
                change: SchemaChange::Put(table),
                finish: Some(JobState::RollbackDone),
            })
        }
        SchemaState::None | SchemaState::Public => Ok(Step::Finish(JobState::RollbackDone)),
    }
}

fn plan_drop_column(
    job: &DdlJob,
    schema: &InfoSchema,
    name: &str,
    column_id: u64,
) -> DdlResult<Step> {
    if job.state == JobState::RollingBack && job.schema_state == SchemaState::Public {
        return Ok(Step::Finish(JobState::RollbackDone));
    }
    if job.schema_state == SchemaState::None {
        return Ok(Step::Finish(completion(job)));
    }
    let mut table = table_for(job, schema)?;
    let Some(column) = table.columns.iter().find(|column| column.id == column_id) else {
        return Err(DdlError::CantDropFieldOrKey(name.to_string()));
    };
    match job.schema_state {
        SchemaState::Public => {
            let column_name = column.name.clone();
            if table
                .indices
                .iter()
                .any(|index| index.columns.iter().any(|c| c.eq_ignore_ascii_case(&column_name)))
            {
                return Err(DdlError::CantDropFieldOrKey(name.to_string()));
            }
            if table.public_columns().count() <= 1 {
                return Err(DdlError::CantDropFieldOrKey(name.to_string()));
            }
            set_column_state(&mut table, column_id, SchemaState::WriteOnly)?;
            Ok(transition(SchemaState::WriteOnly, table))
        }
        SchemaState::WriteOnly | SchemaState::WriteReorganization => {
            set_column_state(&mut table, column_id, SchemaState::DeleteOnly)?;
            Ok(transition(SchemaState::DeleteOnly, table))
        }
        _ => {
            table.columns.retain(|column| column.id != column_id);
            Ok(Step::Transition {
                to: SchemaState::None,
                change: SchemaChange::Put(table),
                finish: Some(completion(job)),
            })
        }
    }
}

fn set_index_state(table: &mut TableInfo, index_id: IndexId, state: SchemaState) -> DdlResult<()> {
    let name = table.name.clone();
    let index = table
        .index_by_id_mut(index_id)
        .ok_or_else(|| DdlError::internal(format!("index {index_id} missing from table '{name}'")))?;
    index.state = state;
    Ok(())
}

fn set_column_state(table: &mut TableInfo, column_id: u64, state: SchemaState) -> DdlResult<()> {
    let name = table.name.clone();
    let column = table
        .column_by_id_mut(column_id)
        .ok_or_else(|| DdlError::internal(format!("column {column_id} missing from table '{name}'")))?;
    column.state = state;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddl::job::ReorgInfo;
    use crate::schema::{ColumnInfo, ColumnType, Datum};

    fn base_table() -> TableInfo {
        TableInfo {
            id: 10,
            name: "t".to_string(),
            columns: vec![ColumnInfo {
                id: 11,
                name: "c1".to_string(),
                column_type: ColumnType::Int,
                nullable: true,
                default: Datum::Null,
                state: SchemaState::Public,
            }],
            indices: Vec::new(),
            state: SchemaState::Public,
        }
    }

    fn add_index_job() -> DdlJob {
        let mut job = DdlJob::new(
            1,
            10,
            "t",
            JobAction::AddIndex {
                index: IndexInfo {
                    id: 12,
                    name: "idx".to_string(),
                    columns: vec!["c1".to_string()],
                    unique: false,
                    state: SchemaState::None,
                },
            },
            1,
        );
        job.state = JobState::Running;
        job
    }

    /// Applies a planned transition to the job and schema like the owner does.
    fn apply(job: &mut DdlJob, schema: &mut InfoSchema, step: Step) {
        let Step::Transition { to, change, finish } = step else {
            panic!("expected a transition, got {step:?}");
        };
        let version = schema.version() + 1;
        *schema = match change {
            SchemaChange::Put(table) => schema.with_table(version, table),
            SchemaChange::Remove(id) => schema.without_table(version, id),
        };
        job.schema_state = to;
        job.state_history.push(to);
        if let Some(state) = finish {
            job.state = state;
        }
    }

    #[test]
    fn add_index_walks_every_state_in_order() {
        let mut schema = InfoSchema::empty().with_table(1, base_table());
        let mut job = add_index_job();
        for _ in 0..3 {
            let step = plan_step(&job, &schema).unwrap();
            apply(&mut job, &mut schema, step);
        }
        assert_eq!(
            job.state_history,
            vec![
                SchemaState::None,
                SchemaState::DeleteOnly,
                SchemaState::WriteOnly,
                SchemaState::WriteReorganization
            ]
        );
        assert!(matches!(plan_step(&job, &schema).unwrap(), Step::PlanReorg { .. }));
        job.reorg = Some(ReorgInfo {
            partitions: Vec::new(),
            planned_at_ts: 0,
        });
        let Step::Backfill { table, index } = plan_step(&job, &schema).unwrap() else {
            panic!("expected backfill");
        };
        assert_eq!(index.state, SchemaState::WriteReorganization);
        apply(&mut job, &mut schema, publish_index(table, index.id).unwrap());
        assert_eq!(job.state, JobState::Done);
        let table = schema.table_by_id(10).unwrap();
        assert_eq!(table.find_index("idx").unwrap().state, SchemaState::Public);
    }

    #[test]
    fn rollback_returns_through_delete_only_and_purges() {
        let mut schema = InfoSchema::empty().with_table(1, base_table());
        let mut job = add_index_job();
        for _ in 0..2 {
            let step = plan_step(&job, &schema).unwrap();
            apply(&mut job, &mut schema, step);
        }
        job.cancel_requested = true;
        assert!(cancel_step(&mut job).is_none());
        assert_eq!(job.state, JobState::RollingBack);

        for _ in 0..2 {
            let step = plan_step(&job, &schema).unwrap();
            apply(&mut job, &mut schema, step);
        }
        assert_eq!(job.schema_state, SchemaState::None);
        assert!(schema.table_by_id(10).unwrap().find_index("idx").is_none());
        assert!(matches!(
            plan_step(&job, &schema).unwrap(),
            Step::Purge {
                finish: JobState::RollbackDone,
                ..
            }
        ));
    }

    #[test]
    fn duplicate_index_name_is_rejected_at_start() {
        let mut table = base_table();
        table.indices.push(IndexInfo {
            id: 99,
            name: "IDX".to_string(),
            columns: vec!["c1".to_string()],
            unique: false,
            state: SchemaState::Public,
        });
        let schema = InfoSchema::empty().with_table(1, table);
        let err = plan_step(&add_index_job(), &schema).unwrap_err();
        assert!(matches!(err, DdlError::DupKeyName(_)));
    }

    #[test]
    fn add_column_on_a_dropped_table_rolls_back_without_the_table() {
        let mut job = DdlJob::new(
            2,
            10,
            "t",
            JobAction::AddColumn {
                column: ColumnInfo {
                    id: 13,
                    name: "c2".to_string(),
                    column_type: ColumnType::Int,
                    nullable: true,
                    default: Datum::Null,
                    state: SchemaState::None,
                },
            },
            1,
        );
        job.state = JobState::Running;
        let schema = InfoSchema::empty();
        let err = plan_step(&job, &schema).unwrap_err();
        assert!(matches!(err, DdlError::NoSuchTable(_)));

        job.state = JobState::RollingBack;
        job.error = Some((&err).into());
        assert_eq!(
            plan_step(&job, &schema).unwrap(),
            Step::Finish(JobState::RollbackDone)
        );
    }

    #[test]
    fn untouched_jobs_cancel_without_rollback() {
        let mut job = add_index_job();
        job.cancel_requested = true;
        assert_eq!(cancel_step(&mut job), Some(Step::Finish(JobState::Cancelled)));
        assert_eq!(job.state, JobState::Running);
    }
}
