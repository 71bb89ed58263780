//! Durable DDL job queue and the owner loop that drives it.
//!
//! Design:
//! - Any node submits jobs; the queue, the id counter and every schema
//!   version live in the coordination store and change only through
//!   compare-and-swap transactions.
//! - Only the elected owner executes jobs. It takes the oldest queued job,
//!   plans one step from the job's persisted state, and commits the result
//!   together with the next schema version. Every owner write is fenced on
//!   the ownership epoch.
//! - After each version the owner waits until every live lease acknowledged
//!   it, so no two nodes ever run more than one state apart.
//!
//! A job whose last transition is committed stays in the queue with its
//! terminal state until that version is synced, then moves to history.
//! Waiters only look at history, so `execute` returns after the whole
//! cluster runs the final schema.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ddl_kv::{prefix_end, Compare, MetaOp, MetaStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::backfill::{clear_cursors, plan_reorg, run_backfill, BackfillContext};
use super::handlers::{cancel_step, plan_step, publish_index, SchemaChange, Step};
use super::job::{DdlJob, DdlRequest, JobAction, JobKind, JobState};
use super::owner::{OwnerManager, OwnerToken};
use crate::config::DdlConfig;
use crate::error::{DdlError, DdlResult};
use crate::meta_keys::{
    job_history_key, job_queue_key, now_unix_ms, schema_diff_key, schema_snapshot_key,
    GLOBAL_ID_KEY, JOB_QUEUE_PREFIX, SCHEMA_VERSION_KEY,
};
use crate::metrics::DdlMetrics;
use crate::schema::{
    read_schema_version, ColumnDef, ColumnInfo, IndexInfo, InfoSchema, JobId, SchemaDiff,
    SchemaState, SchemaVersion, SchemaVersionManager, TableInfo,
};
use crate::table::codec::reorg_cursor_prefix;

const PURGE_BATCH_SIZE: usize = 256;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct DdlCoordinator {
    config: DdlConfig,
    meta: Arc<MetaStore>,
    schema: Arc<SchemaVersionManager>,
    owner: Arc<OwnerManager>,
    backfill: Arc<BackfillContext>,
    metrics: Arc<DdlMetrics>,
    /// Consecutive transient failures per job, reset on progress.
    retries: Mutex<HashMap<JobId, usize>>,
}

impl DdlCoordinator {
    pub fn new(
        config: DdlConfig,
        meta: Arc<MetaStore>,
        schema: Arc<SchemaVersionManager>,
        owner: Arc<OwnerManager>,
        backfill: Arc<BackfillContext>,
        metrics: Arc<DdlMetrics>,
    ) -> Self {
        Self {
            config,
            meta,
            schema,
            owner,
            backfill,
            metrics,
            retries: Mutex::new(HashMap::new()),
        }
    }

    pub fn owner(&self) -> &Arc<OwnerManager> {
        &self.owner
    }

    /// Validates `request` against the current schema, allocates its ids and
    /// enqueues it. Returns as soon as the job is durable.
    pub fn submit(&self, request: DdlRequest) -> DdlResult<JobId> {
        if let Err(err) = self.schema.reload_if_stale() {
            tracing::debug!(error = %err, "submitting against cached schema");
        }
        let schema = self.schema.current();
        loop {
            let counter = self.meta.get(GLOBAL_ID_KEY)?;
            let counter_revision = counter.as_ref().map_or(0, |entry| entry.mod_revision);
            let last_id: u64 = match &counter {
                Some(entry) => serde_json::from_slice(&entry.value)?,
                None => 0,
            };

            let mut ids = IdAllocator { next: last_id + 1 };
            let job = build_job(&request, &schema, &mut ids, self.config.node_id)?;
            let object = job.object_name();
            if let Some(existing) = self
                .list_queue()?
                .into_iter()
                .find(|queued| queued.is_equivalent(job.kind(), &job.table_name, &object))
            {
                return Err(DdlError::DuplicateJob {
                    existing: existing.id,
                    object: format!("{}.{}", job.table_name, object),
                });
            }

            let response = self.meta.txn(
                &[Compare::revision(GLOBAL_ID_KEY, counter_revision)],
                vec![
                    MetaOp::put(GLOBAL_ID_KEY, serde_json::to_vec(&(ids.next - 1))?),
                    MetaOp::put(job_queue_key(job.id), job.encode()?),
                ],
            )?;
            if response.succeeded {
                self.metrics.record_job_submitted();
                tracing::info!(
                    job_id = job.id,
                    kind = job.kind().as_str(),
                    table = %job.table_name,
                    object = %object,
                    "queued ddl job"
                );
                return Ok(job.id);
            }
        }
    }

    /// Submits `request` and blocks until it finished.
    pub async fn execute(&self, request: DdlRequest) -> DdlResult<DdlJob> {
        let job_id = self.submit(request)?;
        self.wait_job(job_id).await
    }

    /// Blocks until `job_id` reached history and maps its final state to the
    /// client-visible outcome.
    pub async fn wait_job(&self, job_id: JobId) -> DdlResult<DdlJob> {
        let mut changes = self.meta.watch();
        loop {
            match self.find_finished(job_id) {
                Ok(Some(job)) => return job.outcome(),
                Ok(None) => {}
                Err(err) if err.is_retryable() => {
                    tracing::debug!(job_id, error = %err, "retrying ddl job lookup");
                }
                Err(err) => return Err(err),
            }
            let _ = tokio::time::timeout(WAIT_POLL_INTERVAL, changes.changed()).await;
        }
    }

    fn find_finished(&self, job_id: JobId) -> DdlResult<Option<DdlJob>> {
        if let Some(job) = self.job_history(job_id)? {
            return Ok(Some(job));
        }
        if self.meta.get(&job_queue_key(job_id))?.is_some() {
            return Ok(None);
        }
        // The job may have moved to history between the two reads.
        match self.job_history(job_id)? {
            Some(job) => Ok(Some(job)),
            None => Err(DdlError::DdlJobNotFound(job_id)),
        }
    }

    /// Requests cancellation of a queued or running job. The owner decides
    /// whether it ends `Cancelled`, rolls back, or runs to completion.
    pub fn cancel_job(&self, job_id: JobId) -> DdlResult<()> {
        let key = job_queue_key(job_id);
        loop {
            let Some(entry) = self.meta.get(&key)? else {
                return Err(DdlError::DdlJobNotFound(job_id));
            };
            let mut job = DdlJob::decode(&entry.value)?;
            if job.cancel_requested || job.state.is_terminal() {
                return Ok(());
            }
            job.cancel_requested = true;
            job.updated_at_unix_ms = now_unix_ms();
            let response = self.meta.txn(
                &[Compare::revision(key.clone(), entry.mod_revision)],
                vec![MetaOp::put(key.clone(), job.encode()?)],
            )?;
            if response.succeeded {
                tracing::info!(job_id, state = ?job.state, "cancel requested for ddl job");
                return Ok(());
            }
        }
    }

    /// Finished job record, if `job_id` finished.
    pub fn job_history(&self, job_id: JobId) -> DdlResult<Option<DdlJob>> {
        match self.meta.get(&job_history_key(job_id))? {
            Some(entry) => Ok(Some(DdlJob::decode(&entry.value)?)),
            None => Ok(None),
        }
    }

    /// Jobs not yet in history, oldest first.
    pub fn list_queue(&self) -> DdlResult<Vec<DdlJob>> {
        self.meta
            .list_prefix(JOB_QUEUE_PREFIX)?
            .iter()
            .map(|entry| DdlJob::decode(&entry.value))
            .collect()
    }

    /// Queued or finished record of `job_id`.
    pub fn get_job(&self, job_id: JobId) -> DdlResult<DdlJob> {
        if let Some(entry) = self.meta.get(&job_queue_key(job_id))? {
            return DdlJob::decode(&entry.value);
        }
        self.job_history(job_id)?
            .ok_or(DdlError::DdlJobNotFound(job_id))
    }

    pub fn spawn_owner_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let idle = self.config.reload_interval.max(Duration::from_millis(5));
            let mut changes = self.meta.watch();
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let worked = tokio::select! {
                    result = self.run_owner_step() => match result {
                        Ok(worked) => worked,
                        Err(err) => {
                            tracing::warn!(node_id = self.config.node_id, error = %err, "ddl owner step failed");
                            false
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                };
                if worked {
                    tokio::task::yield_now().await;
                    continue;
                }
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    _ = changes.changed() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(node_id = self.config.node_id, "ddl owner loop stopped");
        })
    }

    /// Advances the oldest queued job by one step when this node owns the
    /// queue. Returns whether any job was touched.
    pub async fn run_owner_step(&self) -> DdlResult<bool> {
        let Some(token) = self.owner.current_token() else {
            return Ok(false);
        };
        let Some(entry) = self.meta.list_prefix(JOB_QUEUE_PREFIX)?.into_iter().next() else {
            return Ok(false);
        };
        let job = DdlJob::decode(&entry.value)?;

        // A previous owner may have stopped between commit and sync.
        let version = self.schema.reload()?;
        self.wait_synced(version).await?;
        let schema = self.schema.current();

        self.step_job(token, job, entry.mod_revision, &schema).await
    }

    async fn step_job(
        &self,
        token: OwnerToken,
        mut job: DdlJob,
        job_revision: u64,
        schema: &InfoSchema,
    ) -> DdlResult<bool> {
        if job.state.is_terminal() {
            self.finish_job(token, &job, job_revision)?;
            return Ok(true);
        }
        if job.state == JobState::Queued {
            job.state = JobState::Running;
            tracing::info!(
                job_id = job.id,
                kind = job.kind().as_str(),
                table = %job.table_name,
                "running ddl job"
            );
        }

        let planned = match cancel_step(&mut job) {
            Some(step) => Ok(step),
            None => plan_step(&job, schema),
        };
        let result = match planned {
            Ok(step) => self.apply_step(token, &mut job, job_revision, schema, step).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                self.retries_guard().remove(&job.id);
                Ok(true)
            }
            Err(err) => self.handle_step_error(token, job, job_revision, err).await,
        }
    }

    async fn apply_step(
        &self,
        token: OwnerToken,
        job: &mut DdlJob,
        job_revision: u64,
        schema: &InfoSchema,
        step: Step,
    ) -> DdlResult<()> {
        match step {
            Step::Transition { to, change, finish } => {
                if let Some(version) =
                    self.commit_transition(token, job, job_revision, schema, to, change, finish)?
                {
                    self.after_commit(version).await?;
                }
                Ok(())
            }
            Step::PlanReorg { table } => {
                job.reorg = Some(plan_reorg(
                    &self.backfill.store,
                    &table,
                    self.config.backfill_workers,
                )?);
                self.persist_job(token, job, job_revision)
            }
            Step::Backfill { table, index } => {
                let reorg = job
                    .reorg
                    .clone()
                    .ok_or_else(|| DdlError::internal(format!("ddl job {} has no reorg plan", job.id)))?;
                let rows =
                    run_backfill(Arc::clone(&self.backfill), job.id, &table, &index, &reorg).await?;
                job.row_count += rows;
                let Step::Transition { to, change, finish } = publish_index(table, index.id)? else {
                    return Err(DdlError::internal("publishing an index must be a transition"));
                };
                if let Some(version) =
                    self.commit_transition(token, job, job_revision, schema, to, change, finish)?
                {
                    if let Err(err) =
                        clear_cursors(&self.backfill.store, job.id, reorg.partitions.len())
                    {
                        tracing::warn!(job_id = job.id, error = %err, "failed to clear backfill cursors");
                    }
                    self.after_commit(version).await?;
                }
                Ok(())
            }
            Step::Purge { prefixes, finish } => {
                let deleted = self.purge(job.id, &prefixes)?;
                tracing::info!(job_id = job.id, deleted, "purged storage of ddl job");
                job.state = finish;
                self.finish_job(token, job, job_revision)
            }
            Step::Finish(state) => {
                job.state = state;
                self.finish_job(token, job, job_revision)
            }
        }
    }

    /// Commits the next schema version together with the job's new state.
    /// Returns `None` when a concurrent change won; the caller re-plans.
    #[allow(clippy::too_many_arguments)]
    fn commit_transition(
        &self,
        token: OwnerToken,
        job: &mut DdlJob,
        job_revision: u64,
        schema: &InfoSchema,
        to: SchemaState,
        change: SchemaChange,
        finish: Option<JobState>,
    ) -> DdlResult<Option<SchemaVersion>> {
        let version_revision = self
            .meta
            .get(SCHEMA_VERSION_KEY)?
            .map_or(0, |entry| entry.mod_revision);
        let latest = read_schema_version(&self.meta)?;
        if latest != schema.version() {
            tracing::debug!(
                job_id = job.id,
                planned_at = schema.version(),
                latest,
                "schema moved while planning, re-planning"
            );
            return Ok(None);
        }
        let version = latest + 1;
        let next_schema = match &change {
            SchemaChange::Put(table) => schema.with_table(version, table.clone()),
            SchemaChange::Remove(table_id) => schema.without_table(version, *table_id),
        };
        let diff = SchemaDiff {
            version,
            job_id: job.id,
            table_id: job.table_id,
            kind: job.kind(),
            object: job.object_name(),
            from_state: job.schema_state,
            to_state: to,
        };

        let mut next_job = job.clone();
        next_job.schema_state = to;
        next_job.state_history.push(to);
        next_job.schema_version = version;
        next_job.updated_at_unix_ms = now_unix_ms();
        if let Some(state) = finish {
            next_job.state = state;
        }

        let mut ops = vec![
            MetaOp::put(SCHEMA_VERSION_KEY, serde_json::to_vec(&version)?),
            MetaOp::put(
                schema_snapshot_key(version),
                serde_json::to_vec(&next_schema.to_record())?,
            ),
            MetaOp::put(schema_diff_key(version), serde_json::to_vec(&diff)?),
            MetaOp::put(job_queue_key(job.id), next_job.encode()?),
        ];
        let retention = self.config.snapshot_retention.max(2) as u64;
        if version > retention {
            ops.push(MetaOp::delete(schema_snapshot_key(version - retention)));
            ops.push(MetaOp::delete(schema_diff_key(version - retention)));
        }
        let response = self.meta.txn(
            &[
                Compare::revision(SCHEMA_VERSION_KEY, version_revision),
                Compare::revision(job_queue_key(job.id), job_revision),
                token.fence(),
            ],
            ops,
        )?;
        if !response.succeeded {
            self.on_fenced_write(token)?;
            return Ok(None);
        }

        self.metrics.record_state_transition();
        tracing::info!(
            job_id = job.id,
            kind = job.kind().as_str(),
            object = %diff.object,
            from = %diff.from_state,
            to = %diff.to_state,
            version,
            "committed schema state transition"
        );
        *job = next_job;
        Ok(Some(version))
    }

    async fn after_commit(&self, version: SchemaVersion) -> DdlResult<()> {
        if let Err(err) = self.schema.reload() {
            tracing::warn!(version, error = %err, "owner failed to load its own schema version");
        }
        self.wait_synced(version).await
    }

    async fn wait_synced(&self, version: SchemaVersion) -> DdlResult<()> {
        let synced = self
            .schema
            .wait_schema_synced(version, self.config.lease_wait_timeout)
            .await?;
        if !synced {
            tracing::warn!(version, "proceeding after lease wait timeout");
        }
        Ok(())
    }

    /// Rewrites the queued job without a schema change.
    fn persist_job(&self, token: OwnerToken, job: &mut DdlJob, job_revision: u64) -> DdlResult<()> {
        job.updated_at_unix_ms = now_unix_ms();
        let key = job_queue_key(job.id);
        let response = self.meta.txn(
            &[Compare::revision(key.clone(), job_revision), token.fence()],
            vec![MetaOp::put(key, job.encode()?)],
        )?;
        if !response.succeeded {
            self.on_fenced_write(token)?;
        }
        Ok(())
    }

    /// Moves a terminal job from the queue to history.
    fn finish_job(&self, token: OwnerToken, job: &DdlJob, job_revision: u64) -> DdlResult<()> {
        let mut finished = job.clone();
        finished.updated_at_unix_ms = now_unix_ms();
        let key = job_queue_key(job.id);
        let response = self.meta.txn(
            &[Compare::revision(key.clone(), job_revision), token.fence()],
            vec![
                MetaOp::delete(key),
                MetaOp::put(job_history_key(job.id), finished.encode()?),
            ],
        )?;
        if !response.succeeded {
            self.on_fenced_write(token)?;
            return Ok(());
        }

        self.retries_guard().remove(&job.id);
        match finished.state {
            JobState::Done => self.metrics.record_job_done(),
            _ => self.metrics.record_job_rolled_back(),
        }
        tracing::info!(
            job_id = job.id,
            kind = job.kind().as_str(),
            table = %job.table_name,
            state = ?finished.state,
            error = finished.error.as_ref().map(|err| err.message.as_str()),
            "finished ddl job"
        );
        Ok(())
    }

    /// Transient errors retry the phase with backoff; anything else records
    /// the error and turns the job around. A rollback is never abandoned.
    async fn handle_step_error(
        &self,
        token: OwnerToken,
        mut job: DdlJob,
        job_revision: u64,
        err: DdlError,
    ) -> DdlResult<bool> {
        if self.backfill.is_halted() {
            return Ok(false);
        }
        let rolling_back = job.state == JobState::RollingBack;
        if err.is_retryable() || rolling_back {
            let attempt = {
                let mut retries = self.retries_guard();
                let attempt = retries.entry(job.id).or_insert(0);
                *attempt += 1;
                *attempt
            };
            if rolling_back || attempt <= self.config.max_phase_retries {
                self.metrics.record_phase_retry();
                tracing::warn!(
                    job_id = job.id,
                    state = ?job.state,
                    schema_state = %job.schema_state,
                    attempt,
                    error = %err,
                    "ddl job step failed, retrying"
                );
                tokio::time::sleep(self.config.retry_delay(attempt)).await;
                return Ok(true);
            }
        }

        self.retries_guard().remove(&job.id);
        tracing::warn!(
            job_id = job.id,
            kind = job.kind().as_str(),
            schema_state = %job.schema_state,
            error = %err,
            "ddl job failed, rolling back"
        );
        job.state = JobState::RollingBack;
        job.error = Some((&err).into());
        self.persist_job(token, &mut job, job_revision)?;
        Ok(true)
    }

    fn on_fenced_write(&self, token: OwnerToken) -> DdlResult<()> {
        if !self.owner.check_fence(token)? {
            self.owner.forget(token);
        }
        Ok(())
    }

    /// Deletes every key under `prefixes` plus the job's backfill cursors in
    /// bounded batches.
    fn purge(&self, job_id: JobId, prefixes: &[Vec<u8>]) -> DdlResult<u64> {
        let session = self.backfill.pool.get()?;
        session.set_statement(Some(format!("purge storage of ddl job {job_id}")));
        let mut deleted = 0u64;
        let mut ranges = prefixes.to_vec();
        ranges.push(reorg_cursor_prefix(job_id));
        for prefix in &ranges {
            let end = prefix_end(prefix).unwrap_or_default();
            loop {
                let mut txn = session.begin();
                let batch = txn.scan(prefix, &end, PURGE_BATCH_SIZE);
                if batch.is_empty() {
                    break;
                }
                deleted += batch.len() as u64;
                for (key, _) in batch {
                    txn.delete(key);
                }
                txn.commit()?;
            }
        }
        session.set_statement(None);
        self.backfill.pool.put(session);
        Ok(deleted)
    }

    fn retries_guard(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, usize>> {
        self.retries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    fn allocate(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

fn build_job(
    request: &DdlRequest,
    schema: &InfoSchema,
    ids: &mut IdAllocator,
    submitted_by: u64,
) -> DdlResult<DdlJob> {
    let job_id = ids.allocate();
    let table_name = request.table_name().to_ascii_lowercase();
    let existing = |name: &str| {
        schema
            .public_table(name)
            .ok_or_else(|| DdlError::NoSuchTable(name.to_string()))
    };

    let (table_id, action) = match request {
        DdlRequest::CreateTable { columns, .. } => {
            if schema.table_by_name(&table_name).is_some() {
                return Err(DdlError::TableExists(table_name));
            }
            let table_id = ids.allocate();
            let mut infos: Vec<ColumnInfo> = Vec::with_capacity(columns.len());
            for def in columns {
                if infos.iter().any(|c| c.name.eq_ignore_ascii_case(&def.name)) {
                    return Err(DdlError::DupFieldName(def.name.clone()));
                }
                check_column_def(&table_name, def)?;
                infos.push(ColumnInfo::from_def(ids.allocate(), def, SchemaState::Public));
            }
            if infos.is_empty() {
                return Err(DdlError::internal(format!(
                    "table '{table_name}' must have at least one column"
                )));
            }
            let table = TableInfo {
                id: table_id,
                name: table_name.clone(),
                columns: infos,
                indices: Vec::new(),
                state: SchemaState::None,
            };
            (table_id, JobAction::CreateTable { table })
        }
        DdlRequest::DropTable { .. } => (existing(&table_name)?.id, JobAction::DropTable),
        DdlRequest::AddIndex {
            index,
            columns,
            unique,
            ..
        } => {
            let table = existing(&table_name)?;
            if table.find_index(index).is_some() {
                return Err(DdlError::DupKeyName(index.clone()));
            }
            if columns.is_empty() {
                return Err(DdlError::internal(format!("index '{index}' has no key columns")));
            }
            for column in columns {
                if !table.find_column(column).is_some_and(|c| c.state.is_public()) {
                    return Err(DdlError::BadField {
                        table: table.name.clone(),
                        column: column.clone(),
                    });
                }
            }
            let index = IndexInfo {
                id: ids.allocate(),
                name: index.to_ascii_lowercase(),
                columns: columns.iter().map(|c| c.to_ascii_lowercase()).collect(),
                unique: *unique,
                state: SchemaState::None,
            };
            (table.id, JobAction::AddIndex { index })
        }
        DdlRequest::DropIndex { index, .. } => {
            let table = existing(&table_name)?;
            let found = table
                .find_index(index)
                .filter(|found| found.state.is_public())
                .ok_or_else(|| DdlError::CantDropFieldOrKey(index.clone()))?;
            (
                table.id,
                JobAction::DropIndex {
                    index: found.name.clone(),
                    index_id: found.id,
                },
            )
        }
        DdlRequest::AddColumn { column, .. } => {
            let table = existing(&table_name)?;
            if table.find_column(&column.name).is_some() {
                return Err(DdlError::DupFieldName(column.name.clone()));
            }
            check_column_def(&table_name, column)?;
            let column = ColumnInfo::from_def(ids.allocate(), column, SchemaState::None);
            (table.id, JobAction::AddColumn { column })
        }
        DdlRequest::DropColumn { column, .. } => {
            let table = existing(&table_name)?;
            let found = table
                .find_column(column)
                .filter(|found| found.state.is_public())
                .ok_or_else(|| DdlError::CantDropFieldOrKey(column.clone()))?;
            (
                table.id,
                JobAction::DropColumn {
                    column: found.name.clone(),
                    column_id: found.id,
                },
            )
        }
    };

    let kind: JobKind = action.kind();
    tracing::debug!(job_id, kind = kind.as_str(), table = %table_name, "built ddl job");
    Ok(DdlJob::new(job_id, table_id, &table_name, action, submitted_by))
}

fn check_column_def(table: &str, def: &ColumnDef) -> DdlResult<()> {
    if !def.default.fits(def.column_type) {
        return Err(DdlError::internal(format!(
            "default {} does not fit column '{}' of '{table}'",
            def.default, def.name
        )));
    }
    if !def.nullable && def.default.is_null() {
        return Err(DdlError::internal(format!(
            "NOT NULL column '{}' of '{table}' needs a default",
            def.name
        )));
    }
    Ok(())
}
