//! Parallel index backfill over the rows that existed when reorganization
//! started.
//!
//! The handle space is split into partitions once; each partition keeps a
//! cursor in storage that advances in the same transaction as the entries it
//! covers, so committed chunks are never reprocessed after a restart or an
//! owner change. Every chunk locks the rows it reads: a concurrent foreground
//! update of one of them makes either the chunk or the update retry, never
//! both commit on stale data.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ddl_kv::{prefix_end, MetaStore, TxnStore};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::config::DdlConfig;
use crate::error::{DdlError, DdlResult};
use crate::meta_keys::job_queue_key;
use crate::metrics::DdlMetrics;
use crate::schema::{Handle, IndexInfo, JobId, TableInfo};
use crate::session::{InternalSession, SessionPool};
use crate::table::codec::{
    decode_handle, decode_record_key, decode_row, describe_index_values, encode_handle,
    encode_index_key, record_key, record_prefix, reorg_cursor_key, scan_prefix,
};

use super::job::{DdlJob, HandleRange, ReorgInfo};

/// Shared services for backfill workers.
pub struct BackfillContext {
    pub config: DdlConfig,
    pub store: Arc<TxnStore>,
    pub meta: Arc<MetaStore>,
    pub pool: Arc<SessionPool<InternalSession>>,
    pub metrics: Arc<DdlMetrics>,
    halted: AtomicBool,
}

impl BackfillContext {
    pub fn new(
        config: DdlConfig,
        store: Arc<TxnStore>,
        meta: Arc<MetaStore>,
        pool: Arc<SessionPool<InternalSession>>,
        metrics: Arc<DdlMetrics>,
    ) -> Self {
        Self {
            config,
            store,
            meta,
            pool,
            metrics,
            halted: AtomicBool::new(false),
        }
    }

    /// Stops every worker of this node after its current chunk.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn cancel_requested(&self, job_id: JobId) -> DdlResult<bool> {
        match self.meta.get(&job_queue_key(job_id))? {
            Some(entry) => Ok(DdlJob::decode(&entry.value)?.cancel_requested),
            None => Ok(true),
        }
    }
}

/// Persisted progress of one partition; `next: None` means finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct PartitionCursor {
    next: Option<Handle>,
}

struct ChunkProgress {
    rows: u64,
    done: bool,
}

/// Splits the handles present now into at most `workers` contiguous ranges.
/// The last range is unbounded.
pub fn plan_reorg(store: &Arc<TxnStore>, table: &TableInfo, workers: usize) -> DdlResult<ReorgInfo> {
    let txn = store.begin();
    let mut bounds: Option<(Handle, Handle)> = None;
    scan_prefix(&txn, &record_prefix(table.id), 1024, |key, _| {
        let (_, handle) = decode_record_key(key)
            .ok_or_else(|| DdlError::internal(format!("malformed row key {}", hex::encode(key))))?;
        bounds = Some(match bounds {
            Some((min, max)) => (min.min(handle), max.max(handle)),
            None => (handle, handle),
        });
        Ok(())
    })?;

    let partitions = match bounds {
        None => Vec::new(),
        Some((min, max)) => split_handle_range(min, max, workers.max(1)),
    };
    tracing::info!(
        table = %table.name,
        partitions = partitions.len(),
        snapshot_ts = txn.start_ts(),
        "planned index backfill"
    );
    Ok(ReorgInfo {
        partitions,
        planned_at_ts: txn.start_ts(),
    })
}

fn split_handle_range(min: Handle, max: Handle, workers: usize) -> Vec<HandleRange> {
    let span = i128::from(max) - i128::from(min) + 1;
    let step = (span + workers as i128 - 1) / workers as i128;
    let mut out = Vec::with_capacity(workers);
    let mut start = i128::from(min);
    while start <= i128::from(max) {
        let end = start + step;
        out.push(HandleRange {
            start: start as Handle,
            end: Handle::try_from(end).ok(),
        });
        start = end;
    }
    if let Some(last) = out.last_mut() {
        last.end = None;
    }
    out
}

/// Runs every partition to completion and returns the rows indexed by this
/// run. The first failing worker stops the others.
pub async fn run_backfill(
    ctx: Arc<BackfillContext>,
    job_id: JobId,
    table: &TableInfo,
    index: &IndexInfo,
    reorg: &ReorgInfo,
) -> DdlResult<u64> {
    let stop = Arc::new(AtomicBool::new(false));
    let workers = reorg
        .partitions
        .iter()
        .enumerate()
        .map(|(partition, range)| {
            let worker = PartitionWorker {
                ctx: Arc::clone(&ctx),
                job_id,
                table: table.clone(),
                index: index.clone(),
                partition,
                range: *range,
                stop: Arc::clone(&stop),
            };
            tokio::spawn(worker.run())
        })
        .collect::<Vec<_>>();

    let mut rows = 0u64;
    let mut first_error = None;
    for result in join_all(workers).await {
        match result {
            Ok(Ok(indexed)) => rows += indexed,
            Ok(Err(err)) => {
                first_error.get_or_insert(err);
            }
            Err(join_err) => {
                first_error.get_or_insert(DdlError::internal(format!(
                    "backfill worker panicked: {join_err}"
                )));
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }
    if ctx.is_halted() {
        return Err(DdlError::internal("backfill halted by node shutdown"));
    }
    tracing::info!(job_id, table = %table.name, index = %index.name, rows, "index backfill finished");
    Ok(rows)
}

/// Removes the cursors of a finished reorganization.
pub fn clear_cursors(store: &Arc<TxnStore>, job_id: JobId, partitions: usize) -> DdlResult<()> {
    let mut txn = store.begin();
    for partition in 0..partitions {
        txn.delete(reorg_cursor_key(job_id, partition));
    }
    txn.commit()?;
    Ok(())
}

struct PartitionWorker {
    ctx: Arc<BackfillContext>,
    job_id: JobId,
    table: TableInfo,
    index: IndexInfo,
    partition: usize,
    range: HandleRange,
    stop: Arc<AtomicBool>,
}

impl PartitionWorker {
    async fn run(self) -> DdlResult<u64> {
        let mut rows = 0u64;
        let mut attempt = 0usize;
        let statement = format!(
            "backfill index {} on {} partition {}",
            self.index.name, self.table.name, self.partition
        );
        loop {
            if self.stop.load(Ordering::SeqCst) || self.ctx.is_halted() {
                return Ok(rows);
            }
            let session = self.ctx.pool.get()?;
            session.set_statement(Some(statement.clone()));
            let outcome = self.process_chunk(&session);
            session.set_statement(None);

            match outcome {
                Ok(progress) => {
                    self.ctx.pool.put(session);
                    attempt = 0;
                    rows += progress.rows;
                    self.ctx.metrics.record_backfill_chunk(progress.rows);
                    if progress.done {
                        tracing::debug!(
                            job_id = self.job_id,
                            partition = self.partition,
                            rows,
                            "backfill partition finished"
                        );
                        return Ok(rows);
                    }
                    tokio::task::yield_now().await;
                }
                Err(err) if err.is_retryable() && attempt < self.ctx.config.max_phase_retries => {
                    self.ctx.pool.put(session);
                    attempt += 1;
                    self.ctx.metrics.record_backfill_chunk_retry();
                    tracing::debug!(
                        job_id = self.job_id,
                        partition = self.partition,
                        attempt,
                        error = %err,
                        "backfill chunk retry"
                    );
                    tokio::time::sleep(self.ctx.config.retry_delay(attempt)).await;
                }
                Err(err) => {
                    // Killed or failed sessions are not returned to the pool.
                    drop(session);
                    self.stop.store(true, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
    }

    fn process_chunk(&self, session: &InternalSession) -> DdlResult<ChunkProgress> {
        session.check_killed(self.job_id)?;
        if self.ctx.cancel_requested(self.job_id)? {
            return Err(DdlError::CancelledDdlJob(self.job_id));
        }

        let mut txn = session.begin();
        let cursor_key = reorg_cursor_key(self.job_id, self.partition);
        let cursor = match txn.get(&cursor_key) {
            Some(raw) => serde_json::from_slice::<PartitionCursor>(&raw)?,
            None => PartitionCursor {
                next: Some(self.range.start),
            },
        };
        let Some(next) = cursor.next else {
            return Ok(ChunkProgress {
                rows: 0,
                done: true,
            });
        };

        let start = record_key(self.table.id, next);
        let end = match self.range.end {
            Some(end) => record_key(self.table.id, end),
            None => prefix_end(&record_prefix(self.table.id)).unwrap_or_default(),
        };
        let batch_size = self.ctx.config.backfill_batch_size.max(1);
        let batch = txn.scan(&start, &end, batch_size);

        let mut last_handle = None;
        for (key, value) in &batch {
            let (_, handle) = decode_record_key(key).ok_or_else(|| {
                DdlError::internal(format!("malformed row key {}", hex::encode(key)))
            })?;
            let row = decode_row(value)?;
            txn.lock_key(key.clone());
            let (entry, distinct) = encode_index_key(&self.table, &self.index, &row, handle)?;
            if distinct {
                if let Some(existing) = txn.get(&entry).as_deref().and_then(decode_handle) {
                    if existing != handle {
                        return Err(DdlError::DupEntry {
                            index: self.index.name.clone(),
                            key: describe_index_values(&self.table, &self.index, &row),
                        });
                    }
                }
            }
            txn.set(entry, encode_handle(handle));
            last_handle = Some(handle);
        }

        let next = match last_handle {
            Some(handle) if batch.len() >= batch_size => handle.checked_add(1),
            _ => None,
        };
        txn.set(cursor_key, serde_json::to_vec(&PartitionCursor { next })?);
        txn.commit()?;
        Ok(ChunkProgress {
            rows: batch.len() as u64,
            done: next.is_none(),
        })
    }
}
