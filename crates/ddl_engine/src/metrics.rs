//! In-process counters for DDL job progress, schema sync and backfill.
//!
//! Counters are lock-free so foreground commit paths can bump them without
//! contending with the owner loop.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct DdlMetrics {
    /// Jobs accepted by `submit`.
    jobs_submitted: AtomicU64,
    /// Jobs finished in `Done`.
    jobs_done: AtomicU64,
    /// Jobs finished in `RollbackDone` or `Cancelled`.
    jobs_rolled_back: AtomicU64,
    /// Committed schema-state transitions (one per minted version).
    state_transitions: AtomicU64,
    /// Transient phase failures that were retried.
    phase_retries: AtomicU64,
    /// Successful schema reloads that installed a newer version.
    schema_reloads: AtomicU64,
    /// Schema reload attempts that failed.
    schema_reload_failures: AtomicU64,
    /// Lease-sync waits that ran into their timeout.
    lease_wait_timeouts: AtomicU64,
    /// Rows read and indexed by backfill chunks.
    backfill_rows: AtomicU64,
    /// Committed backfill chunks.
    backfill_chunks: AtomicU64,
    /// Backfill chunks rolled back on conflict and retried.
    backfill_chunk_retries: AtomicU64,
    /// Foreground commits rejected by the schema validator.
    schema_check_rejections: AtomicU64,
    /// Foreground transactions committed.
    txn_commits: AtomicU64,
}

/// Point-in-time copy of `DdlMetrics`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DdlMetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_done: u64,
    pub jobs_rolled_back: u64,
    pub state_transitions: u64,
    pub phase_retries: u64,
    pub schema_reloads: u64,
    pub schema_reload_failures: u64,
    pub lease_wait_timeouts: u64,
    pub backfill_rows: u64,
    pub backfill_chunks: u64,
    pub backfill_chunk_retries: u64,
    pub schema_check_rejections: u64,
    pub txn_commits: u64,
}

impl DdlMetrics {
    pub fn record_job_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_done(&self) {
        self.jobs_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_rolled_back(&self) {
        self.jobs_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_state_transition(&self) {
        self.state_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_phase_retry(&self) {
        self.phase_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_schema_reload(&self) {
        self.schema_reloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_schema_reload_failure(&self) {
        self.schema_reload_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lease_wait_timeout(&self) {
        self.lease_wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backfill_chunk(&self, rows: u64) {
        self.backfill_chunks.fetch_add(1, Ordering::Relaxed);
        self.backfill_rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_backfill_chunk_retry(&self) {
        self.backfill_chunk_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_schema_check_rejection(&self) {
        self.schema_check_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_txn_commit(&self) {
        self.txn_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DdlMetricsSnapshot {
        DdlMetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_done: self.jobs_done.load(Ordering::Relaxed),
            jobs_rolled_back: self.jobs_rolled_back.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
            phase_retries: self.phase_retries.load(Ordering::Relaxed),
            schema_reloads: self.schema_reloads.load(Ordering::Relaxed),
            schema_reload_failures: self.schema_reload_failures.load(Ordering::Relaxed),
            lease_wait_timeouts: self.lease_wait_timeouts.load(Ordering::Relaxed),
            backfill_rows: self.backfill_rows.load(Ordering::Relaxed),
            backfill_chunks: self.backfill_chunks.load(Ordering::Relaxed),
            backfill_chunk_retries: self.backfill_chunk_retries.load(Ordering::Relaxed),
            schema_check_rejections: self.schema_check_rejections.load(Ordering::Relaxed),
            txn_commits: self.txn_commits.load(Ordering::Relaxed),
        }
    }
}
