//! Node-level configuration for the DDL engine.

use std::time::Duration;

use anyhow::{Context, Result};

/// Runtime configuration for one DDL-capable server node.
#[derive(Clone, Debug)]
pub struct DdlConfig {
    /// Identity used for leases, ownership and process ids.
    pub node_id: u64,
    /// Schema lease: the longest a live node may run on a cached schema
    /// without a successful reload.
    pub schema_lease: Duration,
    /// Polling interval of the schema reload loop.
    pub reload_interval: Duration,
    /// Time-to-live of the DDL owner record between renewals.
    pub owner_ttl: Duration,
    /// Upper bound the owner waits for every lease to acknowledge a version.
    pub lease_wait_timeout: Duration,
    /// Number of parallel backfill partitions/workers.
    pub backfill_workers: usize,
    /// Rows per backfill chunk transaction.
    pub backfill_batch_size: usize,
    /// Retries of a transient failure within one phase before the job fails.
    pub max_phase_retries: usize,
    /// Base delay of the exponential retry backoff.
    pub retry_base_delay: Duration,
    /// Cap of the exponential retry backoff.
    pub retry_max_delay: Duration,
    /// Number of schema versions (snapshots and diffs) retained.
    pub snapshot_retention: usize,
    /// Idle capacity of the internal session pool.
    pub session_pool_capacity: usize,
}

impl Default for DdlConfig {
    fn default() -> Self {
        let schema_lease = Duration::from_secs(1);
        Self {
            node_id: 1,
            schema_lease,
            reload_interval: schema_lease / 2,
            owner_ttl: Duration::from_secs(3),
            lease_wait_timeout: schema_lease * 2,
            backfill_workers: 4,
            backfill_batch_size: 256,
            max_phase_retries: 8,
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(2),
            snapshot_retention: 16,
            session_pool_capacity: 8,
        }
    }
}

impl DdlConfig {
    /// Loads configuration from `DDL_ENGINE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let node_id = parse_u64(std::env::var("DDL_ENGINE_NODE_ID").ok(), defaults.node_id)?;
        let schema_lease_ms = parse_u64(
            std::env::var("DDL_ENGINE_SCHEMA_LEASE_MS").ok(),
            defaults.schema_lease.as_millis() as u64,
        )?
        .max(10);
        let schema_lease = Duration::from_millis(schema_lease_ms);
        let reload_interval_ms = parse_u64(
            std::env::var("DDL_ENGINE_RELOAD_INTERVAL_MS").ok(),
            schema_lease_ms / 2,
        )?
        .clamp(1, schema_lease_ms);
        let owner_ttl_ms = parse_u64(
            std::env::var("DDL_ENGINE_OWNER_TTL_MS").ok(),
            defaults.owner_ttl.as_millis() as u64,
        )?
        .max(schema_lease_ms);
        let lease_wait_timeout_ms = parse_u64(
            std::env::var("DDL_ENGINE_LEASE_WAIT_TIMEOUT_MS").ok(),
            schema_lease_ms * 2,
        )?;
        let backfill_workers = parse_usize(
            std::env::var("DDL_ENGINE_BACKFILL_WORKERS").ok(),
            defaults.backfill_workers,
        )?
        .max(1);
        let backfill_batch_size = parse_usize(
            std::env::var("DDL_ENGINE_BACKFILL_BATCH_SIZE").ok(),
            defaults.backfill_batch_size,
        )?
        .max(1);
        let max_phase_retries = parse_usize(
            std::env::var("DDL_ENGINE_MAX_PHASE_RETRIES").ok(),
            defaults.max_phase_retries,
        )?;
        let retry_base_delay_ms = parse_u64(
            std::env::var("DDL_ENGINE_RETRY_BASE_DELAY_MS").ok(),
            defaults.retry_base_delay.as_millis() as u64,
        )?
        .max(1);
        let retry_max_delay_ms = parse_u64(
            std::env::var("DDL_ENGINE_RETRY_MAX_DELAY_MS").ok(),
            defaults.retry_max_delay.as_millis() as u64,
        )?
        .max(retry_base_delay_ms);
        let snapshot_retention = parse_usize(
            std::env::var("DDL_ENGINE_SNAPSHOT_RETENTION").ok(),
            defaults.snapshot_retention,
        )?
        .max(2);
        let session_pool_capacity = parse_usize(
            std::env::var("DDL_ENGINE_SESSION_POOL_CAPACITY").ok(),
            defaults.session_pool_capacity,
        )?
        .max(1);

        Ok(Self {
            node_id,
            schema_lease,
            reload_interval: Duration::from_millis(reload_interval_ms),
            owner_ttl: Duration::from_millis(owner_ttl_ms),
            lease_wait_timeout: Duration::from_millis(lease_wait_timeout_ms),
            backfill_workers,
            backfill_batch_size,
            max_phase_retries,
            retry_base_delay: Duration::from_millis(retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(retry_max_delay_ms),
            snapshot_retention,
            session_pool_capacity,
        })
    }

    /// Short leases and small batches so protocol waits stay fast in tests.
    pub fn for_tests(node_id: u64) -> Self {
        let schema_lease = Duration::from_millis(200);
        Self {
            node_id,
            schema_lease,
            reload_interval: Duration::from_millis(20),
            owner_ttl: Duration::from_millis(600),
            lease_wait_timeout: schema_lease * 2,
            backfill_workers: 3,
            backfill_batch_size: 16,
            max_phase_retries: 5,
            retry_base_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_millis(100),
            snapshot_retention: 16,
            session_pool_capacity: 4,
        }
    }

    /// Exponential retry delay for a zero-based attempt.
    pub fn retry_delay(&self, attempt: usize) -> Duration {
        let shift = (attempt as u32).min(6);
        let factor = 1u128 << shift;
        let capped_ms = self
            .retry_base_delay
            .as_millis()
            .saturating_mul(factor)
            .min(self.retry_max_delay.as_millis());
        Duration::from_millis(capped_ms as u64)
    }
}

/// Parses an optional `usize` with fallback default.
fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

/// Parses an optional `u64` with fallback default.
fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}
