//! Key layout of DDL state in the coordination store.
//!
//! Zero-padded numeric suffixes keep prefix listings in numeric order.

use crate::schema::{JobId, SchemaVersion};

pub const SCHEMA_VERSION_KEY: &str = "/ddl/schema/version";
pub const SCHEMA_SNAPSHOT_PREFIX: &str = "/ddl/schema/snapshot/";
pub const SCHEMA_DIFF_PREFIX: &str = "/ddl/schema/diff/";
pub const LEASE_PREFIX: &str = "/ddl/lease/";
pub const OWNER_KEY: &str = "/ddl/owner";
/// Changes only on ownership takeover; owner writes are fenced on it.
pub const OWNER_EPOCH_KEY: &str = "/ddl/owner_epoch";
pub const GLOBAL_ID_KEY: &str = "/ddl/global_id";
pub const JOB_QUEUE_PREFIX: &str = "/ddl/job/queue/";
pub const JOB_HISTORY_PREFIX: &str = "/ddl/job/history/";

pub fn schema_snapshot_key(version: SchemaVersion) -> String {
    format!("{SCHEMA_SNAPSHOT_PREFIX}{version:020}")
}

pub fn schema_diff_key(version: SchemaVersion) -> String {
    format!("{SCHEMA_DIFF_PREFIX}{version:020}")
}

pub fn lease_key(node_id: u64) -> String {
    format!("{LEASE_PREFIX}{node_id:020}")
}

pub fn job_queue_key(job_id: JobId) -> String {
    format!("{JOB_QUEUE_PREFIX}{job_id:020}")
}

pub fn job_history_key(job_id: JobId) -> String {
    format!("{JOB_HISTORY_PREFIX}{job_id:020}")
}

pub fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_keys_sort_numerically() {
        assert!(job_queue_key(9) < job_queue_key(10));
        assert!(schema_diff_key(99) < schema_diff_key(100));
        assert!(job_queue_key(1).starts_with(JOB_QUEUE_PREFIX));
    }
}
