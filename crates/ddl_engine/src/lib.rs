//! Online schema changes for a distributed transactional store.
//!
//! Every node caches an immutable, versioned catalog and bounds how stale it
//! may be with a lease. A single elected owner moves each schema object
//! through `None -> DeleteOnly -> WriteOnly -> WriteReorganization -> Public`
//! (or the reverse for drops), minting one schema version per step and
//! waiting for every live node to acknowledge it before the next. Foreground
//! transactions keep indexes consistent according to the states they see,
//! and a parallel backfill indexes the rows that existed before.

pub mod config;
pub mod ddl;
pub mod error;
pub mod meta_keys;
pub mod metrics;
pub mod node;
pub mod schema;
pub mod session;
pub mod table;
pub mod txn;
pub mod verify;

pub use config::DdlConfig;
pub use ddl::{DdlJob, DdlRequest, JobKind, JobState};
pub use error::{DdlError, DdlErrorCode, DdlResult};
pub use metrics::{DdlMetrics, DdlMetricsSnapshot};
pub use node::{Cluster, DdlNode};
pub use schema::{ColumnDef, ColumnType, Datum, SchemaState};
pub use session::{SessionManager, SessionPool};
pub use txn::Transaction;
pub use verify::{Discrepancy, VerifyReport};
