//! Job queue, owner election, per-state planning and index backfill.

pub mod backfill;
pub mod coordinator;
pub mod handlers;
pub mod job;
pub mod owner;

pub use backfill::BackfillContext;
pub use coordinator::DdlCoordinator;
pub use job::{DdlJob, DdlRequest, HandleRange, JobAction, JobError, JobKind, JobState, ReorgInfo};
pub use owner::{OwnerManager, OwnerRecord, OwnerToken};
