//! Internal sessions used by background DDL work, their pool, and the
//! node's process list.

pub mod pool;
pub mod process;

use std::sync::Arc;

use ddl_kv::{Txn, TxnStore};

pub use pool::{Resource, SessionPool};
pub use process::{KillSignal, ProcessHandle, ProcessInfo, ProcessRegistry, SessionManager, TlsConfig};

use crate::error::{DdlError, DdlResult};
use crate::schema::JobId;

/// Execution context for owner-side work such as backfill chunks and purges.
/// Visible in the process list while alive.
pub struct InternalSession {
    store: Arc<TxnStore>,
    process: Option<ProcessHandle>,
}

impl InternalSession {
    pub fn new(store: Arc<TxnStore>, registry: &Arc<ProcessRegistry>) -> Self {
        Self {
            store,
            process: Some(registry.register("ddl", "Daemon")),
        }
    }

    pub fn id(&self) -> Option<u64> {
        self.process.as_ref().map(ProcessHandle::id)
    }

    pub fn begin(&self) -> Txn {
        self.store.begin()
    }

    pub fn set_statement(&self, statement: Option<String>) {
        if let Some(process) = &self.process {
            process.set_statement(statement);
        }
    }

    /// Fails with `CancelledDdlJob` once the session was killed or closed.
    pub fn check_killed(&self, job_id: JobId) -> DdlResult<()> {
        match &self.process {
            Some(process) if !process.kill_signal().is_killed() => Ok(()),
            _ => Err(DdlError::CancelledDdlJob(job_id)),
        }
    }
}

impl Resource for InternalSession {
    fn close(&mut self) {
        self.process.take();
    }
}

/// Pool of internal sessions registered with `registry`.
pub fn internal_session_pool(
    capacity: usize,
    store: Arc<TxnStore>,
    registry: Arc<ProcessRegistry>,
) -> SessionPool<InternalSession> {
    SessionPool::new(capacity, move || {
        Ok(InternalSession::new(Arc::clone(&store), &registry))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_sessions_stay_registered_until_closed() {
        let store = TxnStore::in_memory();
        let registry = ProcessRegistry::new(1);
        let pool = internal_session_pool(1, store, Arc::clone(&registry));

        let session = pool.get().unwrap();
        let id = session.id().unwrap();
        assert!(registry.get_process_info(id).is_some());
        pool.put(session);
        assert_eq!(registry.show_process_list().len(), 1);

        let session = pool.get().unwrap();
        registry.kill(id, false);
        assert!(matches!(
            session.check_killed(7),
            Err(DdlError::CancelledDdlJob(7))
        ));
        pool.put(session);

        pool.close();
        assert!(registry.show_process_list().is_empty());
    }
}
