//! Composition root for one DDL-capable server node.
//!
//! A node hosts:
//! - a schema version manager with its reload loop and published lease,
//! - an owner campaign loop and the owner loop that runs queued jobs,
//! - a process registry and the internal session pool used by backfill.
//!
//! Several nodes share one `Cluster` (storage plus coordination store) to
//! form a cluster inside one process.

use std::sync::{Arc, Mutex};

use ddl_kv::{MetaStore, TxnStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::DdlConfig;
use crate::ddl::{BackfillContext, DdlCoordinator, DdlJob, DdlRequest, OwnerManager};
use crate::error::{DdlError, DdlResult};
use crate::metrics::DdlMetrics;
use crate::schema::{JobId, SchemaVersionManager};
use crate::session::{
    internal_session_pool, InternalSession, ProcessRegistry, SessionManager, SessionPool,
};
use crate::txn::Transaction;
use crate::verify::{verify_index, verify_table, VerifyReport};

/// Storage and coordination services shared by every node.
#[derive(Clone)]
pub struct Cluster {
    pub store: Arc<TxnStore>,
    pub meta: Arc<MetaStore>,
}

impl Cluster {
    pub fn in_memory() -> Self {
        Self {
            store: TxnStore::in_memory(),
            meta: Arc::new(MetaStore::in_memory()),
        }
    }
}

pub struct DdlNode {
    config: DdlConfig,
    cluster: Cluster,
    metrics: Arc<DdlMetrics>,
    schema: Arc<SchemaVersionManager>,
    registry: Arc<ProcessRegistry>,
    pool: Arc<SessionPool<InternalSession>>,
    backfill: Arc<BackfillContext>,
    coordinator: Arc<DdlCoordinator>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DdlNode {
    /// Loads the latest schema, publishes this node's lease and starts the
    /// background loops.
    pub async fn start(config: DdlConfig, cluster: Cluster) -> DdlResult<Arc<Self>> {
        let metrics = Arc::new(DdlMetrics::default());
        let schema = Arc::new(SchemaVersionManager::new(
            &config,
            Arc::clone(&cluster.meta),
            Arc::clone(&metrics),
        ));
        schema.reload()?;

        let registry = ProcessRegistry::new(config.node_id);
        let pool = Arc::new(internal_session_pool(
            config.session_pool_capacity,
            Arc::clone(&cluster.store),
            Arc::clone(&registry),
        ));
        let backfill = Arc::new(BackfillContext::new(
            config.clone(),
            Arc::clone(&cluster.store),
            Arc::clone(&cluster.meta),
            Arc::clone(&pool),
            Arc::clone(&metrics),
        ));
        let owner = Arc::new(OwnerManager::new(
            config.node_id,
            Arc::clone(&cluster.meta),
            config.owner_ttl,
        ));
        if let Err(err) = owner.campaign() {
            tracing::warn!(node_id = config.node_id, error = %err, "initial owner campaign failed");
        }
        let coordinator = Arc::new(DdlCoordinator::new(
            config.clone(),
            Arc::clone(&cluster.meta),
            Arc::clone(&schema),
            Arc::clone(&owner),
            Arc::clone(&backfill),
            Arc::clone(&metrics),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            Arc::clone(&schema).spawn_reload_loop(shutdown_rx.clone()),
            Arc::clone(&owner).spawn_campaign_loop(shutdown_rx.clone()),
            Arc::clone(&coordinator).spawn_owner_loop(shutdown_rx),
        ];

        tracing::info!(
            node_id = config.node_id,
            schema_version = schema.current_version(),
            owner = owner.is_owner(),
            "ddl node started"
        );
        Ok(Arc::new(Self {
            config,
            cluster,
            metrics,
            schema,
            registry,
            pool,
            backfill,
            coordinator,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn node_id(&self) -> u64 {
        self.config.node_id
    }

    pub fn config(&self) -> &DdlConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn metrics(&self) -> &Arc<DdlMetrics> {
        &self.metrics
    }

    pub fn schema_manager(&self) -> &Arc<SchemaVersionManager> {
        &self.schema
    }

    pub fn coordinator(&self) -> &Arc<DdlCoordinator> {
        &self.coordinator
    }

    pub fn session_manager(&self) -> Arc<dyn SessionManager> {
        Arc::clone(&self.registry) as Arc<dyn SessionManager>
    }

    pub fn process_registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn is_owner(&self) -> bool {
        self.coordinator.owner().is_owner()
    }

    /// Starts a transaction on the freshest schema this node can get.
    ///
    /// Fails with `InfoSchemaExpired` when the node could not reload for a
    /// whole lease.
    pub fn begin(&self) -> DdlResult<Transaction> {
        if let Err(err) = self.schema.reload_if_stale() {
            tracing::warn!(node_id = self.config.node_id, error = %err, "schema reload before begin failed");
        }
        self.schema.check_lease()?;
        Ok(Transaction::new(
            Arc::clone(&self.schema),
            &self.cluster.store,
            Arc::clone(&self.metrics),
        ))
    }

    /// Runs `request` to completion.
    pub async fn execute_ddl(&self, request: DdlRequest) -> DdlResult<DdlJob> {
        self.coordinator.execute(request).await
    }

    pub fn submit_ddl(&self, request: DdlRequest) -> DdlResult<JobId> {
        self.coordinator.submit(request)
    }

    pub async fn wait_ddl(&self, job_id: JobId) -> DdlResult<DdlJob> {
        self.coordinator.wait_job(job_id).await
    }

    pub fn cancel_ddl(&self, job_id: JobId) -> DdlResult<()> {
        self.coordinator.cancel_job(job_id)
    }

    /// Checks `index` of `table` against the rows at one storage snapshot.
    pub fn verify_index(&self, table: &str, index: &str) -> DdlResult<VerifyReport> {
        let snapshot = self.schema.current();
        let table_info = snapshot
            .public_table(table)
            .ok_or_else(|| DdlError::NoSuchTable(table.to_string()))?;
        let index_info = table_info.find_index(index).ok_or_else(|| {
            DdlError::internal(format!("index '{index}' not found on table '{table}'"))
        })?;
        verify_index(&self.cluster.store, table_info, index_info)
    }

    /// Checks every public index of `table`.
    pub fn verify_table(&self, table: &str) -> DdlResult<Vec<VerifyReport>> {
        let snapshot = self.schema.current();
        let table_info = snapshot
            .public_table(table)
            .ok_or_else(|| DdlError::NoSuchTable(table.to_string()))?;
        verify_table(&self.cluster.store, table_info)
    }

    /// Stops the loops, hands ownership over and withdraws the lease.
    pub async fn shutdown(&self) {
        self.stop().await;
        if let Err(err) = self.coordinator.owner().resign() {
            tracing::warn!(node_id = self.config.node_id, error = %err, "failed to resign ddl ownership");
        }
        if let Err(err) = self.schema.release_lease() {
            tracing::warn!(node_id = self.config.node_id, error = %err, "failed to release schema lease");
        }
        self.pool.close();
        tracing::info!(node_id = self.config.node_id, "ddl node stopped");
    }

    /// Stops every loop without resigning or releasing the lease, as if the
    /// process died. Other nodes take over once the owner TTL and lease run
    /// out.
    pub async fn crash(&self) {
        self.stop().await;
        self.pool.close();
        tracing::warn!(node_id = self.config.node_id, "ddl node crashed");
    }

    async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.backfill.halt();
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(node_id = self.config.node_id, error = %err, "background task join failed");
            }
        }
    }
}
