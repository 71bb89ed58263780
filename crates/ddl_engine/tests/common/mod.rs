//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ddl_engine::{
    Cluster, ColumnDef, ColumnType, Datum, DdlConfig, DdlError, DdlErrorCode, DdlNode, DdlRequest,
};

/// Upper bound for any single DDL to finish in tests.
pub const DDL_TIMEOUT: Duration = Duration::from_secs(30);

/// Starts `count` nodes on one in-process cluster. Node 1 starts first and
/// becomes the DDL owner.
pub async fn start_cluster(count: u64) -> Result<(Cluster, Vec<Arc<DdlNode>>)> {
    let cluster = Cluster::in_memory();
    let mut nodes = Vec::new();
    for node_id in 1..=count {
        let node = DdlNode::start(DdlConfig::for_tests(node_id), cluster.clone())
            .await
            .with_context(|| format!("start node {node_id}"))?;
        nodes.push(node);
    }
    Ok((cluster, nodes))
}

pub async fn shutdown_all(nodes: &[Arc<DdlNode>]) {
    for node in nodes {
        node.shutdown().await;
    }
}

/// Runs a DDL with the test timeout.
pub async fn execute(node: &DdlNode, request: DdlRequest) -> Result<ddl_engine::DdlJob> {
    let job = tokio::time::timeout(DDL_TIMEOUT, node.execute_ddl(request))
        .await
        .context("ddl timed out")??;
    Ok(job)
}

/// Creates `name (c1 INT, c2 INT)`.
pub async fn create_two_column_table(node: &DdlNode, name: &str) -> Result<()> {
    execute(
        node,
        DdlRequest::CreateTable {
            table: name.to_string(),
            columns: vec![
                ColumnDef::new("c1", ColumnType::Int),
                ColumnDef::new("c2", ColumnType::Int),
            ],
        },
    )
    .await?;
    Ok(())
}

/// Inserts handles `range` with `c1 = handle % modulo` and `c2 = handle`.
pub fn load_rows(
    node: &DdlNode,
    table: &str,
    range: std::ops::Range<i64>,
    modulo: i64,
) -> Result<()> {
    let mut txn = node.begin()?;
    for handle in range {
        txn.insert(
            table,
            handle,
            vec![Datum::Int(handle % modulo), Datum::Int(handle)],
        )?;
    }
    txn.commit()?;
    Ok(())
}

/// Errors a foreground client resolves by retrying the transaction.
pub fn should_retry(err: &DdlError) -> bool {
    err.is_retryable()
        || matches!(
            err.code(),
            DdlErrorCode::InfoSchemaChanged | DdlErrorCode::InfoSchemaExpired
        )
}
