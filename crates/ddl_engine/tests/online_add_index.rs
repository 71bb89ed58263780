//! Adds an index while writers on every node keep mutating the table.
//!
//! Test flow:
//! 1) Start a 3-node cluster, create `t (c1, c2)` and preload rows.
//! 2) Run insert/delete/update workers against all nodes.
//! 3) Add the index through a non-owner node while the workers run.
//! 4) Stop the workers and verify the index against the rows on every node.
//!
//! Verification:
//! - No row is missing from the index and no entry dangles or is stale.
//! - The job walked every schema state once, in order, and every state
//!   change minted exactly one schema version.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{
    create_two_column_table, execute, load_rows, should_retry, shutdown_all, start_cluster,
};
use ddl_engine::{Datum, DdlError, DdlErrorCode, DdlNode, DdlRequest, JobState, SchemaState};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const PRELOAD: i64 = 600;
const MODULO: i64 = 37;
const WORKERS: usize = 6;

async fn run_worker(node: Arc<DdlNode>, worker: i64, stop: Arc<AtomicBool>) -> Result<u64> {
    let mut rng = SmallRng::seed_from_u64(worker as u64 + 17);
    let mut next_fresh = (worker + 1) * 1_000_000;
    let mut committed = 0u64;
    while !stop.load(Ordering::SeqCst) {
        let op = rng.gen_range(0..4);
        let handle = rng.gen_range(0..PRELOAD);
        let value = rng.gen_range(0..MODULO);
        let result = (|| -> Result<(), DdlError> {
            let mut txn = node.begin()?;
            match op {
                0 => txn.insert(
                    "t",
                    next_fresh,
                    vec![Datum::Int(value), Datum::Int(next_fresh)],
                )?,
                1 => {
                    txn.delete("t", handle)?;
                }
                2 => {
                    txn.update("t", handle, &[("c1", Datum::Int(value))])?;
                }
                _ => txn.insert("t", handle, vec![Datum::Int(value), Datum::Int(handle)])?,
            }
            txn.commit()?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                committed += 1;
                if op == 0 {
                    next_fresh += 1;
                }
            }
            Err(err) if should_retry(&err) => {}
            // Re-inserting a live preloaded handle.
            Err(err) if op == 3 && err.code() == DdlErrorCode::DupEntry => {}
            Err(err) => return Err(err.into()),
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    Ok(committed)
}

async fn add_index_under_load(index: &str, column: &str, unique: bool) -> Result<()> {
    let (_cluster, nodes) = start_cluster(3).await?;
    assert!(nodes[0].is_owner());
    create_two_column_table(&nodes[0], "t").await?;
    load_rows(&nodes[0], "t", 0..PRELOAD, MODULO)?;

    let stop = Arc::new(AtomicBool::new(false));
    let workers = (0..WORKERS)
        .map(|worker| {
            let node = Arc::clone(&nodes[worker % nodes.len()]);
            tokio::spawn(run_worker(node, worker as i64, Arc::clone(&stop)))
        })
        .collect::<Vec<_>>();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let job = execute(
        &nodes[1],
        DdlRequest::AddIndex {
            table: "t".to_string(),
            index: index.to_string(),
            columns: vec![column.to_string()],
            unique,
        },
    )
    .await?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.store(true, Ordering::SeqCst);
    let mut committed = 0;
    for worker in workers {
        committed += worker.await??;
    }
    assert!(committed > 0, "workload made no progress");

    assert_eq!(job.state, JobState::Done);
    assert_eq!(
        job.state_history,
        vec![
            SchemaState::None,
            SchemaState::DeleteOnly,
            SchemaState::WriteOnly,
            SchemaState::WriteReorganization,
            SchemaState::Public,
        ]
    );

    let diffs = nodes[2].schema_manager().diffs_since(0);
    for pair in diffs.windows(2) {
        assert_eq!(pair[1].version, pair[0].version + 1);
    }
    let index_steps = diffs
        .iter()
        .filter(|diff| diff.job_id == job.id)
        .map(|diff| (diff.from_state, diff.to_state))
        .collect::<Vec<_>>();
    assert_eq!(index_steps.len(), 4);
    assert_eq!(
        index_steps.last(),
        Some(&(SchemaState::WriteReorganization, SchemaState::Public))
    );

    for node in &nodes {
        let report = node.verify_index("t", index)?;
        assert!(
            report.is_consistent(),
            "node {} saw discrepancies: {:?}",
            node.node_id(),
            report.discrepancies
        );
        assert!(report.rows > 0);
        assert_eq!(report.rows, report.index_entries);
    }

    shutdown_all(&nodes).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_index_under_concurrent_writes_stays_consistent() -> Result<()> {
    add_index_under_load("idx_c1", "c1", false).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_unique_index_under_concurrent_writes_stays_consistent() -> Result<()> {
    add_index_under_load("uk_c2", "c2", true).await
}
