//! Lease expiry and commit-time schema checks.
//!
//! Test flow:
//! 1) Cut a node off the coordination store for longer than one lease.
//! 2) Open transactions on a table, then change that table or another one.
//!
//! Verification:
//! - A node that cannot reload refuses to begin or commit transactions.
//! - A transaction that spans more than one change to a table it wrote
//!   fails with `InfoSchemaChanged`; unrelated changes do not affect it.

mod common;

use std::time::Duration;

use anyhow::Result;
use common::{create_two_column_table, execute, load_rows, shutdown_all, start_cluster};
use ddl_engine::{ColumnDef, ColumnType, Datum, DdlErrorCode, DdlRequest};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn node_refuses_work_once_its_lease_runs_out() -> Result<()> {
    let (cluster, nodes) = start_cluster(1).await?;
    let node = &nodes[0];
    create_two_column_table(node, "t").await?;
    load_rows(node, "t", 0..10, 3)?;

    let mut in_flight = node.begin()?;
    in_flight.insert("t", 100, vec![Datum::Int(1), Datum::Int(100)])?;

    cluster.meta.inject_failures(1_000_000);
    tokio::time::sleep(node.config().schema_lease * 2).await;

    let err = in_flight.commit().unwrap_err();
    assert_eq!(err.code(), DdlErrorCode::InfoSchemaExpired);
    assert_eq!(err.sql_code(), 8027);
    let err = node.begin().err().expect("begin must fail without a lease");
    assert_eq!(err.code(), DdlErrorCode::InfoSchemaExpired);
    assert!(node.metrics().snapshot().schema_reload_failures > 0);

    cluster.meta.inject_failures(0);
    let txn = node.begin()?;
    assert_eq!(txn.get("t", 100)?, None);
    assert_eq!(
        txn.get("t", 4)?,
        Some(vec![Datum::Int(1), Datum::Int(4)])
    );
    txn.rollback();

    shutdown_all(&nodes).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transactions_spanning_schema_changes_are_checked_per_table() -> Result<()> {
    let (_cluster, nodes) = start_cluster(2).await?;
    create_two_column_table(&nodes[0], "t").await?;
    create_two_column_table(&nodes[0], "u").await?;
    load_rows(&nodes[1], "t", 0..50, 7)?;

    let mut spans_index = nodes[1].begin()?;
    spans_index.insert("t", 500, vec![Datum::Int(3), Datum::Int(500)])?;
    let mut other_table_changed = nodes[1].begin()?;
    other_table_changed.update("t", 1, &[("c1", Datum::Int(42))])?;
    let start_version = spans_index.schema_version();

    execute(
        &nodes[0],
        DdlRequest::AddColumn {
            table: "u".to_string(),
            column: ColumnDef::new("c3", ColumnType::Text).with_default(Datum::Text("x".into())),
        },
    )
    .await?;
    other_table_changed.commit()?;

    execute(
        &nodes[0],
        DdlRequest::AddIndex {
            table: "t".to_string(),
            index: "idx_c1".to_string(),
            columns: vec!["c1".to_string()],
            unique: false,
        },
    )
    .await?;
    assert!(nodes[1].schema_manager().current_version() > start_version + 1);

    let err = spans_index.commit().unwrap_err();
    assert_eq!(err.code(), DdlErrorCode::InfoSchemaChanged);
    assert_eq!(err.sql_code(), 8028);
    assert!(nodes[1].metrics().snapshot().schema_check_rejections > 0);

    // Retrying on the new schema succeeds and maintains the index.
    let mut retry = nodes[1].begin()?;
    retry.insert("t", 500, vec![Datum::Int(3), Datum::Int(500)])?;
    retry.commit()?;

    let check = nodes[0].begin()?;
    assert_eq!(check.get("t", 1)?, Some(vec![Datum::Int(42), Datum::Int(1)]));
    let report = nodes[0].verify_index("t", "idx_c1")?;
    assert!(report.is_consistent(), "{:?}", report.discrepancies);
    assert_eq!(report.rows, 51);

    shutdown_all(&nodes).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn owner_publishes_only_after_leases_catch_up() -> Result<()> {
    let (_cluster, nodes) = start_cluster(3).await?;
    create_two_column_table(&nodes[0], "t").await?;
    let job = execute(
        &nodes[2],
        DdlRequest::AddIndex {
            table: "t".to_string(),
            index: "idx_c2".to_string(),
            columns: vec!["c2".to_string()],
            unique: false,
        },
    )
    .await?;

    // Each node acknowledged the final version before the job finished.
    for node in &nodes {
        assert!(node.schema_manager().current_version() >= job.schema_version);
    }
    let leases = nodes[0].schema_manager().leases()?;
    assert_eq!(leases.len(), 3);
    assert!(leases.iter().all(|lease| lease.version >= job.schema_version));
    assert!(nodes[0].schema_manager().pending_nodes(job.schema_version)?.is_empty());

    tokio::time::sleep(Duration::from_millis(10)).await;
    shutdown_all(&nodes).await;
    assert!(nodes[0].schema_manager().leases()?.is_empty());
    Ok(())
}
