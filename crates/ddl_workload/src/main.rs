//! Workload generator for exercising online index creation.
//!
//! This binary starts an in-process cluster, keeps concurrent writers busy on
//! every node, adds an index through one of them, and then checks the index
//! against the rows on every node.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use ddl_engine::{
    Cluster, ColumnDef, ColumnType, Datum, DdlConfig, DdlError, DdlErrorCode, DdlNode, DdlRequest,
    VerifyReport,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::time;

const TABLE: &str = "t";
const PRELOAD_BATCH: i64 = 500;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "ddl-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum IndexKind {
    /// Non-unique index on `c1`, whose values repeat.
    Plain,
    /// Unique index on `c2`, which always equals the row handle.
    Unique,
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of in-process nodes sharing one store.
    #[arg(long, default_value_t = 3)]
    nodes: u64,

    /// Number of concurrent writers, spread across the nodes.
    #[arg(long, default_value_t = 8)]
    clients: usize,

    /// Rows loaded before the workload starts.
    #[arg(long, default_value_t = 10_000)]
    rows: i64,

    /// Distinct values of `c1`.
    #[arg(long, default_value_t = 97)]
    modulo: i64,

    #[arg(long, value_enum, default_value_t = IndexKind::Plain)]
    index: IndexKind,

    /// Writes run this long before the index is added and again after.
    #[arg(long, default_value = "2s")]
    warmup: humantime::Duration,

    /// Upper bound for the schema change to finish.
    #[arg(long, default_value = "120s")]
    ddl_timeout: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write the verification reports as JSON to this path.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Per-writer counters.
#[derive(Debug, Default, Clone, Copy)]
struct ClientStats {
    committed: u64,
    retried: u64,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ddl_engine=info,ddl_workload=info,warn".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.nodes > 0, "--nodes must be > 0");
    anyhow::ensure!(args.clients > 0, "--clients must be > 0");
    anyhow::ensure!(args.rows > 0, "--rows must be > 0");
    anyhow::ensure!(args.modulo > 0, "--modulo must be > 0");

    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let base = DdlConfig::from_env().context("load ddl config")?;
    let cluster = Cluster::in_memory();
    let mut nodes = Vec::new();
    for node_id in 1..=args.nodes {
        let config = DdlConfig {
            node_id,
            ..base.clone()
        };
        let node = DdlNode::start(config, cluster.clone())
            .await
            .with_context(|| format!("start node {node_id}"))?;
        nodes.push(node);
    }

    nodes[0]
        .execute_ddl(DdlRequest::CreateTable {
            table: TABLE.to_string(),
            columns: vec![
                ColumnDef::new("c1", ColumnType::Int),
                ColumnDef::new("c2", ColumnType::Int),
            ],
        })
        .await
        .context("create table")?;
    preload(&nodes[0], args.rows, args.modulo).context("preload rows")?;
    tracing::info!(rows = args.rows, seed, "preload finished");

    let stop = Arc::new(AtomicBool::new(false));
    let mut clients = Vec::with_capacity(args.clients);
    for client_id in 0..args.clients {
        let node = Arc::clone(&nodes[client_id % nodes.len()]);
        let stop = Arc::clone(&stop);
        // Mix the base seed with the client id for deterministic per-client RNG.
        let seed = seed ^ (client_id as u64).wrapping_mul(0x9e3779b97f4a7c15);
        let rows = args.rows;
        let modulo = args.modulo;
        clients.push(tokio::spawn(async move {
            run_client(node, client_id, rows, modulo, seed, stop).await
        }));
    }

    let warmup: Duration = args.warmup.into();
    time::sleep(warmup).await;

    let (index, column, unique) = match args.index {
        IndexKind::Plain => ("idx_c1", "c1", false),
        IndexKind::Unique => ("uk_c2", "c2", true),
    };
    let ddl_node = &nodes[nodes.len() - 1];
    let started = Instant::now();
    let job = time::timeout(
        args.ddl_timeout.into(),
        ddl_node.execute_ddl(DdlRequest::AddIndex {
            table: TABLE.to_string(),
            index: index.to_string(),
            columns: vec![column.to_string()],
            unique,
        }),
    )
    .await
    .context("add index timed out")?
    .context("add index")?;
    tracing::info!(
        job_id = job.id,
        rows = job.row_count,
        schema_version = job.schema_version,
        elapsed = ?started.elapsed(),
        "index added"
    );

    time::sleep(warmup).await;
    stop.store(true, Ordering::SeqCst);
    let mut totals = ClientStats::default();
    for client in clients {
        let stats = client.await.context("client task panicked")??;
        totals.committed += stats.committed;
        totals.retried += stats.retried;
    }

    let mut reports = Vec::with_capacity(nodes.len());
    for node in &nodes {
        let report = node
            .verify_index(TABLE, index)
            .with_context(|| format!("verify on node {}", node.node_id()))?;
        tracing::info!(
            node_id = node.node_id(),
            rows = report.rows,
            index_entries = report.index_entries,
            discrepancies = report.discrepancies.len(),
            "index verified"
        );
        reports.push(report);
    }
    if let Some(path) = &args.out {
        write_reports(path, &reports).context("write reports")?;
        eprintln!("wrote reports: {}", path.display());
    }

    let owner_metrics = nodes
        .iter()
        .find(|node| node.is_owner())
        .map(|node| node.metrics().snapshot());
    eprintln!(
        "committed={} retried={} owner_metrics={owner_metrics:?}",
        totals.committed, totals.retried
    );

    for node in &nodes {
        node.shutdown().await;
    }
    let inconsistent = reports.iter().filter(|report| !report.is_consistent()).count();
    anyhow::ensure!(inconsistent == 0, "{inconsistent} node(s) saw an inconsistent index");
    Ok(())
}

fn preload(node: &DdlNode, rows: i64, modulo: i64) -> Result<(), DdlError> {
    let mut next = 0;
    while next < rows {
        let end = (next + PRELOAD_BATCH).min(rows);
        let mut txn = node.begin()?;
        for handle in next..end {
            txn.insert(
                TABLE,
                handle,
                vec![Datum::Int(handle % modulo), Datum::Int(handle)],
            )?;
        }
        txn.commit()?;
        next = end;
    }
    Ok(())
}

/// Runs insert/delete/update transactions until `stop` is set. Stale-schema
/// and conflict errors are retried with a fresh transaction.
async fn run_client(
    node: Arc<DdlNode>,
    client_id: usize,
    rows: i64,
    modulo: i64,
    seed: u64,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<ClientStats> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut stats = ClientStats::default();
    // Fresh handles per client never collide with the preload or each other.
    let mut next_fresh = rows + (client_id as i64 + 1) * 100_000_000;
    while !stop.load(Ordering::SeqCst) {
        let op = rng.gen_range(0..4);
        let handle = rng.gen_range(0..rows);
        let value = rng.gen_range(0..modulo);
        let result = (|| -> Result<(), DdlError> {
            let mut txn = node.begin()?;
            match op {
                0 => txn.insert(
                    TABLE,
                    next_fresh,
                    vec![Datum::Int(value), Datum::Int(next_fresh)],
                )?,
                1 => {
                    txn.delete(TABLE, handle)?;
                }
                2 => {
                    txn.update(TABLE, handle, &[("c1", Datum::Int(value))])?;
                }
                _ => txn.insert(TABLE, handle, vec![Datum::Int(value), Datum::Int(handle)])?,
            }
            txn.commit()?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                stats.committed += 1;
                if op == 0 {
                    next_fresh += 1;
                }
            }
            Err(err) if should_retry(&err) => {
                stats.retried += 1;
                tracing::debug!(client_id, error = %err, "transaction retried");
            }
            // Re-inserting a handle that is still live.
            Err(err) if op == 3 && err.code() == DdlErrorCode::DupEntry => {}
            Err(err) => {
                return Err(err).with_context(|| format!("client {client_id} op {op} failed"));
            }
        }
        tokio::task::yield_now().await;
    }
    Ok(stats)
}

fn should_retry(err: &DdlError) -> bool {
    err.is_retryable()
        || matches!(
            err.code(),
            DdlErrorCode::InfoSchemaChanged
                | DdlErrorCode::InfoSchemaExpired
                | DdlErrorCode::WriteConflict
        )
}

/// Serialize and write the verification reports JSON.
fn write_reports(path: &PathBuf, reports: &[VerifyReport]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(reports).context("serialize reports")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
