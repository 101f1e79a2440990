use std::collections::BTreeMap;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use consensus_lite::config::NodeConfig;
use consensus_lite::resource::{OperationTable, StateLog, StateLogClient};
use consensus_lite::shutdown::install_shutdown_handler;
use consensus_lite::{ConsensusError, Consistency, LocalCluster, NodeStatus};

#[derive(Parser, Debug)]
#[command(name = "consensus-lite")]
#[command(version)]
#[command(about = "Replicated key-value store on a quorum-replicated log")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start an in-process cluster, write some keys and print the result
    Demo {
        #[command(flatten)]
        cluster: ClusterArgs,

        /// Number of keys to write
        #[arg(long, default_value = "10")]
        writes: u64,

        /// Output format
        #[arg(long, value_enum, default_value = "table")]
        output: OutputFormat,
    },

    /// Run an in-process cluster until interrupted, logging its status
    Serve {
        #[command(flatten)]
        cluster: ClusterArgs,

        /// Seconds between status reports
        #[arg(long, default_value = "5")]
        report_interval_secs: u64,
    },
}

#[derive(clap::Args, Debug)]
struct ClusterArgs {
    /// Number of nodes in the cluster
    #[arg(long, default_value = "3")]
    nodes: u64,

    /// Minimum election timeout in milliseconds
    #[arg(long, default_value = "150")]
    election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds
    #[arg(long, default_value = "300")]
    election_timeout_max_ms: u64,

    /// Leader heartbeat interval in milliseconds
    #[arg(long, default_value = "50")]
    heartbeat_interval_ms: u64,

    /// Maximum entries per append request
    #[arg(long, default_value = "100")]
    max_batch_size: usize,
}

impl ClusterArgs {
    fn node_config(&self) -> NodeConfig {
        NodeConfig {
            election_timeout_min_ms: self.election_timeout_min_ms,
            election_timeout_max_ms: self.election_timeout_max_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            max_batch_size: self.max_batch_size,
            ..NodeConfig::default()
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

type Store = BTreeMap<String, Value>;

fn key_of(args: &Value) -> Result<String, ConsensusError> {
    args.get("key")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ConsensusError::Application("missing key".to_string()))
}

fn kv_table() -> OperationTable<Store> {
    OperationTable::new()
        .command("put", |store: &mut Store, args| {
            let key = key_of(&args)?;
            let value = args.get("value").cloned().unwrap_or(Value::Null);
            Ok(store.insert(key, value).unwrap_or(Value::Null))
        })
        .command("delete", |store: &mut Store, args| {
            let key = key_of(&args)?;
            Ok(store.remove(&key).unwrap_or(Value::Null))
        })
        .query("get", Consistency::Strong, |store, args| {
            let key = key_of(&args)?;
            Ok(store.get(&key).cloned().unwrap_or(Value::Null))
        })
        .query("len", Consistency::Weak, |store, _| Ok(json!(store.len())))
}

async fn start_cluster(
    args: &ClusterArgs,
    shutdown: CancellationToken,
) -> Result<(LocalCluster, StateLogClient), Box<dyn std::error::Error>> {
    let catalog = kv_table().catalog();
    let cluster = LocalCluster::start(
        args.nodes,
        &args.node_config(),
        |_| StateLog::new(Store::new(), kv_table()).into_consumer(),
        shutdown,
    )
    .await?;

    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await?;
    let handle = cluster
        .node(leader)
        .cloned()
        .ok_or_else(|| format!("leader {} is not part of the cluster", leader))?;
    tracing::info!(leader, "Cluster elected a leader");

    Ok((cluster, StateLogClient::new(handle, catalog)))
}

#[derive(Serialize)]
struct DemoOutput {
    leader: u64,
    keys: u64,
    read_back: Value,
    nodes: Vec<NodeStatus>,
}

fn print_status_table(statuses: &[NodeStatus]) {
    println!(
        "{:<6} {:<10} {:<6} {:<8} {:<8} {:<8} {:<8}",
        "NODE", "ROLE", "TERM", "LEADER", "COMMIT", "APPLIED", "LAST"
    );
    for s in statuses {
        println!(
            "{:<6} {:<10} {:<6} {:<8} {:<8} {:<8} {:<8}",
            s.id,
            s.role,
            s.term,
            s.leader.map(|l| l.to_string()).unwrap_or_else(|| "-".to_string()),
            s.commit_index,
            s.last_applied,
            s.last_log_index
                .map(|i| i.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
}

async fn run_demo(
    cluster_args: ClusterArgs,
    writes: u64,
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let (cluster, client) = start_cluster(&cluster_args, CancellationToken::new()).await?;
    let leader = client.node().id();

    for i in 0..writes {
        let _: Value = client
            .submit("put", json!({ "key": format!("key-{}", i), "value": i }))
            .await?;
    }
    let read_back: Value = if writes > 0 {
        client
            .submit("get", json!({ "key": format!("key-{}", writes - 1) }))
            .await?
    } else {
        Value::Null
    };

    // Let followers learn the final commit index from a heartbeat.
    tokio::time::sleep(Duration::from_millis(cluster_args.heartbeat_interval_ms * 3)).await;
    let statuses = cluster.statuses().await;

    match output {
        OutputFormat::Table => {
            println!("Leader: node {}", leader);
            println!("Wrote {} keys, last value read back: {}", writes, read_back);
            println!();
            print_status_table(&statuses);
        }
        OutputFormat::Json => {
            let out = DemoOutput {
                leader,
                keys: writes,
                read_back,
                nodes: statuses,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }

    cluster.shutdown();
    Ok(())
}

async fn run_serve(
    cluster_args: ClusterArgs,
    report_interval_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;
    let (cluster, _client) = start_cluster(&cluster_args, shutdown.clone()).await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(report_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                for s in cluster.statuses().await {
                    tracing::info!(
                        node_id = s.id,
                        role = %s.role,
                        term = s.term,
                        leader = ?s.leader,
                        commit_index = s.commit_index,
                        last_applied = s.last_applied,
                        "Node status"
                    );
                }
            }
        }
    }

    cluster.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Demo {
            cluster,
            writes,
            output,
        } => run_demo(cluster, writes, output).await?,
        Commands::Serve {
            cluster,
            report_interval_secs,
        } => run_serve(cluster, report_interval_secs).await?,
    }

    Ok(())
}
