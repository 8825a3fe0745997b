//! maglev-node - Node daemon provisioning MagLev stones for a service broker

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use single_instance::SingleInstance;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use maglev_node::core::MemoryLedger;
use maglev_node::persistence::RecordStore;
use maglev_node::{platform, service, Node, NodeConfig, APP_NAME, APP_VERSION};

#[derive(Debug, Parser)]
#[command(name = "maglev-node", version, about = "Provision and supervise MagLev stones")]
struct Cli {
    /// Path to the node configuration (JSON)
    #[arg(short, long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Restart known stones and serve broker requests on stdin/stdout
    Serve,
    /// List provisioned stones without starting anything
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = NodeConfig::load(&cli.config)?;

    init_logging(config.debug_logging);
    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    match cli.command {
        Command::Serve => serve(config),
        Command::Status => status(&config),
    }
}

/// Initialize the logging system
fn init_logging(debug: bool) {
    let default = if debug {
        "maglev_node=debug"
    } else {
        "maglev_node=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn serve(config: NodeConfig) -> Result<()> {
    // Two daemons on one host would both restart and account for the same stones
    let lock_name = format!("{}-{}", APP_NAME, config.node_id);
    let instance = SingleInstance::new(&lock_name).context("Failed to create single instance lock")?;
    if !instance.is_single() {
        error!("Another {} is already running as {}", APP_NAME, config.node_id);
        anyhow::bail!("{} already running", lock_name);
    }

    let node = Arc::new(Node::initialize(config).context("Failed to initialize node")?);

    let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
    let served = runtime.block_on(run(Arc::clone(&node)));
    // a pending stdin read would otherwise hold up the runtime drop
    runtime.shutdown_background();

    node.shutdown();
    info!("{} shutting down", APP_NAME);
    served
}

async fn run(node: Arc<Node>) -> Result<()> {
    let input = BufReader::new(tokio::io::stdin());
    let output = tokio::io::stdout();

    // an in-flight request is finished before this returns
    service::serve(node, input, output, shutdown_signal())
        .await
        .context("Request loop failed")?;
    Ok(())
}

async fn shutdown_signal() {
    wait_for_signal().await;
    info!("Shutdown signal received");
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn status(config: &NodeConfig) -> Result<()> {
    let store = RecordStore::open(&config.get_local_db()).context("Failed to open record store")?;
    store.initialize()?;

    let (records, invalid) = store.all_lenient()?;
    let mut ledger = MemoryLedger::new(config.available_memory);
    let mut running = Vec::new();

    println!("{:<44} {:<6} {:>6} {:>8} {:<7}", "NAME", "PLAN", "MEMORY", "PID", "RUNNING");
    for record in &records {
        let alive = record.pid.is_some_and(platform::is_process_running);
        if alive {
            running.push((record.name.clone(), record.memory));
        }
        println!(
            "{:<44} {:<6} {:>6} {:>8} {:<7}",
            record.name,
            record.plan.label(),
            record.memory,
            record.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            if alive { "yes" } else { "no" }
        );
    }
    for (name, e) in &invalid {
        println!("{:<44} unreadable: {}", name, e);
    }

    ledger.reconcile(running);
    println!(
        "{} stones, {} of {} memory held by running stones ({:.1}%)",
        records.len() + invalid.len(),
        ledger.used(),
        ledger.total(),
        ledger.usage_percent()
    );
    Ok(())
}
