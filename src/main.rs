use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use ulid::Ulid;
use uuid::Uuid;

use shoal::item::{Identifier, ItemKind, Payload, QueueItem};
use shoal::processor::{Processor, RunError, RunInfo};
use shoal::queue_shard::{EnqueueOptions, QueueShard, STATUS_IN_PROGRESS, STATUS_QUEUED, ShardOptions};
use shoal::settings::AppConfig;
use shoal::tenant::StaticTenantConfig;

#[derive(Parser, Debug)]
#[command(name = "shoal", version, about = "Durable function queue")]
struct Args {
    /// path to a TOML config file
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the processor until interrupted. Items are logged and acknowledged.
    Run,
    /// Enqueue one item
    Enqueue {
        #[arg(long)]
        function: Uuid,
        #[arg(long)]
        account: Uuid,
        /// Caller-supplied id; hashed before storage
        #[arg(long)]
        id: Option<String>,
        /// Delay before the item becomes visible, in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: i64,
        /// JSON payload
        #[arg(long, default_value = "null")]
        payload: String,
    },
    /// Requeue items whose lease expired
    Scavenge {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Print queue counts for a function
    Stats {
        #[arg(long)]
        function: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = AppConfig::load(args.config.as_deref())?;
    shoal::trace::init(cfg.logging.format)?;

    let metrics = if cfg.metrics.enabled {
        Some(shoal::metrics::init()?)
    } else {
        None
    };
    let tenants = Arc::new(StaticTenantConfig::from_settings(&cfg.tenants));
    let mut options = ShardOptions::new(tenants);
    options.queue = cfg.queue.clone();
    options.metrics = metrics.clone();
    let shard = QueueShard::open(&cfg.database, options).await?;

    let result = match args.command {
        Command::Run => run(Arc::clone(&shard), &cfg, metrics).await,
        Command::Enqueue {
            function,
            account,
            id,
            delay_ms,
            payload,
        } => {
            let mut data = Payload::new(
                ItemKind::Start,
                Identifier {
                    run_id: Ulid::new(),
                    function_id: function,
                    function_version: 1,
                    account_id: account,
                    env_id: Uuid::nil(),
                    app_id: Uuid::nil(),
                    idempotency_key: None,
                },
            );
            data.payload = serde_json::from_str(&payload)?;
            let mut item = QueueItem::new(data);
            if let Some(id) = id {
                item = item.with_id(id);
            }
            let at_ms = shard.now_ms() + delay_ms;
            let stored = shard.enqueue(item, at_ms, EnqueueOptions::default()).await?;
            println!("{}", stored.id);
            Ok(())
        }
        Command::Scavenge { limit } => {
            let requeued = shard.scavenge(limit).await?;
            println!("requeued {requeued}");
            Ok(())
        }
        Command::Stats { function } => {
            let queued = shard.status_count(function, STATUS_QUEUED).await?;
            let in_progress = shard.status_count(function, STATUS_IN_PROGRESS).await?;
            let running = shard.running_count(function).await?;
            println!("queued={queued} in_progress={in_progress} running={running}");
            Ok(())
        }
    };

    shard.close().await?;
    result
}

async fn run(
    shard: Arc<QueueShard>,
    cfg: &AppConfig,
    metrics: Option<shoal::metrics::Metrics>,
) -> anyhow::Result<()> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let cancel = CancellationToken::new();

    let metrics_task = match metrics {
        Some(metrics) => {
            let addr: SocketAddr = cfg.metrics.addr.parse()?;
            let shutdown = shutdown_tx.subscribe();
            Some(tokio::spawn(async move {
                if let Err(e) = shoal::metrics::run_metrics_server(addr, metrics, shutdown).await {
                    error!(error = %e, "metrics server failed");
                }
            }))
        }
        None => None,
    };

    {
        let cancel = cancel.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(());
            cancel.cancel();
        });
    }

    let processor = Processor::new(shard);
    let handler = |info: RunInfo, item: QueueItem| async move {
        info!(id = %item.id, partition = %info.partition_id, kind = item.data.kind.as_str(), latency_ms = info.latency_ms, "ran item");
        Ok::<(), RunError>(())
    };
    processor.run(Arc::new(handler), cancel).await?;

    if let Some(task) = metrics_task {
        let _ = task.await;
    }
    Ok(())
}
