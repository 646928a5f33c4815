//! CLI harness driving the compact block processor against a lightwalletd
//! endpoint
//!
//! - Full sync from the wallet birthday with a progress bar
//! - Interrupt/resume (Ctrl-C or `--interrupt-after`)
//! - Rewind and wipe of local state

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use lightwallet_params::NetworkType;
use lightwallet_sync::{
    BlockService, BlockStore, CompactBlockProcessor, EventLogger, LightwalletdConfig,
    LightwalletdService, ProcessorConfig, ProcessorEvent, RewindPolicy, ViewingKey, WalletBackend,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sync-harness")]
#[command(about = "Compact block sync harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync from the wallet birthday (or last scanned height) to the tip
    Sync {
        #[command(flatten)]
        wallet: WalletArgs,

        /// Stop the run after N seconds
        #[arg(long)]
        interrupt_after: Option<u64>,

        /// Fail on the first error instead of retrying
        #[arg(long)]
        no_retry: bool,
    },

    /// Print the chain tip and server info
    Latest {
        /// Lightwalletd endpoint
        #[arg(short, long, default_value = "https://mainnet.lightwalletd.com:9067")]
        endpoint: String,
    },

    /// Rewind scanned state and cached blocks
    Rewind {
        #[command(flatten)]
        wallet: WalletArgs,

        /// Keep state up to this height (defaults to the birthday)
        #[arg(long, conflicts_with = "quick")]
        height: Option<u64>,

        /// Step back by the configured rewind distance
        #[arg(long)]
        quick: bool,
    },

    /// Delete cached blocks and wallet state
    Wipe {
        #[command(flatten)]
        wallet: WalletArgs,
    },
}

#[derive(Args)]
struct WalletArgs {
    /// Lightwalletd endpoint
    #[arg(short, long, default_value = "https://mainnet.lightwalletd.com:9067")]
    endpoint: String,

    /// Network
    #[arg(short, long, default_value = "mainnet")]
    network: NetworkType,

    /// Wallet birthday height
    #[arg(short, long, default_value = "419200")]
    birthday: u64,

    /// Unified full viewing key (repeat for more accounts)
    #[arg(short = 'k', long = "viewing-key", required = true)]
    viewing_keys: Vec<String>,

    /// Directory for the wallet database and block cache
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// JSON processor config
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sync {
            wallet,
            interrupt_after,
            no_retry,
        } => run_sync(wallet, interrupt_after, !no_retry).await,
        Commands::Latest { endpoint } => run_latest(endpoint).await,
        Commands::Rewind {
            wallet,
            height,
            quick,
        } => {
            let policy = match (height, quick) {
                (_, true) => RewindPolicy::Quick,
                (Some(height), false) => RewindPolicy::Height(height),
                (None, false) => RewindPolicy::Birthday,
            };
            run_rewind(wallet, policy).await
        }
        Commands::Wipe { wallet } => run_wipe(wallet).await,
    }
}

async fn open_processor(args: &WalletArgs) -> anyhow::Result<CompactBlockProcessor> {
    let mut config = match &args.config {
        Some(path) => ProcessorConfig::load(path)?,
        None => ProcessorConfig::for_network(args.network),
    }
    .with_env_overrides()?;
    if let Some(dir) = &args.data_dir {
        config.wallet_db_path = dir.join("wallet.db");
        config.block_cache_path = Some(dir.join("compact_blocks.db"));
    }

    let service = Arc::new(LightwalletdService::new(LightwalletdConfig::new(
        args.endpoint.clone(),
    )));
    let store = match &config.block_cache_path {
        Some(path) => BlockStore::open(path)?,
        None => BlockStore::for_endpoint(&args.endpoint)?,
    };
    info!(
        "Wallet db: {} | block cache: {}",
        config.wallet_db_path.display(),
        store
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "memory".to_string())
    );
    let backend = Arc::new(WalletBackend::open(&config.wallet_db_path)?);

    let processor = CompactBlockProcessor::new(service, backend, store, config)?;
    let keys: Vec<ViewingKey> = args
        .viewing_keys
        .iter()
        .map(|k| ViewingKey(k.clone()))
        .collect();
    processor.prepare(None, &keys, args.birthday).await?;
    Ok(processor)
}

async fn run_sync(args: WalletArgs, interrupt_after: Option<u64>, retry: bool) -> anyhow::Result<()> {
    info!("Starting sync from birthday {} via {}", args.birthday, args.endpoint);
    let processor = open_processor(&args).await?;

    let logger = EventLogger::new().spawn(processor.subscribe());
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    );
    let progress_task = tokio::spawn(drive_progress(
        processor.clone(),
        processor.subscribe(),
        pb.clone(),
    ));

    processor.start(retry)?;
    let interrupt = async {
        match interrupt_after {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    let outcome = tokio::select! {
        outcome = processor.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping sync");
            processor.stop().await;
            Ok(processor.state())
        }
        _ = interrupt => {
            warn!("Interrupt timer fired, stopping sync");
            processor.stop().await;
            Ok(processor.state())
        }
    };

    progress_task.await?;
    let logger = logger.await?;
    let metrics = logger.metrics();
    if let (Some(avg), Some(min), Some(max)) = (
        metrics.average_duration(),
        metrics.min_duration(),
        metrics.max_duration(),
    ) {
        info!(
            "Batches: {} | blocks: {} | batch time avg {:?}, min {:?}, max {:?}",
            metrics.batches(),
            metrics.blocks(),
            avg,
            min,
            max
        );
    }

    match outcome {
        Ok(state) => {
            pb.finish_with_message(format!("{}", state));
            info!("Sync ended in state {}", state);
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message("failed");
            Err(e.into())
        }
    }
}

async fn drive_progress(
    processor: CompactBlockProcessor,
    mut events: broadcast::Receiver<ProcessorEvent>,
    pb: ProgressBar,
) {
    let mut start = None;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match &event {
            ProcessorEvent::StateChanged { to, .. } => pb.set_message(to.to_string()),
            ProcessorEvent::Progress(report) => {
                let first = *start.get_or_insert(report.start_height);
                if let Ok(Some(progress)) = processor.download_progress() {
                    pb.set_length(progress.target_height.saturating_sub(first) + 1);
                }
                pb.set_position(report.end_height.saturating_sub(first) + 1);
            }
            _ => {}
        }
        if event.is_terminal() {
            break;
        }
    }
}

async fn run_latest(endpoint: String) -> anyhow::Result<()> {
    let service = LightwalletdService::new(LightwalletdConfig::new(endpoint.clone()));
    let height = service.latest_block_height().await?;
    let info = service.lightd_info().await?;
    info!(
        "{}: chain {} tip {} (server {} {})",
        endpoint, info.chain_name, height, info.vendor, info.version
    );
    Ok(())
}

async fn run_rewind(args: WalletArgs, policy: RewindPolicy) -> anyhow::Result<()> {
    let processor = open_processor(&args).await?;
    let height = processor.rewind(policy).await?;
    info!("Rewound to height {}", height);
    Ok(())
}

async fn run_wipe(args: WalletArgs) -> anyhow::Result<()> {
    let processor = open_processor(&args).await?;
    processor.wipe().await?;
    info!("Wiped wallet state and block cache");
    Ok(())
}
