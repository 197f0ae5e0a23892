//! CLI entry point for the dispatch core binary.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use mihomo_rust::{Config, Gateway, VERSION};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mihomo-rust")]
#[command(version = VERSION)]
#[command(about = "Rule-based proxy dispatch core")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Routing mode override: rule, global, or direct
    #[arg(long = "mode")]
    mode: Option<String>,

    /// Validate configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .max_blocking_threads(32)
        .enable_all()
        .event_interval(61)
        .global_queue_interval(31)
        .thread_name("mihomo-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mihomo_rust=info".parse()?),
        )
        .init();

    let args = Args::parse();

    info!("mihomo-rust dispatch core v{}", VERSION);
    info!("loading configuration from {}", args.config.display());

    let mut config = match Config::load(args.config.to_str().unwrap_or("config.yaml")) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(mode) = args.mode {
        config.mode = mode;
    }

    if args.test {
        info!("configuration test passed");
        return Ok(());
    }

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("failed to initialize gateway: {}", e);
            std::process::exit(1);
        }
    };

    gateway.run();
    info!("dispatch core running");

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");

    Ok(())
}
