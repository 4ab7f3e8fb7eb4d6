//! Pilot - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pilot_foundation::{PilotConfig, StorageConfig};
use pilot_server::{run_plan, summary, RunOptions, Server};
use pilot_session::Registry;
use pilot_task::TaskStatus;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Pilot - control plane for an automated task-execution agent
#[derive(Parser, Debug)]
#[command(name = "pilot")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the WebSocket server
    Serve {
        /// Address to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Persist sessions in a SQLite database under this directory
        #[arg(long)]
        sqlite: Option<PathBuf>,
    },
    /// Run one plan file locally and stream its events to the terminal
    Run {
        /// Plan file (JSON array of steps, or {"title", "plan"})
        plan: PathBuf,

        /// Simulate every step without side effects
        #[arg(long)]
        dry_run: bool,

        /// Execute destructive steps without asking
        #[arg(long)]
        allow_destructive: bool,

        /// Approve every approval request automatically
        #[arg(long)]
        auto_approve: bool,

        /// Working directory for the steps (defaults to the current directory)
        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let mut config = PilotConfig::load().unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config: {}", e);
        PilotConfig::default()
    });

    match args.command {
        Command::Serve { host, port, sqlite } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = sqlite {
                config.storage = StorageConfig::Sqlite { data_dir };
            }
            serve(config).await
        }
        Command::Run {
            plan,
            dry_run,
            allow_destructive,
            auto_approve,
            workspace,
        } => {
            let workspace = match workspace {
                Some(dir) => dir,
                None => std::env::current_dir().context("Failed to read current directory")?,
            };
            let options = RunOptions {
                plan,
                workspace,
                dry_run,
                allow_destructive,
                auto_approve,
            };
            run(config, options).await
        }
    }
}

async fn serve(config: PilotConfig) -> Result<()> {
    let addr = config.server.addr();
    let registry = Arc::new(
        Registry::init(config)
            .await
            .context("Failed to initialize registry")?,
    );
    let server = Server::bind(&addr, Arc::clone(&registry)).await?;
    println!("Pilot listening on: ws://{}/stream", server.local_addr()?);

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            trigger.cancel();
        }
    });

    server.serve(shutdown).await?;
    registry.shutdown().await;
    Ok(())
}

async fn run(mut config: PilotConfig, options: RunOptions) -> Result<()> {
    // 로컬 실행은 항상 메모리 저장소
    config.storage = StorageConfig::Memory;
    let registry = Registry::init(config)
        .await
        .context("Failed to initialize registry")?;

    let result = run_plan(&registry, &options).await;
    registry.shutdown().await;

    let task = result?;
    if task.status != TaskStatus::Completed {
        anyhow::bail!("{}", summary(&task));
    }
    println!("{}", summary(&task));
    Ok(())
}
