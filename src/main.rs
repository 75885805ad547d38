//! GoBox backend
//!
//! Bridges a single interactive terminal session (a PTY attached to a
//! container or host) to UI clients over WebSocket, and provides the
//! repository folder fetcher and directory tree export used by the desktop
//! tool.

mod config;
mod events;
mod fetch;
mod pty;
mod server;
mod terminal;
mod tree;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use config::BridgeConfig;
use events::EventBus;
use fetch::{FetchOptions, RepoFetcher};
use server::{ServerConfig, WebSocketServer};
use terminal::{spawn_input_router, SessionManager};

/// GoBox backend
///
/// Terminal session bridge, GitHub folder fetcher and directory tree export
#[derive(Parser, Debug)]
#[command(name = "gobox")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the WebSocket terminal bridge
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address
        #[arg(long)]
        bind: Option<String>,

        /// Config file (defaults to .gobox/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Download folders from a GitHub repository
    Fetch {
        /// Repository URL, e.g. https://github.com/user/repo
        repo_url: String,

        /// Branch to fetch from
        #[arg(short, long)]
        branch: Option<String>,

        /// Destination directory
        #[arg(short, long, default_value = ".")]
        dest: PathBuf,

        /// Folder to download; repeat for several. Defaults to all top-level entries.
        #[arg(short, long = "folder")]
        folders: Vec<String>,

        /// Only consider directories when listing the repository root
        #[arg(long)]
        only_dirs: bool,

        /// Overwrite files that already exist
        #[arg(long)]
        overwrite: bool,

        /// Config file (defaults to .gobox/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print a directory tree as JSON
    Tree {
        /// Root directory
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    match args.command {
        Command::Serve { port, bind, config } => {
            let mut settings = load_config(config)?;
            if let Some(port) = port {
                settings.server.port = port;
            }
            if let Some(bind) = bind {
                settings.server.bind = bind;
            }
            serve(settings).await
        }
        Command::Fetch {
            repo_url,
            branch,
            dest,
            folders,
            only_dirs,
            overwrite,
            config,
        } => {
            let settings = load_config(config)?;
            let fetcher = RepoFetcher::new(&settings.fetch)?;
            let options = FetchOptions::new(repo_url, dest)
                .with_branch(branch.unwrap_or(settings.fetch.default_branch))
                .with_folders(folders)
                .only_dirs(only_dirs)
                .overwrite(overwrite)
                .on_progress(|percent, message| eprintln!("[{:>3}%] {}", percent, message));
            fetcher.fetch_repo_folders(options).await?;
            Ok(())
        }
        Command::Tree { path } => {
            let tree = tree::dir_to_tree(&path)?;
            println!("{}", tree.to_json_pretty()?);
            Ok(())
        }
    }
}

/// Load the config file, or defaults when it does not exist
fn load_config(path: Option<PathBuf>) -> anyhow::Result<BridgeConfig> {
    let path = match path {
        Some(path) => path,
        None => BridgeConfig::default_path(&std::env::current_dir()?),
    };
    BridgeConfig::load(&path).with_context(|| format!("loading {}", path.display()))
}

async fn serve(settings: BridgeConfig) -> anyhow::Result<()> {
    info!("GoBox bridge v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    let bus = EventBus::default();
    let manager = Arc::new(SessionManager::new(
        settings.terminal.command(),
        settings.terminal.size(),
        Arc::new(bus.clone()),
    ));
    let router = spawn_input_router(&bus, Arc::clone(&manager), shutdown.clone());

    let config = ServerConfig::new(settings.server.bind, settings.server.port);
    let server = WebSocketServer::new(config, manager, bus, shutdown.clone());

    // Spawn shutdown signal handler
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        signal_token.cancel();
    });

    server.run().await?;
    router.await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
