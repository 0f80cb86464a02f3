//! icebox service binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use icebox::config::Config;
use icebox::constants::REGISTRY_DB_FILENAME;
use icebox::http::{router, AppState};
use icebox::notify::FreezeNotifier;
use icebox::registry::Registry;
use icebox::service::CoreService;
use icebox::store::ObjectStore;

#[derive(Parser)]
#[command(name = "icebox", version, about = "Research-data storage service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve {
        /// Config file path (default: <icebox_dir>/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
        /// Override the configured data root
        #[arg(long)]
        data_root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            port,
            data_root,
        } => serve(config, port, data_root).await,
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

async fn serve(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    data_root: Option<PathBuf>,
) -> Result<()> {
    let config = match config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let data_root = match data_root {
        Some(root) => root,
        None => config.storage.resolve_data_root()?,
    };
    let port = port.unwrap_or(config.server.port);

    tracing::info!(data_root = %data_root.display(), "Opening object store");
    let store = ObjectStore::open(&data_root)?;
    let registry = Registry::open(data_root.join(REGISTRY_DB_FILENAME))?;

    let (notifier, mut notices) = FreezeNotifier::channel();
    // Downstream agents attach here; until then, frozen data is announced
    // in the log only.
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            tracing::info!(
                target: "audit",
                event_type = "data_frozen",
                project = %notice.project,
                pathname = %notice.pathname,
                action_id = %notice.action_id,
                "Frozen data available"
            );
        }
    });

    let service = CoreService::new(store, registry, notifier);
    let app = router(AppState {
        service,
        auth: config.auth.clone(),
    });

    let addr: SocketAddr = format!("{}:{port}", config.server.bind)
        .parse()
        .context("Invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    tracing::info!(%addr, "icebox listening");
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
