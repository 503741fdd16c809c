use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use vertex::config::VertexConfig;
use vertex::containers::{Registry, Supervisor};
use vertex::events::EventBus;
use vertex::proxy::{ProxyRouter, RedirectStore};

#[derive(Parser)]
#[command(name = "vertex")]
#[command(about = "Vertex - Self-hosted service manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the lifecycle engine and the reverse proxy
    Serve {
        /// Storage root for containers, logs and proxy state
        #[arg(long, env = "VERTEX_STORAGE", default_value = "live")]
        storage: String,

        /// Address the reverse proxy listens on
        #[arg(long, env = "VERTEX_PROXY_ADDR", default_value = "0.0.0.0:7508")]
        proxy_addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            storage,
            proxy_addr,
        } => serve(storage, proxy_addr).await,
    }
}

async fn serve(storage: String, proxy_addr: SocketAddr) -> Result<()> {
    let config = VertexConfig::new(&storage);
    vertex::logging::init_logging(&config.storage_path().join("logs"))?;

    info!(storage = %config.storage_path().display(), "starting vertex");

    let bus = EventBus::new();
    let registry = Arc::new(Registry::new(bus.clone()));
    let supervisor = Arc::new(Supervisor::new(config.clone(), registry, bus)?);

    supervisor.load_all().await?;
    supervisor.start_enabled().await;

    let redirects = Arc::new(RedirectStore::new(config.proxy_path())?);
    let proxy = ProxyRouter::new(redirects);
    proxy.start(proxy_addr).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    supervisor.shutdown().await;
    proxy.stop().await;

    Ok(())
}
