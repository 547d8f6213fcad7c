//! Burrow hub daemon
//!
//! Runs the three hub servers: the secure-shell endpoint for agents, the
//! public HTTP proxy, and the web server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use burrow_db::Store;
use burrow_hub::{config, proxy, web, HubServer};
use burrow_router::Cluster;
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Burrow hub daemon - accepts agent tunnels and serves public traffic
#[derive(Parser, Debug)]
#[command(name = "burrowd", about = "Run the burrow hub", version)]
struct Cli {
    /// The path to the config file
    #[arg(short, long, default_value = "burrowd.yml")]
    config: PathBuf,

    /// Whether to enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = Arc::new(
        config::load(&cli.config)
            .with_context(|| format!("load config {}", cli.config.display()))?,
    );

    info!(config = %cli.config.display(), "config loaded");

    let store = Store::connect(&config.database.url)
        .await
        .context("connect to database")?;
    store.migrate().await.context("run migrations")?;

    let cluster = Arc::new(Cluster::new());

    let sshd = tokio::spawn(HubServer::new(config.clone(), store.clone(), cluster.clone()).run());
    let proxy = tokio::spawn(proxy::serve(config.proxy.port, cluster.clone()));
    let web = tokio::spawn(web::serve(config.web.port));

    tokio::select! {
        result = sshd => result?.context("sshd server")?,
        result = proxy => result?.context("proxy server")?,
        result = web => result?.context("web server")?,
    }
    bail!("server exited unexpectedly")
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
