//! Burrow agent CLI
//!
//! `burrow http` (the default) exposes a local HTTP endpoint through the
//! hub; `burrow tcp` exposes a raw TCP endpoint; `burrow init` writes a
//! starter config file.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use burrow_agent::{
    coalesce, config, derive_http_forward_address, derive_tcp_forward_address, parse_rules,
    run_with_reconnect, AgentError, Dispatcher, TunnelOptions, FATAL_AUTH_MARKER,
};
use burrow_proto::Protocol;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Expose local endpoints through a burrow hub
#[derive(Parser, Debug)]
#[command(name = "burrow", about = "Poor man's ngrok", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    // Without a subcommand these feed the default `http` mode.
    #[command(flatten)]
    tunnel: TunnelArgs,

    /// The path to the config file
    #[arg(short, long, global = true, default_value = "burrow.yml")]
    config: PathBuf,

    /// Whether to enable debug mode
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a config file
    Init(InitArgs),
    /// Start an HTTP proxy to local endpoints
    Http(TunnelArgs),
    /// Start a TCP proxy to a local address
    Tcp(TunnelArgs),
}

#[derive(Args, Debug, Clone, Default)]
struct TunnelArgs {
    /// The address of the remote SSH server
    #[arg(short = 'r', long)]
    remote_addr: Option<String>,

    /// The address to forward requests to
    #[arg(short = 'f', long)]
    forward_addr: Option<String>,

    /// The authentication token
    #[arg(short = 't', long, env = "BURROW_TOKEN")]
    token: Option<String>,

    /// Shorthand forward address
    #[arg(value_name = "FORWARD_ADDR")]
    forward: Option<String>,
}

#[derive(Args, Debug)]
struct InitArgs {
    /// The address of the remote SSH server
    #[arg(short = 'r', long, required = true)]
    remote_addr: String,

    /// The address to forward requests to
    #[arg(short = 'f', long, required = true)]
    forward_addr: String,

    /// The authentication token
    #[arg(short = 't', long, required = true)]
    token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        Some(Commands::Init(args)) => init(&cli.config, args),
        Some(Commands::Http(args)) => http(&cli.config, args).await,
        Some(Commands::Tcp(args)) => tcp(&cli.config, args).await,
        None => http(&cli.config, cli.tunnel).await,
    }
}

fn init(config_path: &Path, args: InitArgs) -> Result<()> {
    let config = format!(
        r#"# The address of the remote SSH server.
remote_addr: "{}"
# The address to forward requests to.
forward_addr: "{}"

# The authentication token.
token: "{}"

# Dynamic forward rules, with "forward_addr" as the catch-all.
#dynamic_forwards: |
#  /api http://localhost:8080
"#,
        args.remote_addr, args.forward_addr, args.token
    );
    std::fs::write(config_path, config)
        .with_context(|| format!("save config file {}", config_path.display()))?;
    info!(path = %config_path.display(), "config file saved");
    Ok(())
}

async fn http(config_path: &Path, args: TunnelArgs) -> Result<()> {
    let config = config::load(config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;

    let forward_addr = coalesce([
        derive_http_forward_address(args.forward.as_deref().unwrap_or_default()),
        derive_http_forward_address(args.forward_addr.as_deref().unwrap_or_default()),
        config.forward_addr.clone(),
    ]);

    let rules = parse_rules(&config.dynamic_forwards).context("parse dynamic forward rules")?;
    let dispatcher =
        Dispatcher::new(&forward_addr, rules).context("parse default forward address")?;
    info!(address = %forward_addr, "default forward");

    let capture_addr = dispatcher.spawn().await.context("start capture server")?;

    let opts = TunnelOptions {
        remote_addr: coalesce([args.remote_addr.unwrap_or_default(), config.remote_addr]),
        forward_addr: capture_addr.to_string(),
        token: coalesce([args.token.unwrap_or_default(), config.token]),
        protocol: Protocol::Http,
    };
    fatal(run_with_reconnect(opts).await)
}

async fn tcp(config_path: &Path, args: TunnelArgs) -> Result<()> {
    let config = config::load(config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;

    let forward_addr = coalesce([
        derive_tcp_forward_address(args.forward.as_deref().unwrap_or_default()),
        derive_tcp_forward_address(args.forward_addr.as_deref().unwrap_or_default()),
        config.forward_addr.clone(),
    ]);
    info!(address = %forward_addr, "forward");

    let opts = TunnelOptions {
        remote_addr: coalesce([args.remote_addr.unwrap_or_default(), config.remote_addr]),
        forward_addr,
        token: coalesce([args.token.unwrap_or_default(), config.token]),
        protocol: Protocol::Tcp,
    };
    fatal(run_with_reconnect(opts).await)
}

/// The reconnect loop only returns on unrecoverable errors.
fn fatal(err: AgentError) -> Result<()> {
    if err.to_string().contains(FATAL_AUTH_MARKER) {
        error!("please double check your token and try again");
    }
    bail!(err)
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
