//! Remote evaluation worker: connects to an optforge server and serves the
//! pull/evaluate/return loop until told to stop.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use optforge::exit;
use optforge::sphere::SphereCandidate;
use optforge_core::{ConfigError, DispatchConfig, WireFormat};
use optforge_net::{ClientError, WorkerClient};

#[derive(Debug, Parser)]
#[command(
    name = "optforge-worker",
    version,
    about = "optforge remote evaluation worker"
)]
struct Cli {
    /// JSON config file; individual flags override its values.
    #[arg(long, env = "OPTFORGE_CONFIG")]
    config: Option<PathBuf>,

    /// host:port of the dispatch server.
    #[arg(short = 's', long, env = "OPTFORGE_SERVER")]
    server: Option<String>,

    /// Preferred wire format; the server's answer wins.
    #[arg(long, env = "OPTFORGE_FORMAT", value_parser = parse_format)]
    format: Option<WireFormat>,

    /// Connection attempts before giving up (0 = unlimited).
    #[arg(long)]
    reconnect_max: Option<u32>,

    #[arg(long)]
    backoff_base_ms: Option<u64>,

    #[arg(long)]
    backoff_cap_ms: Option<u64>,

    /// Exit cleanly after this many consecutive NODATA replies (0 = never).
    #[arg(long)]
    stall_cap: Option<u32>,

    /// Exit cleanly after processing this many items (0 = unlimited).
    #[arg(long)]
    max_items: Option<u64>,
}

fn parse_format(raw: &str) -> Result<WireFormat, String> {
    raw.parse()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(i32::from(exit_code(&err)));
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ConfigError>().is_some() {
        return exit::CONFIG;
    }
    match err.downcast_ref::<ClientError>() {
        Some(ClientError::ReconnectExhausted { .. }) => exit::RECONNECT,
        Some(_) => exit::PROTOCOL,
        None => exit::CONFIG,
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut cfg = match &cli.config {
        Some(path) => DispatchConfig::load(path)?,
        None => DispatchConfig::default(),
    };
    if let Some(server) = cli.server {
        cfg.client.server_addr = server;
    }
    if let Some(format) = cli.format {
        cfg.client.format = format;
    }
    if let Some(reconnect_max) = cli.reconnect_max {
        cfg.client.reconnect_max = reconnect_max;
    }
    if let Some(base) = cli.backoff_base_ms {
        cfg.client.backoff_base_ms = base;
    }
    if let Some(cap) = cli.backoff_cap_ms {
        cfg.client.backoff_cap_ms = cap;
    }
    if let Some(stall_cap) = cli.stall_cap {
        cfg.client.stall_cap = stall_cap;
    }
    if let Some(max_items) = cli.max_items {
        cfg.client.max_items = max_items;
    }
    cfg.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %cfg.client.server_addr,
        "optforge-worker starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; stopping after the current item");
            let _ = shutdown_tx.send(true);
        }
    });

    let report = WorkerClient::<SphereCandidate>::new(cfg.client)
        .run(shutdown_rx)
        .await?;
    info!(
        items = report.items_processed,
        reason = ?report.stop,
        "worker finished"
    );
    Ok(())
}
