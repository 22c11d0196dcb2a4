//! Optimization host: brings up the broker, accepts remote workers over
//! TCP, and drives demo submissions through a brokered executor.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use optforge::exit;
use optforge::sphere::{self, SphereCandidate};
use optforge_broker::{Broker, CancelHandle, Executor, ThreadPoolConsumer};
use optforge_core::{DispatchConfig, ItemStatus, WaitPolicyKind, WireFormat};
use optforge_net::TcpServerConsumer;

#[derive(Debug, Parser)]
#[command(
    name = "optforge-server",
    version,
    about = "optforge dispatch host: broker, TCP consumer and demo driver"
)]
struct Cli {
    /// JSON config file; individual flags override its values.
    #[arg(long, env = "OPTFORGE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "OPTFORGE_BIND")]
    bind_addr: Option<String>,

    #[arg(short = 'p', long, env = "OPTFORGE_PORT")]
    port: Option<u16>,

    /// I/O threads of the TCP consumer.
    #[arg(long, env = "OPTFORGE_TCP_THREADS")]
    tcp_threads: Option<usize>,

    /// Wire format spoken to remote workers (text, xml, binary).
    #[arg(long, env = "OPTFORGE_FORMAT", value_parser = parse_format)]
    format: Option<WireFormat>,

    /// Wait policy of the demo executor (complete, factor, fixed,
    /// resubmit_incomplete).
    #[arg(long, value_parser = parse_policy)]
    wait_policy: Option<WaitPolicyKind>,

    /// In-process evaluation workers next to the broker (0 = none).
    #[arg(long, default_value_t = 0)]
    local_workers: usize,

    /// Demo batches to run before exiting (0 = until interrupted).
    #[arg(long, default_value_t = 0)]
    demo_batches: u64,

    #[arg(long, default_value_t = 32)]
    demo_batch_size: usize,

    #[arg(long, default_value_t = 4)]
    demo_dimension: usize,

    /// Simulated evaluation cost per item, in milliseconds.
    #[arg(long, default_value_t = 10)]
    demo_eval_ms: u64,

    /// Drain grace granted to the broker at shutdown, in milliseconds.
    #[arg(long, default_value_t = 2_000)]
    drain_grace_ms: u64,
}

fn parse_format(raw: &str) -> Result<WireFormat, String> {
    raw.parse()
}

fn parse_policy(raw: &str) -> Result<WaitPolicyKind, String> {
    raw.parse()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        // Everything that can abort the server happens at bring-up: bad
        // config file, bad bind address, runtime construction.
        eprintln!("error: {err:#}");
        std::process::exit(i32::from(exit::CONFIG));
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut cfg = match &cli.config {
        Some(path) => DispatchConfig::load(path)?,
        None => DispatchConfig::default(),
    };
    if let Some(bind_addr) = cli.bind_addr {
        cfg.tcp.bind_addr = bind_addr;
    }
    if let Some(port) = cli.port {
        cfg.tcp.port = port;
    }
    if let Some(threads) = cli.tcp_threads {
        cfg.tcp.threads = threads;
    }
    if let Some(format) = cli.format {
        cfg.tcp.format = format;
    }
    if let Some(policy) = cli.wait_policy {
        cfg.executor.wait_policy = policy;
    }
    cfg.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        format = %cfg.tcp.format,
        "optforge-server starting"
    );

    let broker: Broker<SphereCandidate> = Broker::new(cfg.broker.clone());
    let server = TcpServerConsumer::new(cfg.tcp.clone());
    let bound = server.bound_addr();
    broker.enroll_consumer(Box::new(server))?;
    if let Some(addr) = bound.get() {
        info!(%addr, "accepting workers");
    }
    if cli.local_workers > 0 {
        broker.enroll_consumer(Box::new(ThreadPoolConsumer::new("local", cli.local_workers)))?;
    }

    let mut exec = Executor::brokered(cfg.executor.clone(), &broker)?;
    let stop = Arc::new(AtomicBool::new(false));
    spawn_interrupt_watcher(Arc::clone(&stop), exec.cancel_handle());

    let mut batch_no = 0u64;
    while !stop.load(Ordering::Acquire) {
        if cli.demo_batches > 0 && batch_no >= cli.demo_batches {
            break;
        }
        batch_no += 1;
        let mut batch = sphere::demo_batch(
            batch_no,
            cli.demo_batch_size,
            cli.demo_dimension,
            cli.demo_eval_ms,
        );
        let report = exec.submit(&mut batch);
        let best = batch
            .iter()
            .filter(|item| item.status() == ItemStatus::Processed)
            .flat_map(|item| item.results().first())
            .map(|pair| pair.raw)
            .fold(f64::INFINITY, f64::min);
        info!(
            batch = batch_no,
            processed = report.processed,
            flagged = report.error_flagged + report.except_flagged,
            timed_out = report.timed_out,
            rounds = report.resubmit_rounds,
            elapsed_ms = report.elapsed_ms,
            best,
            "batch complete"
        );
        if batch_no % 10 == 0 {
            let snapshot = broker.snapshot();
            tracing::debug!(
                state = ?snapshot.state,
                ports = snapshot.ports.len(),
                consumers = snapshot.consumers.len(),
                "broker status"
            );
        }
    }

    info!("shutting down");
    drop(exec);
    broker.shutdown(Duration::from_millis(cli.drain_grace_ms));
    Ok(())
}

/// Watch for an interrupt off the main thread; the main loop finishes (or
/// cancels) its current batch and drains.
fn spawn_interrupt_watcher(stop: Arc<AtomicBool>, cancel: CancelHandle) {
    std::thread::spawn(move || {
        let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        else {
            return;
        };
        if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            warn!("interrupt received; cancelling the in-flight batch");
            stop.store(true, Ordering::Release);
            cancel.cancel();
        }
    });
}
