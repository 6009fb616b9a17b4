//! Conveyor node runner.
//!
//! Starts the pipeline described by the configuration file, feeds it demo
//! batches, and keeps the node alive until a signal or loss of health.
//! Exit codes: 0 clean shutdown, 1 startup error, signal number after a
//! trapped SIGINT/SIGTERM and a graceful stop.

mod logging;

use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use clap::Parser;

use conveyor_core::record::Record;
use conveyor_core::system::ProcessingSystem;
use conveyor_core::{PipelineConfig, RunOutcome, SupervisorSpec};

/// Demo batches fed through the pipeline after startup.
const DEMO_BATCH_SIZE: usize = 100;

/// Signal number observed by the handlers; 0 while none arrived.
static SIGNAL: AtomicI32 = AtomicI32::new(0);

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Fault-tolerant batch pipeline node")]
#[command(version)]
struct Cli {
    /// Unique id of this node.
    node_id: String,

    /// Address this node binds to.
    ip: String,

    /// Port this node binds to.
    port: u16,

    /// Seed node address for cluster discovery.
    seed_ip: Option<String>,

    /// Seed node port for cluster discovery.
    seed_port: Option<u16>,

    /// Pipeline configuration file.
    #[arg(long, default_value = "config/basic_pipeline.txt")]
    config: PathBuf,

    /// Write a sample configuration to the --config path and exit.
    #[arg(long)]
    init_config: bool,

    /// Number of demo batches to feed through the pipeline.
    #[arg(long, default_value_t = 100)]
    batches: u32,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    // A bad invocation is a startup error, not a usage error.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            std::process::exit(1);
        }
    };

    logging::init(if cli.verbose { "debug" } else { "info" });
    install_signal_handlers();

    match run(cli) {
        Ok(()) => {
            let signal = SIGNAL.load(Ordering::Relaxed);
            if signal != 0 {
                std::process::exit(signal);
            }
        }
        Err(error) => {
            tracing::error!(%error, "startup failed");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> conveyor_core::Result<()> {
    if cli.init_config {
        PipelineConfig::write_sample(&cli.config)?;
        tracing::info!(path = %cli.config.display(), "sample configuration written");
        return Ok(());
    }

    tracing::info!(
        node = %cli.node_id,
        address = %format!("{}:{}", cli.ip, cli.port),
        config = %cli.config.display(),
        "starting conveyor node"
    );

    let config = PipelineConfig::load(&cli.config)?;
    let system = ProcessingSystem::new(
        &cli.node_id,
        config,
        SupervisorSpec::default(),
        DEMO_BATCH_SIZE,
        4,
    )?;
    system.start()?;

    if let (Some(seed_ip), Some(seed_port)) = (&cli.seed_ip, cli.seed_port) {
        tracing::info!(
            seed = %format!("{seed_ip}:{seed_port}"),
            "cluster discovery is not active on this build; running standalone"
        );
    }

    feed_demo_batches(&system, cli.batches);

    tracing::info!("\n{}", system.status_report());
    tracing::info!("node running; send SIGINT or SIGTERM to stop");

    while SIGNAL.load(Ordering::Relaxed) == 0 {
        std::thread::sleep(Duration::from_secs(1));
        if !system.is_healthy() {
            tracing::error!("no healthy stages left, shutting down");
            break;
        }
    }

    system.stop();
    tracing::info!("node stopped");
    Ok(())
}

/// Push synthetic batches through the pipeline, the same shape the original
/// data feed produces.
fn feed_demo_batches(system: &ProcessingSystem, batches: u32) {
    for batch_index in 0..batches {
        if SIGNAL.load(Ordering::Relaxed) != 0 {
            return;
        }

        let mut batch = system.create_batch();
        batch.set_batch_id(batch_index as i32);
        for offset in 0..DEMO_BATCH_SIZE {
            let id = batch_index as i32 * DEMO_BATCH_SIZE as i32 + offset as i32 + 1;
            let value = ((id * 37) % 10_000) as f64 / 100.0;
            let category = (id % 10) + 1;
            batch.push(Record::new(id, &format!("Record_{id:05}"), value, category));
        }

        match system.process_batch(&mut batch) {
            RunOutcome::Ok => {
                if batch_index % 10 == 0 {
                    tracing::info!(batch = batch_index, "batch processed");
                }
            }
            RunOutcome::Aborted { stage, reason } => {
                tracing::error!(
                    batch = batch_index,
                    %stage,
                    kind = reason.kind(),
                    %reason,
                    "batch aborted"
                );
            }
        }
        system.free_batch(batch);

        std::thread::sleep(Duration::from_millis(100));
    }
}

extern "C" fn on_signal(signal: libc::c_int) {
    // Flag only; the run loop does the actual stopping.
    SIGNAL.store(signal, Ordering::Relaxed);
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}
