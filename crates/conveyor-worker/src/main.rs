//! The isolated worker process.
//!
//! One worker hosts one pipeline stage: it maps the stage's shared region,
//! loads the plugin library, and serves a request/response loop over its
//! stdio stream channels. A crash or hang in the plugin takes down only
//! this process; the coordinator's supervisor decides what happens next.

mod plugin;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;

use conveyor_core::codec::{self, BATCH_HEADER_LEN};
use conveyor_core::error::{Error, Result};
use conveyor_core::ipc::{FrameHeader, MsgType, SharedRegion, StreamChannel, BATCH_FRAME_OFFSET};
use conveyor_core::plugin::RESULT_CODEC_ERROR;
use conveyor_core::record::Batch;

use plugin::{LoadedPlugin, PluginCtx};

/// How often the request loop polls for frames and the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Request frames carry at most a frame-length payload.
const REQUEST_MAX_BYTES: usize = 1024;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "conveyor-worker")]
#[command(about = "Isolated worker process for one Conveyor pipeline stage")]
struct Args {
    /// Stage name, used for logging only.
    #[arg(long)]
    stage: String,

    /// Path to the plugin shared library.
    #[arg(long)]
    plugin: PathBuf,

    /// Plugin configuration as a key=value,... string.
    #[arg(long, default_value = "")]
    params: String,

    /// Name of the shared-memory region created by the coordinator.
    #[arg(long)]
    shm: String,

    /// Size of the shared-memory region in bytes.
    #[arg(long)]
    shm_size: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();
    let stage = args.stage.clone();
    match run(args) {
        Ok(()) => {
            tracing::info!(%stage, "worker exiting cleanly");
        }
        Err(error) => {
            tracing::error!(%stage, %error, "worker failed");
            std::process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<()> {
    install_signal_handlers();

    let requests = StreamChannel::from_borrowed_fds(Some(0), None)?;
    let responses = StreamChannel::from_borrowed_fds(None, Some(1))?;
    let shm = SharedRegion::open(&args.shm, args.shm_size)?;

    let storage_capacity = args
        .shm_size
        .saturating_sub(BATCH_FRAME_OFFSET + BATCH_HEADER_LEN)
        / codec::RECORD_WIRE_LEN;

    let loaded = LoadedPlugin::load(&args.plugin)?;
    if let Some(name) = loaded.info("name") {
        let version = loaded.info("version").unwrap_or_default();
        tracing::info!(stage = %args.stage, plugin = %name, %version, "plugin loaded");
    }
    let mut ctx = loaded.init(&args.params)?;

    tracing::info!(
        stage = %args.stage,
        pid = std::process::id(),
        region = %args.shm,
        "worker ready"
    );

    serve(&requests, &responses, &shm, &loaded, &mut ctx, storage_capacity);

    loaded.cleanup(&mut ctx);
    Ok(())
}

/// The request loop. Exits on a shutdown frame, a trapped signal, or loss
/// of the request channel.
fn serve(
    requests: &StreamChannel,
    responses: &StreamChannel,
    shm: &SharedRegion,
    loaded: &LoadedPlugin,
    ctx: &mut PluginCtx,
    storage_capacity: usize,
) {
    let my_id = std::process::id() as i32;

    loop {
        if SHUTDOWN.load(Ordering::Relaxed) {
            tracing::info!("shutdown signal received");
            return;
        }

        let (header, _payload) =
            match requests.recv_frame(REQUEST_MAX_BYTES, Some(Instant::now() + POLL_INTERVAL)) {
                Ok(frame) => frame,
                Err(Error::Timeout) => continue,
                Err(error) => {
                    tracing::info!(%error, "request channel closed, exiting");
                    return;
                }
            };

        match header.msg_type {
            MsgType::Shutdown => {
                tracing::info!("shutdown requested by coordinator");
                return;
            }
            MsgType::HealthCheck => {
                let reply = FrameHeader::new(MsgType::BatchResult, header.sender_id, my_id, 0);
                let _ = responses.send_frame(reply, None);
            }
            MsgType::ProcessBatch => {
                let code = handle_batch(shm, loaded, ctx, storage_capacity);
                let reply = FrameHeader::new(MsgType::BatchResult, header.sender_id, my_id, 4);
                let _ = responses.send_frame(reply, Some(&code.to_le_bytes()));
            }
            MsgType::BatchResult => {
                tracing::warn!("ignoring unexpected batch-result frame");
            }
        }
    }
}

/// Decode the batch from the shared region, run the plugin over it, and
/// write the post-image back. Any codec problem maps to the reserved error
/// code; the loop keeps serving.
fn handle_batch(
    shm: &SharedRegion,
    loaded: &LoadedPlugin,
    ctx: &mut PluginCtx,
    storage_capacity: usize,
) -> i32 {
    let mut header = [0u8; BATCH_HEADER_LEN];
    if shm.read(BATCH_FRAME_OFFSET, &mut header).is_err() {
        return RESULT_CODEC_ERROR;
    }
    let count = u64::from_le_bytes(header[0..8].try_into().unwrap()) as usize;
    let wire_capacity = u64::from_le_bytes(header[8..16].try_into().unwrap()) as usize;

    // The plugin's view is bounded by the submitter's capacity, never by
    // what happens to fit in the region.
    let capacity = wire_capacity.min(storage_capacity);
    if count > capacity {
        return RESULT_CODEC_ERROR;
    }

    let mut frame = vec![0u8; codec::encoded_len(count)];
    if shm.read(BATCH_FRAME_OFFSET, &mut frame).is_err() {
        return RESULT_CODEC_ERROR;
    }
    let mut batch = Batch::with_capacity(capacity);
    if codec::decode(&frame, &mut batch).is_err() {
        return RESULT_CODEC_ERROR;
    }

    let code = match loaded.process(&mut batch, ctx) {
        Ok(code) => code,
        Err(Error::Plugin(bad_count)) => {
            tracing::error!(bad_count, "plugin moved count outside the capacity");
            return RESULT_CODEC_ERROR;
        }
        Err(error) => {
            tracing::error!(%error, "plugin call failed");
            return RESULT_CODEC_ERROR;
        }
    };

    let mut out = vec![0u8; codec::encoded_len(batch.count())];
    if codec::encode(&batch, &mut out).is_err() {
        return RESULT_CODEC_ERROR;
    }
    if shm.write(BATCH_FRAME_OFFSET, &out).is_err() {
        return RESULT_CODEC_ERROR;
    }
    code
}

extern "C" fn on_terminate(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    let handler = on_terminate as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
