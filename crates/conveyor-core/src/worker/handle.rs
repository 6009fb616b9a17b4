//! `WorkerHandle`: the coordinator-side proxy for one isolated worker
//! process.
//!
//! The handle owns every per-worker resource: the spawned child, the
//! request/response stream channels bound to the child's stdio, the shared
//! batch region, a reader thread, and the stage's metrics. At most one
//! batch call is in flight per handle; callers serialize on the handle's
//! call mutex.

use std::os::unix::io::IntoRawFd;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::codec;
use crate::config::StageConfig;
use crate::error::{Error, Result};
use crate::ipc::{region_name, FrameHeader, MsgType, SharedRegion, StreamChannel, BATCH_FRAME_OFFSET};
use crate::metrics::ComponentMetrics;
use crate::plugin::RESULT_CODEC_ERROR;
use crate::record::Batch;
use crate::stage::ProcessingStage;

/// Upper bound on control-frame size; responses carry at most a result code.
pub const RESPONSE_MAX_BYTES: usize = 1024;

/// A worker that has not answered anything for this long is considered dead.
const HEARTBEAT_STALE: Duration = Duration::from_secs(60);

/// Grace period after a shutdown request and again after SIGTERM.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

const WORKER_BINARY: &str = "conveyor-worker";
const WORKER_PATH_ENV: &str = "CONVEYOR_WORKER_PATH";

type ResponseFrame = (FrameHeader, Vec<u8>);

/// Live resources of a running worker. Present only while `running`.
struct WorkerConn {
    child: Child,
    child_pid: i32,
    req: Arc<StreamChannel>,
    resp_rx: Receiver<ResponseFrame>,
    reader: Option<JoinHandle<()>>,
    shm: Arc<SharedRegion>,
}

/// Coordinator-side proxy for one stage's worker process.
pub struct WorkerHandle {
    stage_name: String,
    plugin_path: String,
    params: String,
    batch_capacity: usize,
    worker_binary: Option<PathBuf>,
    conn: Mutex<Option<WorkerConn>>,
    call_lock: Mutex<()>,
    epoch: AtomicI32,
    quarantined: AtomicBool,
    last_heartbeat: Arc<AtomicU64>,
    metrics: Mutex<ComponentMetrics>,
}

impl WorkerHandle {
    /// Build a handle from a stage descriptor. The worker is not started.
    pub fn new(config: &StageConfig, batch_capacity: usize) -> Self {
        Self::with_plugin(
            &config.name,
            &config.plugin_path,
            &config.params,
            batch_capacity,
        )
    }

    /// Build a handle for an explicit plugin path, e.g. a transient
    /// fallback worker.
    pub fn with_plugin(
        stage_name: &str,
        plugin_path: &str,
        params: &str,
        batch_capacity: usize,
    ) -> Self {
        WorkerHandle {
            stage_name: stage_name.to_string(),
            plugin_path: plugin_path.to_string(),
            params: params.to_string(),
            batch_capacity,
            worker_binary: None,
            conn: Mutex::new(None),
            call_lock: Mutex::new(()),
            epoch: AtomicI32::new(0),
            quarantined: AtomicBool::new(false),
            last_heartbeat: Arc::new(AtomicU64::new(0)),
            metrics: Mutex::new(ComponentMetrics::default()),
        }
    }

    /// Override worker-binary discovery; used by tests and embedders.
    pub fn with_worker_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_binary = Some(path.into());
        self
    }

    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    pub fn plugin_path(&self) -> &str {
        &self.plugin_path
    }

    pub fn pid(&self) -> Option<i32> {
        self.conn.lock().unwrap().as_ref().map(|c| c.child_pid)
    }

    pub fn is_running(&self) -> bool {
        self.conn.lock().unwrap().is_some()
    }

    /// Spawn the worker process and wire up its channels and shared region.
    pub fn start(&self) -> Result<()> {
        ignore_sigpipe();

        let mut conn_guard = self.conn.lock().unwrap();
        if conn_guard.is_some() {
            return Ok(());
        }

        let shm_name = region_name(&self.stage_name);
        SharedRegion::unlink(&shm_name);
        let shm_size = BATCH_FRAME_OFFSET + codec::encoded_len(self.batch_capacity);
        let shm = Arc::new(SharedRegion::create(&shm_name, shm_size)?);

        let binary = self.find_worker_binary()?;
        let mut child = Command::new(&binary)
            .arg("--stage")
            .arg(&self.stage_name)
            .arg("--plugin")
            .arg(&self.plugin_path)
            .arg("--params")
            .arg(&self.params)
            .arg("--shm")
            .arg(&shm_name)
            .arg("--shm-size")
            .arg(shm_size.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::Spawn(format!(
                    "failed to spawn {} for stage '{}': {e}",
                    binary.display(),
                    self.stage_name
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("worker stdout unavailable".to_string()))?;

        let req = Arc::new(StreamChannel::writer(stdin.into_raw_fd())?);
        let resp = StreamChannel::reader(stdout.into_raw_fd())?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let heartbeat = Arc::clone(&self.last_heartbeat);
        heartbeat.store(unix_now_secs(), Ordering::Relaxed);
        let reader = std::thread::Builder::new()
            .name(format!("{}-reader", self.stage_name))
            .spawn(move || read_responses(resp, tx, heartbeat))
            .map_err(|e| Error::Spawn(format!("failed to spawn reader thread: {e}")))?;

        let child_pid = child.id() as i32;
        tracing::info!(
            stage = %self.stage_name,
            pid = child_pid,
            plugin = %self.plugin_path,
            "worker started"
        );

        *conn_guard = Some(WorkerConn {
            child,
            child_pid,
            req,
            resp_rx: rx,
            reader: Some(reader),
            shm,
        });
        Ok(())
    }

    /// Run one batch through the worker, waiting until `deadline` for the
    /// result. On success the worker's post-image replaces `batch` and the
    /// plugin's return code is handed back.
    pub fn process_batch(&self, batch: &mut Batch, deadline: Instant) -> Result<i32> {
        let _call = self.call_lock.lock().unwrap();
        let started = Instant::now();

        let result = self.process_batch_inner(batch, deadline);

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut metrics = self.metrics.lock().unwrap();
        match &result {
            Ok(_) => metrics.record_success(elapsed_ms),
            Err(Error::Timeout) => metrics.record_failure(elapsed_ms, true),
            Err(_) => metrics.record_failure(elapsed_ms, false),
        }
        result
    }

    fn process_batch_inner(&self, batch: &mut Batch, deadline: Instant) -> Result<i32> {
        let (req, resp_rx, shm, child_pid) = {
            let conn = self.conn.lock().unwrap();
            let conn = conn
                .as_ref()
                .ok_or_else(|| Error::Transport("worker is not running".to_string()))?;
            (
                Arc::clone(&conn.req),
                conn.resp_rx.clone(),
                Arc::clone(&conn.shm),
                conn.child_pid,
            )
        };

        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        // Anything still queued belongs to a lapsed call.
        while resp_rx.try_recv().is_ok() {}

        let mut frame = vec![0u8; codec::encoded_len(batch.count())];
        let frame_len = codec::encode(batch, &mut frame)?;
        shm.write(BATCH_FRAME_OFFSET, &frame[..frame_len])?;

        req.send_frame(
            FrameHeader::new(
                MsgType::ProcessBatch,
                epoch,
                child_pid,
                std::mem::size_of::<u64>() as u64,
            ),
            Some(&(frame_len as u64).to_le_bytes()),
        )?;

        loop {
            let (header, payload) = match resp_rx.recv_deadline(deadline) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => return Err(Error::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Transport("worker response channel closed".to_string()))
                }
            };
            if header.sender_id != epoch || header.msg_type != MsgType::BatchResult {
                continue;
            }
            if payload.len() < 4 {
                return Err(Error::Transport(format!(
                    "batch result payload too short: {} bytes",
                    payload.len()
                )));
            }

            let code = i32::from_le_bytes(payload[..4].try_into().unwrap());
            if code == RESULT_CODEC_ERROR {
                return Err(Error::Codec(
                    "worker failed to decode or re-encode the batch".to_string(),
                ));
            }
            if code < 0 {
                return Err(Error::Plugin(code));
            }

            self.read_back(&shm, batch)?;
            return Ok(code);
        }
    }

    /// Copy the worker's encoded post-image out of the shared region into
    /// the caller's batch.
    fn read_back(&self, shm: &SharedRegion, batch: &mut Batch) -> Result<()> {
        let mut header = [0u8; codec::BATCH_HEADER_LEN];
        shm.read(BATCH_FRAME_OFFSET, &mut header)?;
        let count = u64::from_le_bytes(header[0..8].try_into().unwrap()) as usize;
        if count > self.batch_capacity {
            return Err(Error::Codec(format!(
                "worker returned {count} records, region fits {}",
                self.batch_capacity
            )));
        }
        let mut frame = vec![0u8; codec::encoded_len(count)];
        shm.read(BATCH_FRAME_OFFSET, &mut frame)?;
        codec::decode(&frame, batch)
    }

    /// Fire a health-check frame without waiting for the answer; the reader
    /// thread consumes the reply and refreshes the heartbeat timestamp.
    pub fn send_heartbeat(&self) -> Result<()> {
        let (req, child_pid) = {
            let conn = self.conn.lock().unwrap();
            let conn = conn
                .as_ref()
                .ok_or_else(|| Error::Transport("worker is not running".to_string()))?;
            (Arc::clone(&conn.req), conn.child_pid)
        };
        req.send_frame(FrameHeader::new(MsgType::HealthCheck, 0, child_pid, 0), None)
    }

    /// True when the worker is running, its process exists, and something
    /// was heard from it within the heartbeat window.
    pub fn is_alive(&self) -> bool {
        let mut conn_guard = self.conn.lock().unwrap();
        let Some(conn) = conn_guard.as_mut() else {
            return false;
        };
        if !matches!(conn.child.try_wait(), Ok(None)) {
            return false;
        }
        let last = self.last_heartbeat.load(Ordering::Relaxed);
        unix_now_secs().saturating_sub(last) <= HEARTBEAT_STALE.as_secs()
    }

    /// Stop the worker: shutdown request, then SIGTERM, then SIGKILL, each
    /// after a grace period. Descriptor fields survive so the handle can be
    /// restarted.
    pub fn terminate(&self) {
        let conn = self.conn.lock().unwrap().take();
        let Some(mut conn) = conn else {
            return;
        };

        let _ = conn.req.send_frame(
            FrameHeader::new(MsgType::Shutdown, 0, conn.child_pid, 0),
            None,
        );

        if !wait_for_exit(&mut conn.child, SHUTDOWN_GRACE) {
            unsafe {
                libc::kill(conn.child_pid, libc::SIGTERM);
            }
            if !wait_for_exit(&mut conn.child, SHUTDOWN_GRACE) {
                let _ = conn.child.kill();
            }
        }
        let _ = conn.child.wait();

        drop(conn.req);
        if let Some(reader) = conn.reader.take() {
            let _ = reader.join();
        }
        tracing::info!(stage = %self.stage_name, "worker terminated");
        // The shared region unlinks itself when the last Arc drops.
    }

    /// Terminate and start again. Metrics are preserved across the restart.
    pub fn restart(&self) -> Result<()> {
        self.terminate();
        self.start()
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::Relaxed)
    }

    pub fn set_quarantined(&self, quarantined: bool) {
        self.quarantined.store(quarantined, Ordering::Relaxed);
        if quarantined {
            tracing::warn!(stage = %self.stage_name, "stage quarantined");
        } else {
            tracing::info!(stage = %self.stage_name, "stage quarantine cleared");
        }
    }

    pub fn metrics(&self) -> ComponentMetrics {
        self.metrics.lock().unwrap().clone()
    }

    /// Locate the worker binary: explicit override, environment variable,
    /// next to the current executable, on PATH, then the development target
    /// directory.
    fn find_worker_binary(&self) -> Result<PathBuf> {
        if let Some(path) = &self.worker_binary {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(Error::Spawn(format!(
                "worker binary {} does not exist",
                path.display()
            )));
        }

        if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
        }

        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let candidate = exe_dir.join(WORKER_BINARY);
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }

        if let Ok(path) = which::which(WORKER_BINARY) {
            return Ok(path);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            for profile in &["debug", "release"] {
                let candidate = PathBuf::from(&manifest_dir)
                    .join("..")
                    .join("..")
                    .join("target")
                    .join(profile)
                    .join(WORKER_BINARY);
                if candidate.exists() {
                    return Ok(candidate.canonicalize().unwrap_or(candidate));
                }
            }
        }

        Err(Error::Spawn(format!(
            "could not find {WORKER_BINARY}; set {WORKER_PATH_ENV} or put it on PATH"
        )))
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl ProcessingStage for WorkerHandle {
    fn name(&self) -> &str {
        self.stage_name()
    }

    fn start(&self) -> Result<()> {
        WorkerHandle::start(self)
    }

    fn process_batch(&self, batch: &mut Batch, deadline: Instant) -> Result<i32> {
        WorkerHandle::process_batch(self, batch, deadline)
    }

    fn send_heartbeat(&self) -> Result<()> {
        WorkerHandle::send_heartbeat(self)
    }

    fn is_healthy(&self) -> bool {
        self.is_alive()
    }

    fn terminate(&self) {
        WorkerHandle::terminate(self)
    }

    fn restart(&self) -> Result<()> {
        WorkerHandle::restart(self)
    }

    fn is_quarantined(&self) -> bool {
        WorkerHandle::is_quarantined(self)
    }

    fn set_quarantined(&self, quarantined: bool) {
        WorkerHandle::set_quarantined(self, quarantined)
    }

    fn metrics(&self) -> ComponentMetrics {
        WorkerHandle::metrics(self)
    }
}

fn read_responses(
    resp: StreamChannel,
    tx: Sender<ResponseFrame>,
    heartbeat: Arc<AtomicU64>,
) {
    loop {
        match resp.recv_frame(RESPONSE_MAX_BYTES, None) {
            Ok((header, payload)) => {
                heartbeat.store(unix_now_secs(), Ordering::Relaxed);
                // Zero-payload results are health-check replies; nobody is
                // waiting on them.
                if header.msg_type == MsgType::BatchResult && payload.is_empty() {
                    continue;
                }
                if tx.send((header, payload)).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

fn wait_for_exit(child: &mut Child, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_)) | Err(_)) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// Writing to a worker whose read end is gone must surface as EPIPE, not
// kill the coordinator.
fn ignore_sigpipe() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}
