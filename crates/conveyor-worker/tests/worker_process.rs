//! Integration tests driving the real worker binary.
//!
//! The spawn-failure paths run unconditionally. The full plugin-backed
//! scenarios need the plugin cdylibs from this workspace to be built first
//! (`cargo build -p validation-plugin -p enrichment-plugin`), so they are
//! ignored by default, the same way the heavier process tests are gated.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conveyor_core::config::{FailoverKind, StageConfig};
use conveyor_core::executor::ResilientExecutor;
use conveyor_core::pipeline::{Pipeline, RunOutcome};
use conveyor_core::record::{Batch, Record};
use conveyor_core::stage::ProcessingStage;
use conveyor_core::worker::WorkerHandle;

const BATCH_CAPACITY: usize = 64;

fn worker_binary() -> &'static str {
    env!("CARGO_BIN_EXE_conveyor-worker")
}

/// Locate a plugin cdylib in the build's target directory.
fn plugin_artifact(lib_name: &str) -> PathBuf {
    let mut dir = PathBuf::from(worker_binary());
    dir.pop();
    let candidate = dir.join(format!("lib{lib_name}.so"));
    assert!(
        candidate.exists(),
        "{} not found; build the plugin crates first",
        candidate.display()
    );
    candidate
}

fn handle_for(stage: &str, plugin: &str, params: &str) -> WorkerHandle {
    WorkerHandle::with_plugin(stage, plugin, params, BATCH_CAPACITY)
        .with_worker_binary(worker_binary())
}

fn wait_until(condition: impl Fn() -> bool, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    condition()
}

fn sample_batch() -> Batch {
    let mut batch = Batch::with_capacity(BATCH_CAPACITY);
    batch.set_batch_id(1);
    batch.push(Record::new(1, "R1", 10.0, 1));
    batch.push(Record::new(2, "R2", 20.0, 2));
    batch.push(Record::new(3, "R3", 30.0, 3));
    batch
}

#[test]
fn worker_with_missing_plugin_dies_and_calls_fail() {
    let handle = handle_for("missing_plugin", "/nonexistent/libghost.so", "");
    handle.start().expect("spawn itself succeeds");

    assert!(
        wait_until(|| !handle.is_alive(), Duration::from_secs(5)),
        "worker should exit once the plugin fails to load"
    );

    let mut batch = sample_batch();
    let result = handle.process_batch(&mut batch, Instant::now() + Duration::from_millis(500));
    assert!(result.is_err());

    handle.terminate();
    assert!(!handle.is_running());
}

#[test]
fn spawn_error_surfaces_for_missing_worker_binary() {
    let handle = WorkerHandle::with_plugin("no_binary", "/tmp/libx.so", "", 8)
        .with_worker_binary("/nonexistent/conveyor-worker");
    assert!(handle.start().is_err());
}

#[test]
#[ignore = "requires built plugin artifacts"]
fn validate_then_enrich_happy_path() {
    let validate = Arc::new(handle_for(
        "validate_happy",
        plugin_artifact("validation_plugin").to_str().unwrap(),
        "strict_mode=false",
    ));
    let enrich = Arc::new(handle_for(
        "enrich_happy",
        plugin_artifact("enrichment_plugin").to_str().unwrap(),
        "factor=1.1,suffix_format=_CAT%d",
    ));
    validate.start().unwrap();
    enrich.start().unwrap();

    let pipeline = Pipeline::new(ResilientExecutor::new());
    let mut validate_config = StageConfig::new("validate_happy", "unused");
    validate_config.failover.kind = FailoverKind::FailFast;
    let mut enrich_config = StageConfig::new("enrich_happy", "unused");
    enrich_config.failover.kind = FailoverKind::FailFast;
    pipeline.add_stage(validate_config, Arc::clone(&validate) as Arc<dyn ProcessingStage>);
    pipeline.add_stage(enrich_config, Arc::clone(&enrich) as Arc<dyn ProcessingStage>);

    let mut batch = sample_batch();
    assert!(pipeline.run(&mut batch).is_ok());

    let names: Vec<String> = batch.records().iter().map(|r| r.name().into_owned()).collect();
    assert_eq!(names, vec!["R1_CAT1", "R2_CAT2", "R3_CAT3"]);
    let values: Vec<f64> = batch.records().iter().map(|r| r.value).collect();
    for (value, expected) in values.iter().zip([11.0, 22.0, 33.0]) {
        assert!((value - expected).abs() < 1e-9, "got {value}, want {expected}");
    }

    let metrics = validate.metrics();
    assert_eq!(metrics.successful_calls, 1);
    assert_eq!(metrics.failed_calls, 0);

    validate.terminate();
    enrich.terminate();
}

#[test]
#[ignore = "requires built plugin artifacts"]
fn strict_validation_error_aborts_the_pipeline() {
    let validate = Arc::new(handle_for(
        "validate_strict",
        plugin_artifact("validation_plugin").to_str().unwrap(),
        "strict_mode=true",
    ));
    validate.start().unwrap();

    let pipeline = Pipeline::new(ResilientExecutor::new());
    let mut config = StageConfig::new("validate_strict", "unused");
    config.failover.kind = FailoverKind::FailFast;
    config.failover.max_retries = 0;
    config.failover.initial_delay_ms = 1;
    config.failover.max_delay_ms = 1;
    pipeline.add_stage(config, Arc::clone(&validate) as Arc<dyn ProcessingStage>);

    let mut batch = Batch::with_capacity(BATCH_CAPACITY);
    batch.push(Record::new(0, "R1", 10.0, 1)); // id below the valid range

    match pipeline.run(&mut batch) {
        RunOutcome::Aborted { stage, reason } => {
            assert_eq!(stage, "validate_strict");
            assert_eq!(reason.kind(), "PLUGIN_ERROR");
        }
        RunOutcome::Ok => panic!("strict validation should abort"),
    }

    validate.terminate();
}

#[test]
#[ignore = "requires built plugin artifacts"]
fn heartbeats_keep_an_idle_worker_alive() {
    let handle = Arc::new(handle_for(
        "heartbeat_idle",
        plugin_artifact("validation_plugin").to_str().unwrap(),
        "",
    ));
    handle.start().unwrap();

    for _ in 0..3 {
        handle.send_heartbeat().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(handle.is_alive());
    }

    handle.terminate();
    assert!(!handle.is_alive());
}

#[test]
#[ignore = "requires built plugin artifacts"]
fn restart_preserves_metrics_and_keeps_serving() {
    let handle = handle_for(
        "restart_metrics",
        plugin_artifact("validation_plugin").to_str().unwrap(),
        "",
    );
    handle.start().unwrap();

    let mut batch = sample_batch();
    handle
        .process_batch(&mut batch, Instant::now() + Duration::from_secs(5))
        .unwrap();
    assert_eq!(handle.metrics().successful_calls, 1);

    handle.restart().unwrap();
    assert_eq!(
        handle.metrics().successful_calls,
        1,
        "metrics survive a restart"
    );

    let mut batch = sample_batch();
    handle
        .process_batch(&mut batch, Instant::now() + Duration::from_secs(5))
        .unwrap();
    assert_eq!(handle.metrics().successful_calls, 2);

    handle.terminate();
}

#[test]
#[ignore = "requires built plugin artifacts"]
fn killed_worker_is_detected_and_restartable() {
    let handle = handle_for(
        "killed_worker",
        plugin_artifact("validation_plugin").to_str().unwrap(),
        "",
    );
    handle.start().unwrap();
    let pid = handle.pid().unwrap();

    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
    assert!(
        wait_until(|| !handle.is_alive(), Duration::from_secs(5)),
        "killed worker should be reported dead"
    );

    handle.restart().unwrap();
    assert!(handle.is_alive());

    let mut batch = sample_batch();
    handle
        .process_batch(&mut batch, Instant::now() + Duration::from_secs(5))
        .unwrap();

    handle.terminate();
}
