//! The pipeline runner: threads a batch through the ordered stages using
//! the resilient executor.

use std::sync::{Arc, Mutex};

use crate::config::StageConfig;
use crate::error::Error;
use crate::executor::{ResilientExecutor, StageOutcome};
use crate::record::Batch;
use crate::stage::ProcessingStage;

/// Result of running one batch through the pipeline.
#[derive(Debug)]
pub enum RunOutcome {
    Ok,
    /// A stage's failover policy aborted the run.
    Aborted { stage: String, reason: Error },
}

impl RunOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, RunOutcome::Ok)
    }
}

/// Aggregated view over all stages.
#[derive(Debug, Clone, Copy)]
pub struct PipelineMetrics {
    pub total_stages: usize,
    pub healthy_stages: usize,
    pub average_success_rate: f64,
}

struct StageSlot {
    config: StageConfig,
    stage: Arc<dyn ProcessingStage>,
}

/// Ordered sequence of stages plus the executor that guards each call.
pub struct Pipeline {
    slots: Mutex<Vec<StageSlot>>,
    executor: ResilientExecutor,
}

impl Pipeline {
    pub fn new(executor: ResilientExecutor) -> Self {
        Pipeline {
            slots: Mutex::new(Vec::new()),
            executor,
        }
    }

    /// Append a stage in pipeline order.
    pub fn add_stage(&self, config: StageConfig, stage: Arc<dyn ProcessingStage>) {
        self.slots.lock().unwrap().push(StageSlot { config, stage });
    }

    pub fn stage_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn stage(&self, name: &str) -> Option<Arc<dyn ProcessingStage>> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .find(|slot| slot.config.name == name)
            .map(|slot| Arc::clone(&slot.stage))
    }

    /// Run `batch` through every stage in order. Quarantined and unhealthy
    /// stages are skipped and leave the batch untouched; a fatal stage
    /// aborts the run.
    pub fn run(&self, batch: &mut Batch) -> RunOutcome {
        let slots: Vec<(StageConfig, Arc<dyn ProcessingStage>)> = {
            self.slots
                .lock()
                .unwrap()
                .iter()
                .map(|slot| (slot.config.clone(), Arc::clone(&slot.stage)))
                .collect()
        };

        for (config, stage) in slots {
            if stage.is_quarantined() {
                tracing::debug!(stage = %config.name, "skipping quarantined stage");
                continue;
            }
            if !stage.is_healthy() {
                tracing::warn!(stage = %config.name, "skipping unhealthy stage");
                continue;
            }

            match self.executor.execute(stage.as_ref(), batch, &config.failover) {
                StageOutcome::Ok | StageOutcome::Skipped => {}
                StageOutcome::Fatal(reason) => {
                    tracing::error!(
                        stage = %config.name,
                        kind = reason.kind(),
                        "pipeline aborted"
                    );
                    return RunOutcome::Aborted {
                        stage: config.name,
                        reason,
                    };
                }
            }
        }
        RunOutcome::Ok
    }

    /// Replace a stage's plugin in place: the old worker is terminated and
    /// a fresh one is started at `new_path` in the same slot. If the
    /// replacement cannot start, the old worker is brought back.
    ///
    /// Returns the stage now occupying the slot so the caller can mirror
    /// the change into its supervisor.
    pub fn hot_swap<F>(
        &self,
        stage_name: &str,
        new_path: &str,
        spawn: F,
    ) -> crate::error::Result<Arc<dyn ProcessingStage>>
    where
        F: Fn(&StageConfig) -> crate::error::Result<Arc<dyn ProcessingStage>>,
    {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .iter_mut()
            .find(|slot| slot.config.name == stage_name)
            .ok_or_else(|| {
                Error::ConfigInvalid(format!("no stage named '{stage_name}' in the pipeline"))
            })?;

        let mut new_config = slot.config.clone();
        new_config.plugin_path = new_path.to_string();

        tracing::info!(stage = stage_name, new_path, "hot-swapping stage plugin");
        slot.stage.terminate();

        let replacement = spawn(&new_config).and_then(|stage| stage.start().map(|_| stage));
        match replacement {
            Ok(stage) => {
                slot.config = new_config;
                slot.stage = Arc::clone(&stage);
                tracing::info!(stage = stage_name, "hot-swap complete");
                Ok(stage)
            }
            Err(error) => {
                tracing::error!(stage = stage_name, %error, "hot-swap failed, rolling back");
                if let Err(rollback_error) = slot.stage.start() {
                    tracing::error!(
                        stage = stage_name,
                        %rollback_error,
                        "rollback start failed; stage left stopped"
                    );
                }
                Err(error)
            }
        }
    }

    /// One status line per stage.
    pub fn status(&self) -> Vec<String> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .map(|slot| {
                let state = if slot.stage.is_quarantined() {
                    "QUARANTINED"
                } else if slot.stage.is_healthy() {
                    "HEALTHY"
                } else {
                    "UNHEALTHY"
                };
                format!("{}: {state}", slot.config.name)
            })
            .collect()
    }

    /// Clear a stage's quarantine so the pipeline uses it again.
    pub fn clear_quarantine(&self, name: &str) -> bool {
        match self.stage(name) {
            Some(stage) => {
                stage.set_quarantined(false);
                true
            }
            None => false,
        }
    }

    pub fn metrics(&self) -> PipelineMetrics {
        let slots = self.slots.lock().unwrap();
        let total = slots.len();
        let healthy = slots.iter().filter(|s| s.stage.is_healthy()).count();
        let rate_sum: f64 = slots
            .iter()
            .map(|s| s.stage.metrics().success_rate())
            .sum();
        PipelineMetrics {
            total_stages: total,
            healthy_stages: healthy,
            average_success_rate: if total > 0 { rate_sum / total as f64 } else { 0.0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FailoverConfig, FailoverKind};
    use crate::error::Result;
    use crate::metrics::ComponentMetrics;
    use crate::record::Record;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Instant;

    /// Stage double with settable health/behavior.
    struct TestStage {
        name: String,
        healthy: AtomicBool,
        quarantined: AtomicBool,
        fail: AtomicBool,
        calls: AtomicU32,
        started: AtomicU32,
        delta: f64,
    }

    impl TestStage {
        fn new(name: &str, delta: f64) -> Arc<Self> {
            Arc::new(TestStage {
                name: name.to_string(),
                healthy: AtomicBool::new(true),
                quarantined: AtomicBool::new(false),
                fail: AtomicBool::new(false),
                calls: AtomicU32::new(0),
                started: AtomicU32::new(0),
                delta,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl ProcessingStage for TestStage {
        fn name(&self) -> &str {
            &self.name
        }

        fn start(&self) -> Result<()> {
            self.started.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn process_batch(&self, batch: &mut Batch, _deadline: Instant) -> Result<i32> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail.load(Ordering::Relaxed) {
                return Err(Error::Plugin(-1));
            }
            for record in batch.records_mut() {
                record.value += self.delta;
            }
            Ok(0)
        }

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::Relaxed)
        }

        fn terminate(&self) {}

        fn restart(&self) -> Result<()> {
            Ok(())
        }

        fn is_quarantined(&self) -> bool {
            self.quarantined.load(Ordering::Relaxed)
        }

        fn set_quarantined(&self, quarantined: bool) {
            self.quarantined.store(quarantined, Ordering::Relaxed);
        }

        fn metrics(&self) -> ComponentMetrics {
            ComponentMetrics::default()
        }
    }

    fn stage_config(name: &str, kind: FailoverKind) -> StageConfig {
        let mut config = StageConfig::new(name, "/lib/unused.so");
        config.failover = FailoverConfig {
            kind,
            max_retries: 0,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            backoff_multiplier: 1.0,
            timeout_ms: 100,
            fallback_plugin_path: None,
            circuit_breaker_enabled: false,
        };
        config
    }

    fn batch_of(values: &[f64]) -> Batch {
        let mut batch = Batch::with_capacity(values.len().max(1));
        for (i, value) in values.iter().enumerate() {
            batch.push(Record::new(i as i32 + 1, &format!("R{}", i + 1), *value, 1));
        }
        batch
    }

    #[test]
    fn stages_run_in_order_and_mutate_in_place() {
        let pipeline = Pipeline::new(ResilientExecutor::new());
        let add_one = TestStage::new("add_one", 1.0);
        let add_ten = TestStage::new("add_ten", 10.0);
        pipeline.add_stage(
            stage_config("add_one", FailoverKind::FailFast),
            Arc::clone(&add_one) as Arc<dyn ProcessingStage>,
        );
        pipeline.add_stage(
            stage_config("add_ten", FailoverKind::FailFast),
            Arc::clone(&add_ten) as Arc<dyn ProcessingStage>,
        );

        let mut batch = batch_of(&[1.0, 2.0]);
        assert!(pipeline.run(&mut batch).is_ok());
        let values: Vec<f64> = batch.records().iter().map(|r| r.value).collect();
        assert_eq!(values, vec![12.0, 13.0]);
    }

    #[test]
    fn quarantined_stage_is_skipped_and_batch_untouched_by_it() {
        let pipeline = Pipeline::new(ResilientExecutor::new());
        let skipped = TestStage::new("skipped", 100.0);
        skipped.set_quarantined(true);
        let active = TestStage::new("active", 1.0);
        pipeline.add_stage(
            stage_config("skipped", FailoverKind::FailFast),
            Arc::clone(&skipped) as Arc<dyn ProcessingStage>,
        );
        pipeline.add_stage(
            stage_config("active", FailoverKind::FailFast),
            Arc::clone(&active) as Arc<dyn ProcessingStage>,
        );

        let mut batch = batch_of(&[1.0]);
        assert!(pipeline.run(&mut batch).is_ok());
        assert_eq!(skipped.calls(), 0);
        let value = batch.records()[0].value;
        assert_eq!(value, 2.0);
    }

    #[test]
    fn unhealthy_stage_is_skipped() {
        let pipeline = Pipeline::new(ResilientExecutor::new());
        let down = TestStage::new("down", 5.0);
        down.healthy.store(false, Ordering::Relaxed);
        pipeline.add_stage(
            stage_config("down", FailoverKind::FailFast),
            Arc::clone(&down) as Arc<dyn ProcessingStage>,
        );

        let mut batch = batch_of(&[1.0]);
        assert!(pipeline.run(&mut batch).is_ok());
        assert_eq!(down.calls(), 0);
        let value = batch.records()[0].value;
        assert_eq!(value, 1.0);
    }

    #[test]
    fn fatal_stage_aborts_and_names_itself() {
        let pipeline = Pipeline::new(ResilientExecutor::new());
        let bad = TestStage::new("bad", 0.0);
        bad.fail.store(true, Ordering::Relaxed);
        let after = TestStage::new("after", 1.0);
        pipeline.add_stage(
            stage_config("bad", FailoverKind::FailFast),
            Arc::clone(&bad) as Arc<dyn ProcessingStage>,
        );
        pipeline.add_stage(
            stage_config("after", FailoverKind::FailFast),
            Arc::clone(&after) as Arc<dyn ProcessingStage>,
        );

        let mut batch = batch_of(&[1.0]);
        match pipeline.run(&mut batch) {
            RunOutcome::Aborted { stage, reason } => {
                assert_eq!(stage, "bad");
                assert_eq!(reason.kind(), "PLUGIN_ERROR");
            }
            RunOutcome::Ok => panic!("expected abort"),
        }
        assert_eq!(after.calls(), 0, "stages after the abort must not run");
    }

    #[test]
    fn skip_policy_lets_the_pipeline_finish() {
        let pipeline = Pipeline::new(ResilientExecutor::new());
        let flaky = TestStage::new("flaky", 100.0);
        flaky.fail.store(true, Ordering::Relaxed);
        let tail = TestStage::new("tail", 1.0);
        pipeline.add_stage(
            stage_config("flaky", FailoverKind::SkipAndContinue),
            Arc::clone(&flaky) as Arc<dyn ProcessingStage>,
        );
        pipeline.add_stage(
            stage_config("tail", FailoverKind::FailFast),
            Arc::clone(&tail) as Arc<dyn ProcessingStage>,
        );

        let mut batch = batch_of(&[1.0]);
        assert!(pipeline.run(&mut batch).is_ok());
        let value = batch.records()[0].value;
        assert_eq!(value, 2.0, "failed stage left no mutation");
    }

    #[test]
    fn hot_swap_replaces_the_slot() {
        let pipeline = Pipeline::new(ResilientExecutor::new());
        let old = TestStage::new("stage", 1.0);
        pipeline.add_stage(
            stage_config("stage", FailoverKind::FailFast),
            Arc::clone(&old) as Arc<dyn ProcessingStage>,
        );

        let replacement = TestStage::new("stage", 7.0);
        let replacement_for_spawn = Arc::clone(&replacement);
        let result = pipeline.hot_swap("stage", "/lib/new.so", move |config| {
            assert_eq!(config.plugin_path, "/lib/new.so");
            Ok(Arc::clone(&replacement_for_spawn) as Arc<dyn ProcessingStage>)
        });
        assert!(result.is_ok());
        assert_eq!(replacement.started.load(Ordering::Relaxed), 1);

        let mut batch = batch_of(&[1.0]);
        assert!(pipeline.run(&mut batch).is_ok());
        let value = batch.records()[0].value;
        assert_eq!(value, 8.0, "new stage behavior is live");
    }

    #[test]
    fn failed_hot_swap_rolls_back_to_the_old_stage() {
        let pipeline = Pipeline::new(ResilientExecutor::new());
        let old = TestStage::new("stage", 1.0);
        pipeline.add_stage(
            stage_config("stage", FailoverKind::FailFast),
            Arc::clone(&old) as Arc<dyn ProcessingStage>,
        );

        let result = pipeline.hot_swap("stage", "/lib/broken.so", |_| {
            Err(Error::Spawn("no such plugin".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(old.started.load(Ordering::Relaxed), 1, "old stage was restarted");

        let mut batch = batch_of(&[1.0]);
        assert!(pipeline.run(&mut batch).is_ok());
        let value = batch.records()[0].value;
        assert_eq!(value, 2.0, "old behavior still active");
    }

    #[test]
    fn status_and_metrics_cover_all_stages() {
        let pipeline = Pipeline::new(ResilientExecutor::new());
        let a = TestStage::new("a", 1.0);
        let b = TestStage::new("b", 1.0);
        b.set_quarantined(true);
        pipeline.add_stage(
            stage_config("a", FailoverKind::FailFast),
            Arc::clone(&a) as Arc<dyn ProcessingStage>,
        );
        pipeline.add_stage(
            stage_config("b", FailoverKind::FailFast),
            Arc::clone(&b) as Arc<dyn ProcessingStage>,
        );

        let status = pipeline.status();
        assert_eq!(status, vec!["a: HEALTHY".to_string(), "b: QUARANTINED".to_string()]);

        let metrics = pipeline.metrics();
        assert_eq!(metrics.total_stages, 2);
        assert_eq!(metrics.healthy_stages, 2);

        assert!(pipeline.clear_quarantine("b"));
        assert!(!b.is_quarantined());
        assert!(!pipeline.clear_quarantine("ghost"));
    }
}
