//! The resilient executor: wraps one per-stage call with timeout, retry
//! with exponential backoff, and the stage's failover policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{FailoverConfig, FailoverKind, StageConfig};
use crate::error::{Error, Result};
use crate::record::Batch;
use crate::stage::ProcessingStage;
use crate::worker::WorkerHandle;

/// Terminal result of running one stage under its failover policy.
#[derive(Debug)]
pub enum StageOutcome {
    /// The stage (or its fallback) processed the batch.
    Ok,
    /// The stage failed but the pipeline may continue; the batch is
    /// untouched by this stage.
    Skipped,
    /// The stage failed and the policy aborts the pipeline.
    Fatal(Error),
}

impl StageOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, StageOutcome::Ok)
    }
}

/// Factory for transient fallback stages, injectable so policy logic can be
/// exercised without real worker processes.
pub type FallbackSpawner =
    Box<dyn Fn(&StageConfig, usize) -> Result<Arc<dyn ProcessingStage>> + Send + Sync>;

/// Applies per-call timeout, retry with backoff, and the terminal failover
/// decision for a stage.
pub struct ResilientExecutor {
    fallback_spawner: FallbackSpawner,
}

impl Default for ResilientExecutor {
    fn default() -> Self {
        ResilientExecutor {
            fallback_spawner: Box::new(|config, batch_capacity| {
                let handle = Arc::new(WorkerHandle::new(config, batch_capacity));
                Ok(handle as Arc<dyn ProcessingStage>)
            }),
        }
    }
}

impl ResilientExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the transient-stage factory.
    pub fn with_fallback_spawner(mut self, spawner: FallbackSpawner) -> Self {
        self.fallback_spawner = spawner;
        self
    }

    /// Run `batch` through `stage` under `config`.
    ///
    /// Up to `max_retries + 1` attempts are made, each bounded by
    /// `timeout_ms`; between attempts the executor sleeps with exponential
    /// backoff clamped to `max_delay_ms`. Only after every attempt has
    /// failed is the policy's terminal decision consulted.
    pub fn execute(
        &self,
        stage: &dyn ProcessingStage,
        batch: &mut Batch,
        config: &FailoverConfig,
    ) -> StageOutcome {
        let attempts = config.max_retries as u64 + 1;
        let mut delay_ms = config.initial_delay_ms;
        let mut last_error = Error::Plugin(-1);

        for attempt in 1..=attempts {
            let deadline = Instant::now() + Duration::from_millis(config.timeout_ms);
            match stage.process_batch(batch, deadline) {
                Ok(code) => {
                    tracing::debug!(stage = stage.name(), attempt, code, "stage call succeeded");
                    return StageOutcome::Ok;
                }
                Err(error) => {
                    tracing::warn!(
                        stage = stage.name(),
                        attempt,
                        of = attempts,
                        %error,
                        "stage call failed"
                    );
                    last_error = error;
                }
            }

            if attempt < attempts {
                std::thread::sleep(Duration::from_millis(delay_ms));
                delay_ms = next_delay(delay_ms, config);
            }
        }

        self.settle(stage, batch, config, last_error)
    }

    /// The terminal decision once the retry budget is spent.
    fn settle(
        &self,
        stage: &dyn ProcessingStage,
        batch: &mut Batch,
        config: &FailoverConfig,
        last_error: Error,
    ) -> StageOutcome {
        match config.kind {
            FailoverKind::FailFast | FailoverKind::RetryWithBackoff => {
                StageOutcome::Fatal(last_error)
            }
            FailoverKind::SkipAndContinue => {
                tracing::warn!(stage = stage.name(), "skipping failed stage");
                StageOutcome::Skipped
            }
            FailoverKind::UseFallbackPlugin => self.run_fallback(stage, batch, config),
            FailoverKind::IsolateAndContinue => {
                stage.set_quarantined(true);
                StageOutcome::Skipped
            }
        }
    }

    /// One-shot attempt against a transient worker at the fallback path.
    fn run_fallback(
        &self,
        stage: &dyn ProcessingStage,
        batch: &mut Batch,
        config: &FailoverConfig,
    ) -> StageOutcome {
        let Some(fallback_path) = &config.fallback_plugin_path else {
            tracing::warn!(
                stage = stage.name(),
                "fallback policy without a fallback plugin path; skipping stage"
            );
            return StageOutcome::Skipped;
        };

        let mut fallback_config = StageConfig::new(
            format!("{}_fallback", stage.name()),
            fallback_path.clone(),
        );
        fallback_config.failover = config.clone();

        let fallback = match (self.fallback_spawner)(&fallback_config, batch.capacity()) {
            Ok(fallback) => fallback,
            Err(error) => {
                tracing::error!(stage = stage.name(), %error, "failed to create fallback stage");
                return StageOutcome::Skipped;
            }
        };

        if let Err(error) = fallback.start() {
            tracing::error!(stage = stage.name(), %error, "failed to start fallback stage");
            return StageOutcome::Skipped;
        }

        let deadline = Instant::now() + Duration::from_millis(config.timeout_ms);
        let outcome = match fallback.process_batch(batch, deadline) {
            Ok(_) => {
                tracing::info!(stage = stage.name(), fallback = %fallback_path, "fallback succeeded");
                StageOutcome::Ok
            }
            Err(error) => {
                tracing::warn!(stage = stage.name(), %error, "fallback stage failed");
                StageOutcome::Skipped
            }
        };
        fallback.terminate();
        outcome
    }
}

fn next_delay(delay_ms: u64, config: &FailoverConfig) -> u64 {
    let grown = (delay_ms as f64 * config.backoff_multiplier) as u64;
    grown.min(config.max_delay_ms)
}
