//! Composition root: builds the pool, worker handles, supervisor, and
//! pipeline out of a loaded configuration and runs them as one unit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{PipelineConfig, StageConfig};
use crate::error::{Error, Result};
use crate::executor::ResilientExecutor;
use crate::ipc::SharedRegion;
use crate::pipeline::{Pipeline, RunOutcome};
use crate::pool::BatchPool;
use crate::record::Batch;
use crate::stage::ProcessingStage;
use crate::supervisor::{Supervisor, SupervisorSpec};
use crate::worker::WorkerHandle;

/// A fully wired processing node: pool + pipeline + supervision tree.
pub struct ProcessingSystem {
    node_id: String,
    config: PipelineConfig,
    batch_capacity: usize,
    pool: Arc<BatchPool>,
    supervisor: Arc<Supervisor>,
    pipeline: Arc<Pipeline>,
    started: AtomicBool,
}

impl ProcessingSystem {
    /// Assemble a system from a validated configuration. Workers are not
    /// started yet.
    pub fn new(
        node_id: impl Into<String>,
        config: PipelineConfig,
        supervisor_spec: SupervisorSpec,
        batch_capacity: usize,
        initial_batches: usize,
    ) -> Result<Self> {
        let node_id = node_id.into();
        let enabled: Vec<&StageConfig> =
            config.stages().iter().filter(|s| s.enabled).collect();
        if enabled.is_empty() {
            return Err(Error::ConfigInvalid(
                "no enabled stages in the pipeline".to_string(),
            ));
        }

        let pool = Arc::new(BatchPool::new(batch_capacity, initial_batches));
        let supervisor = Arc::new(Supervisor::new(format!("{node_id}-root"), supervisor_spec));
        let pipeline = Arc::new(Pipeline::new(ResilientExecutor::new()));

        for stage_config in enabled {
            let handle: Arc<WorkerHandle> =
                Arc::new(WorkerHandle::new(stage_config, batch_capacity));
            supervisor.add_worker(Arc::clone(&handle) as Arc<dyn ProcessingStage>);
            pipeline.add_stage(
                stage_config.clone(),
                handle as Arc<dyn ProcessingStage>,
            );
        }

        Ok(ProcessingSystem {
            node_id,
            config,
            batch_capacity,
            pool,
            supervisor,
            pipeline,
            started: AtomicBool::new(false),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Start the workers and the supervision monitor. Stages that fail to
    /// spawn are reported and left to the supervisor's restart budget.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Regions from coordinators that crashed earlier must not shadow
        // ours.
        for stage in self.config.stages().iter().filter(|s| s.enabled) {
            SharedRegion::scrub_stale(&stage.name);
        }

        let total = self.pipeline.stage_count();
        let started = self.supervisor.start_all_components();
        if started == 0 {
            self.started.store(false, Ordering::SeqCst);
            return Err(Error::Spawn(format!(
                "none of the {total} pipeline stages could be started"
            )));
        }
        if started < total {
            tracing::warn!(
                started,
                total,
                "pipeline starting with a partial stage set"
            );
        }

        self.supervisor.start_monitoring();
        tracing::info!(node = %self.node_id, stages = started, "processing system started");
        Ok(())
    }

    /// Stop the monitor and terminate every worker.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(node = %self.node_id, "stopping processing system");
        self.supervisor.shutdown();
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// At least one stage is alive and usable.
    pub fn is_healthy(&self) -> bool {
        self.pipeline.metrics().healthy_stages > 0
    }

    pub fn create_batch(&self) -> Batch {
        self.pool.create_batch()
    }

    pub fn free_batch(&self, batch: Batch) {
        self.pool.free_batch(batch)
    }

    /// Run one batch through the pipeline.
    pub fn process_batch(&self, batch: &mut Batch) -> RunOutcome {
        self.pipeline.run(batch)
    }

    /// Swap a stage's plugin for the library at `new_path`, keeping its
    /// supervisor slot. Rolls back to the old plugin if the new worker
    /// cannot start.
    pub fn hot_swap(&self, stage_name: &str, new_path: &str) -> Result<()> {
        let batch_capacity = self.batch_capacity;
        let active = self.pipeline.hot_swap(stage_name, new_path, |config| {
            Ok(Arc::new(WorkerHandle::new(config, batch_capacity)) as Arc<dyn ProcessingStage>)
        })?;
        self.supervisor.replace_worker(stage_name, active);
        Ok(())
    }

    pub fn clear_quarantine(&self, stage_name: &str) -> bool {
        self.pipeline.clear_quarantine(stage_name)
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Human-readable status: supervision tree, stage states, pool usage.
    pub fn status_report(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Node: {}\n", self.node_id));
        out.push_str(&self.supervisor.render_tree());

        let stats = self.supervisor.statistics();
        out.push_str(&format!(
            "Components: {}/{} healthy, {} restarts\n",
            stats.healthy_components, stats.total_components, stats.total_restarts
        ));

        for line in self.pipeline.status() {
            out.push_str(&format!("Stage {line}\n"));
        }
        for name in self.supervisor.failed_components() {
            out.push_str(&format!("{}\n", Error::BudgetExhausted(name)));
        }

        let pool = self.pool.statistics();
        out.push_str(&format!(
            "Batch pool: {} created, {} available, {} in use\n",
            pool.total_created, pool.available, pool.in_use
        ));
        out
    }
}

impl Drop for ProcessingSystem {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;

    fn config() -> PipelineConfig {
        PipelineConfig::from_stages(vec![
            StageConfig::new("validate", "/lib/libvalidate.so"),
            StageConfig::new("enrich", "/lib/libenrich.so"),
        ])
        .unwrap()
    }

    #[test]
    fn system_assembles_enabled_stages() {
        let system = ProcessingSystem::new(
            "node-a",
            config(),
            SupervisorSpec::default(),
            64,
            2,
        )
        .unwrap();
        assert_eq!(system.pipeline().stage_count(), 2);
        assert_eq!(system.supervisor().component_count(), 2);
        assert!(!system.is_started());
    }

    #[test]
    fn disabled_stages_are_left_out() {
        let mut disabled = StageConfig::new("audit", "/lib/libaudit.so");
        disabled.enabled = false;
        let config = PipelineConfig::from_stages(vec![
            StageConfig::new("validate", "/lib/libvalidate.so"),
            disabled,
        ])
        .unwrap();

        let system =
            ProcessingSystem::new("node-a", config, SupervisorSpec::default(), 64, 1).unwrap();
        assert_eq!(system.pipeline().stage_count(), 1);
    }

    #[test]
    fn all_stages_disabled_is_invalid() {
        let mut stage = StageConfig::new("only", "/lib/libonly.so");
        stage.enabled = false;
        let config = PipelineConfig::from_stages(vec![stage]).unwrap();
        assert!(matches!(
            ProcessingSystem::new("node-a", config, SupervisorSpec::default(), 64, 1),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn batches_flow_through_the_pool() {
        let system =
            ProcessingSystem::new("node-a", config(), SupervisorSpec::default(), 16, 1).unwrap();
        let batch = system.create_batch();
        assert_eq!(batch.capacity(), 16);
        system.free_batch(batch);
    }

    #[test]
    fn status_report_names_everything() {
        let system =
            ProcessingSystem::new("node-a", config(), SupervisorSpec::default(), 16, 1).unwrap();
        let report = system.status_report();
        assert!(report.contains("Node: node-a"));
        assert!(report.contains("validate"));
        assert!(report.contains("enrich"));
        assert!(report.contains("Batch pool"));
    }
}
