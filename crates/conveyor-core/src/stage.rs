//! The seam between the pipeline machinery and whatever executes a stage.
//!
//! The resilient executor, the supervisor, and the pipeline runner all talk
//! to stages through this trait; production stages are worker-process
//! handles, tests substitute in-process doubles.

use std::time::Instant;

use crate::error::Result;
use crate::metrics::ComponentMetrics;
use crate::record::Batch;

/// A named transformation applied in pipeline order to a batch.
pub trait ProcessingStage: Send + Sync {
    fn name(&self) -> &str;

    /// Bring the stage up. Idempotent for a stage that is already running.
    fn start(&self) -> Result<()>;

    /// Run one batch through the stage. The deadline bounds the wait for
    /// the result; a lapsed deadline aborts only this call, never the stage.
    /// Returns the stage's result code (0 on success).
    fn process_batch(&self, batch: &mut Batch, deadline: Instant) -> Result<i32>;

    /// Probe liveness without waiting for an answer.
    fn send_heartbeat(&self) -> Result<()> {
        Ok(())
    }

    fn is_healthy(&self) -> bool;

    /// Stop the stage, keeping enough state for a later restart.
    fn terminate(&self);

    /// Terminate and start again. Metrics survive a restart.
    fn restart(&self) -> Result<()>;

    fn is_quarantined(&self) -> bool;

    fn set_quarantined(&self, quarantined: bool);

    fn metrics(&self) -> ComponentMetrics;
}
