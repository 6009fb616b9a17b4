//! Core engine for Conveyor, a fault-tolerant pipeline executor for record
//! batches.
//!
//! This crate provides:
//! - The batch data model and its framed, checksummed wire codec
//! - Stream-channel and shared-memory transport to isolated workers
//! - Worker handles: spawn, call with deadline, heartbeat, restart
//! - OTP-style supervision with restart strategies and budgets
//! - The resilient executor (timeout, retry with backoff, failover)
//! - The pipeline runner and system composition root

pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod ipc;
pub mod metrics;
pub mod pipeline;
pub mod plugin;
pub mod pool;
pub mod record;
pub mod stage;
pub mod supervisor;
pub mod system;
pub mod worker;

pub use config::{FailoverConfig, FailoverKind, PipelineConfig, StageConfig};
pub use error::{Error, Result};
pub use executor::{ResilientExecutor, StageOutcome};
pub use metrics::ComponentMetrics;
pub use pipeline::{Pipeline, PipelineMetrics, RunOutcome};
pub use pool::BatchPool;
pub use record::{Batch, Record, RECORD_NAME_LEN};
pub use stage::ProcessingStage;
pub use supervisor::{RestartPolicy, Supervised, Supervisor, SupervisorSpec, SupervisorStats};
pub use system::ProcessingSystem;
pub use worker::WorkerHandle;
