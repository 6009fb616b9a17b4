//! Error types for conveyor-core.

use thiserror::Error;

/// Result type for conveyor-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the pipeline runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// A worker process could not be spawned or wired up.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// A stream channel failed (EOF, short read/write, oversized frame).
    #[error("transport error: {0}")]
    Transport(String),

    /// A batch frame failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(String),

    /// The deadline elapsed while waiting for a worker response.
    #[error("deadline elapsed waiting for worker response")]
    Timeout,

    /// The plugin reported a failure for the batch.
    #[error("plugin returned error code {0}")]
    Plugin(i32),

    /// The stage is quarantined and must be cleared by an operator.
    #[error("stage is quarantined")]
    Quarantined,

    /// The supervisor's restart budget for a stage is exhausted.
    #[error("restart budget exhausted for stage '{0}'")]
    BudgetExhausted(String),

    /// The pipeline configuration failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Failed to load a plugin library.
    #[error("failed to load plugin library: {0}")]
    LibraryLoad(#[from] libloading::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short identifier for the error kind, used in abort reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Spawn(_) => "SPAWN_ERROR",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::Codec(_) => "CODEC_ERROR",
            Error::Timeout => "TIMEOUT",
            Error::Plugin(_) => "PLUGIN_ERROR",
            Error::Quarantined => "QUARANTINED",
            Error::BudgetExhausted(_) => "BUDGET_EXHAUSTED",
            Error::ConfigInvalid(_) => "CONFIG_INVALID",
            Error::LibraryLoad(_) => "PLUGIN_ERROR",
            Error::Io(_) => "TRANSPORT_ERROR",
        }
    }
}
