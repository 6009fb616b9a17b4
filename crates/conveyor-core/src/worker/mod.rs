//! Coordinator-side management of isolated worker processes.

mod handle;

pub use handle::{WorkerHandle, RESPONSE_MAX_BYTES};
