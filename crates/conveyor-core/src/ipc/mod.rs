//! Inter-process transport: length-prefixed stream frames and the per-worker
//! shared-memory region that carries bulk batch bytes.

pub mod channel;
pub mod shm;

pub use channel::{FrameHeader, MsgType, StreamChannel, FRAME_HEADER_LEN};
pub use shm::{region_name, SharedRegion, BATCH_FRAME_OFFSET};
