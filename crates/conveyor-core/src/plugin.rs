//! The C-callable symbol contract required of every plugin shared library.
//!
//! Plugins export four symbols:
//!
//! ```c
//! int         init_plugin   (PluginContext*);
//! void        cleanup_plugin(PluginContext*);
//! int         process_batch (RecordBatch*, PluginContext*);
//! const char* get_plugin_info(const char* info_type);
//! ```
//!
//! `process_batch` is never called before `init_plugin` and never after
//! `cleanup_plugin`. A return of 0 is success; negative values are plugin
//! errors surfaced to the coordinator.

use std::os::raw::{c_char, c_int, c_void};

use crate::record::Record;

/// Symbol names resolved from a plugin library.
pub const SYM_INIT_PLUGIN: &[u8] = b"init_plugin\0";
pub const SYM_CLEANUP_PLUGIN: &[u8] = b"cleanup_plugin\0";
pub const SYM_PROCESS_BATCH: &[u8] = b"process_batch\0";
pub const SYM_PLUGIN_INFO: &[u8] = b"get_plugin_info\0";

/// Reserved result code the worker reports when it could not decode or
/// re-encode the batch around a plugin call. Plugins themselves never
/// return it.
pub const RESULT_CODEC_ERROR: i32 = i32::MIN;

/// Logging callback handed to plugins.
pub type PluginLogFn = unsafe extern "C" fn(*const c_char);

/// Context passed to every plugin entry point.
///
/// `user_data` is plugin-private state installed by `init_plugin`;
/// `config_params` is a NUL-terminated `key=value,...` string that stays
/// alive for the plugin's whole lifetime.
#[repr(C)]
pub struct PluginContext {
    pub user_data: *mut c_void,
    pub config_params: *const c_char,
    pub log_info: Option<PluginLogFn>,
    pub log_error: Option<PluginLogFn>,
}

/// The batch view crossing the plugin ABI: a borrowed record array plus the
/// live count the plugin may move within `[0, capacity]`.
#[repr(C)]
pub struct RawBatch {
    pub records: *mut Record,
    pub count: usize,
    pub capacity: usize,
    pub batch_id: i32,
}

pub type InitPluginFn = unsafe extern "C" fn(*mut PluginContext) -> c_int;
pub type CleanupPluginFn = unsafe extern "C" fn(*mut PluginContext);
pub type ProcessBatchFn = unsafe extern "C" fn(*mut RawBatch, *mut PluginContext) -> c_int;
pub type PluginInfoFn = unsafe extern "C" fn(*const c_char) -> *const c_char;
