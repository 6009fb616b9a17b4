//! Loading and driving one plugin shared library.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::Path;

use libloading::{Library, Symbol};

use conveyor_core::error::{Error, Result};
use conveyor_core::plugin::{
    CleanupPluginFn, InitPluginFn, PluginContext, PluginInfoFn, ProcessBatchFn, RawBatch,
    SYM_CLEANUP_PLUGIN, SYM_INIT_PLUGIN, SYM_PLUGIN_INFO, SYM_PROCESS_BATCH,
};
use conveyor_core::record::Batch;

/// The plugin context plus the allocations its raw pointers borrow from.
pub struct PluginCtx {
    context: Box<PluginContext>,
    _params: CString,
}

/// A plugin library with its four entry points resolved.
pub struct LoadedPlugin {
    library: Library,
}

impl LoadedPlugin {
    /// Load the library and verify the full symbol contract up front.
    pub fn load(path: &Path) -> Result<Self> {
        let library = unsafe { Library::new(path) }?;
        unsafe {
            let _: Symbol<InitPluginFn> = library.get(SYM_INIT_PLUGIN)?;
            let _: Symbol<ProcessBatchFn> = library.get(SYM_PROCESS_BATCH)?;
            let _: Symbol<CleanupPluginFn> = library.get(SYM_CLEANUP_PLUGIN)?;
            let _: Symbol<PluginInfoFn> = library.get(SYM_PLUGIN_INFO)?;
        }
        Ok(LoadedPlugin { library })
    }

    /// Build the context and run `init_plugin`.
    pub fn init(&self, params: &str) -> Result<PluginCtx> {
        let params = CString::new(params)
            .map_err(|_| Error::ConfigInvalid("params contain a NUL byte".to_string()))?;
        let mut ctx = PluginCtx {
            context: Box::new(PluginContext {
                user_data: std::ptr::null_mut(),
                config_params: params.as_ptr(),
                log_info: Some(plugin_log_info),
                log_error: Some(plugin_log_error),
            }),
            _params: params,
        };

        let init: Symbol<InitPluginFn> = unsafe { self.library.get(SYM_INIT_PLUGIN)? };
        let code = unsafe { init(ctx.context.as_mut() as *mut PluginContext) };
        if code != 0 {
            return Err(Error::Plugin(code));
        }
        Ok(ctx)
    }

    /// Call `process_batch` over the batch's storage and sync the mutated
    /// count and batch id back. Fails with [`Error::Plugin`] when the
    /// plugin moves `count` outside the capacity.
    pub fn process(&self, batch: &mut Batch, ctx: &mut PluginCtx) -> Result<i32> {
        let mut raw = RawBatch {
            records: batch.storage_mut().as_mut_ptr(),
            count: batch.count(),
            capacity: batch.capacity(),
            batch_id: batch.batch_id(),
        };

        let process: Symbol<ProcessBatchFn> = unsafe { self.library.get(SYM_PROCESS_BATCH)? };
        let code = unsafe {
            process(
                &mut raw as *mut RawBatch,
                ctx.context.as_mut() as *mut PluginContext,
            )
        };

        if !batch.set_count(raw.count) {
            return Err(Error::Plugin(raw.count as i32));
        }
        batch.set_batch_id(raw.batch_id);
        Ok(code)
    }

    /// Run `cleanup_plugin`; the context must not be used afterwards.
    pub fn cleanup(&self, ctx: &mut PluginCtx) {
        if let Ok(cleanup) = unsafe { self.library.get::<CleanupPluginFn>(SYM_CLEANUP_PLUGIN) } {
            unsafe { cleanup(ctx.context.as_mut() as *mut PluginContext) };
        }
    }

    /// Query `get_plugin_info` ("name", "version", "description", "author").
    pub fn info(&self, info_type: &str) -> Option<String> {
        let info: Symbol<PluginInfoFn> = unsafe { self.library.get(SYM_PLUGIN_INFO).ok()? };
        let info_type = CString::new(info_type).ok()?;
        let answer = unsafe { info(info_type.as_ptr()) };
        if answer.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(answer) }.to_string_lossy().into_owned())
    }
}

unsafe extern "C" fn plugin_log_info(message: *const c_char) {
    if message.is_null() {
        return;
    }
    let message = unsafe { CStr::from_ptr(message) }.to_string_lossy();
    tracing::info!(target: "plugin", "{message}");
}

unsafe extern "C" fn plugin_log_error(message: *const c_char) {
    if message.is_null() {
        return;
    }
    let message = unsafe { CStr::from_ptr(message) }.to_string_lossy();
    tracing::error!(target: "plugin", "{message}");
}
