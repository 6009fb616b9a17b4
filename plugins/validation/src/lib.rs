//! Validation plugin: range- and format-checks every record in a batch.
//!
//! In strict mode the first bad record fails the batch with a distinct
//! negative code; otherwise records are corrected in place. Parameters:
//! `strict_mode`, `min_id`, `max_id`, `min_value`, `max_value`.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};

pub const NAME_LEN: usize = 100;

// ABI structs shared with the Conveyor coordinator; layouts must match the
// runtime exactly.
#[repr(C, packed(4))]
pub struct Record {
    pub id: i32,
    pub name: [u8; NAME_LEN],
    pub value: f64,
    pub category: i32,
}

#[repr(C)]
pub struct RecordBatch {
    pub records: *mut Record,
    pub count: usize,
    pub capacity: usize,
    pub batch_id: i32,
}

#[repr(C)]
pub struct PluginContext {
    pub user_data: *mut c_void,
    pub config_params: *const c_char,
    pub log_info: Option<unsafe extern "C" fn(*const c_char)>,
    pub log_error: Option<unsafe extern "C" fn(*const c_char)>,
}

struct ValidationState {
    strict_mode: bool,
    min_id: i32,
    max_id: i32,
    min_value: f64,
    max_value: f64,
    records_validated: u64,
    records_corrected: u64,
}

impl Default for ValidationState {
    fn default() -> Self {
        ValidationState {
            strict_mode: false,
            min_id: 1,
            max_id: 999_999,
            min_value: 0.0,
            max_value: 100_000.0,
            records_validated: 0,
            records_corrected: 0,
        }
    }
}

fn parse_params(params: &str) -> ValidationState {
    let mut state = ValidationState::default();
    for pair in params.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key.trim() {
            "strict_mode" => state.strict_mode = value == "true",
            "min_id" => state.min_id = value.parse().unwrap_or(state.min_id),
            "max_id" => state.max_id = value.parse().unwrap_or(state.max_id),
            "min_value" => state.min_value = value.parse().unwrap_or(state.min_value),
            "max_value" => state.max_value = value.parse().unwrap_or(state.max_value),
            _ => {}
        }
    }
    state
}

fn log(callback: Option<unsafe extern "C" fn(*const c_char)>, message: &str) {
    if let (Some(callback), Ok(message)) = (callback, CString::new(message)) {
        unsafe { callback(message.as_ptr()) };
    }
}

fn name_str(name: &[u8; NAME_LEN]) -> &str {
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    std::str::from_utf8(&name[..end]).unwrap_or("")
}

fn set_name(name: &mut [u8; NAME_LEN], text: &str) {
    *name = [0u8; NAME_LEN];
    let bytes = text.as_bytes();
    let len = bytes.len().min(NAME_LEN - 1);
    name[..len].copy_from_slice(&bytes[..len]);
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// # Safety
/// `context` must point to a live `PluginContext` whose `config_params`
/// is NUL-terminated or null.
#[no_mangle]
pub unsafe extern "C" fn init_plugin(context: *mut PluginContext) -> c_int {
    let Some(context) = (unsafe { context.as_mut() }) else {
        return -1;
    };
    let params = if context.config_params.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(context.config_params) }
            .to_string_lossy()
            .into_owned()
    };

    let state = Box::new(parse_params(&params));
    log(
        context.log_info,
        &format!(
            "validation plugin ready: strict={}, id range {}..={}, value range {:.2}..={:.2}",
            state.strict_mode, state.min_id, state.max_id, state.min_value, state.max_value
        ),
    );
    context.user_data = Box::into_raw(state) as *mut c_void;
    0
}

/// # Safety
/// `context` must have been initialized by `init_plugin`.
#[no_mangle]
pub unsafe extern "C" fn cleanup_plugin(context: *mut PluginContext) {
    let Some(context) = (unsafe { context.as_mut() }) else {
        return;
    };
    if context.user_data.is_null() {
        return;
    }
    let state = unsafe { Box::from_raw(context.user_data as *mut ValidationState) };
    log(
        context.log_info,
        &format!(
            "validation plugin: {} records validated, {} corrected",
            state.records_validated, state.records_corrected
        ),
    );
    context.user_data = std::ptr::null_mut();
}

/// # Safety
/// `batch` must describe a live record array of at least `count` records;
/// `context` must have been initialized by `init_plugin`.
#[no_mangle]
pub unsafe extern "C" fn process_batch(
    batch: *mut RecordBatch,
    context: *mut PluginContext,
) -> c_int {
    let (Some(batch), Some(context)) = (unsafe { batch.as_mut() }, unsafe { context.as_mut() })
    else {
        return -1;
    };
    if context.user_data.is_null() || batch.records.is_null() {
        return -1;
    }
    let state = unsafe { &mut *(context.user_data as *mut ValidationState) };
    let records = unsafe { std::slice::from_raw_parts_mut(batch.records, batch.count) };

    for (index, record) in records.iter_mut().enumerate() {
        state.records_validated += 1;
        let mut corrected = false;

        let id = record.id;
        if id < state.min_id || id > state.max_id {
            if state.strict_mode {
                log(
                    context.log_error,
                    &format!("record {index}: id {id} out of range"),
                );
                return -2;
            }
            record.id = id.clamp(state.min_id, state.max_id);
            corrected = true;
        }

        if !is_valid_name(name_str(&record.name)) {
            if state.strict_mode {
                log(
                    context.log_error,
                    &format!("record {index}: invalid name {:?}", name_str(&record.name)),
                );
                return -3;
            }
            let id = record.id;
            set_name(&mut record.name, &format!("Record_{id}"));
            corrected = true;
        }

        let value = record.value;
        if value < state.min_value || value > state.max_value {
            if state.strict_mode {
                log(
                    context.log_error,
                    &format!("record {index}: value {value:.2} out of range"),
                );
                return -4;
            }
            record.value = value.clamp(state.min_value, state.max_value);
            corrected = true;
        }

        let category = record.category;
        if !(1..=10).contains(&category) {
            if state.strict_mode {
                log(
                    context.log_error,
                    &format!("record {index}: invalid category {category}"),
                );
                return -5;
            }
            record.category = 1;
            corrected = true;
        }

        if corrected {
            state.records_corrected += 1;
        }
    }

    0
}

/// # Safety
/// `info_type` must be NUL-terminated or null.
#[no_mangle]
pub unsafe extern "C" fn get_plugin_info(info_type: *const c_char) -> *const c_char {
    if info_type.is_null() {
        return std::ptr::null();
    }
    match unsafe { CStr::from_ptr(info_type) }.to_bytes() {
        b"name" => c"Record Validation Plugin".as_ptr(),
        b"version" => c"1.2.0".as_ptr(),
        b"description" => {
            c"Validates record ranges and names, with strict or corrective modes".as_ptr()
        }
        b"author" => c"Conveyor Maintainers".as_ptr(),
        _ => std::ptr::null(),
    }
}
