//! Enrichment plugin: scales record values and tags names with a
//! category-derived suffix.
//!
//! Parameters: `factor` (value multiplier, default 1.1) and
//! `suffix_format` (appended to the name with `%d` replaced by the
//! record's category, default `_CAT%d`).

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

struct EnrichmentState {
    factor: f64,
    suffix_format: String,
    records_enriched: u64,
}

fn parse_params(params: &str) -> EnrichmentState {
    let mut state = EnrichmentState {
        factor: 1.1,
        suffix_format: "_CAT%d".to_string(),
        records_enriched: 0,
    };
    for pair in params.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key.trim() {
            "factor" => state.factor = value.parse().unwrap_or(state.factor),
            "suffix_format" => state.suffix_format = value.to_string(),
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

fn name_len(name: &[u8; NAME_LEN]) -> usize {
    name.iter().position(|&b| b == 0).unwrap_or(name.len())
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
            "enrichment plugin ready: factor={:.2}, suffix_format={}",
            state.factor, state.suffix_format
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
    let state = unsafe { Box::from_raw(context.user_data as *mut EnrichmentState) };
    log(
        context.log_info,
        &format!("enrichment plugin: {} records enriched", state.records_enriched),
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
    let state = unsafe { &mut *(context.user_data as *mut EnrichmentState) };
    let records = unsafe { std::slice::from_raw_parts_mut(batch.records, batch.count) };

    for record in records.iter_mut() {
        let value = record.value;
        record.value = value * state.factor;

        let category = record.category;
        let suffix = state.suffix_format.replace("%d", &category.to_string());
        let current = name_len(&record.name);
        // Leave the name alone when the suffix would not fit with its
        // terminator.
        if current + suffix.len() < NAME_LEN - 1 {
            record.name[current..current + suffix.len()].copy_from_slice(suffix.as_bytes());
        }

        state.records_enriched += 1;
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
        b"name" => c"Record Enrichment Plugin".as_ptr(),
        b"version" => c"1.1.0".as_ptr(),
        b"description" => {
            c"Scales record values and appends configurable category suffixes".as_ptr()
        }
        b"author" => c"Conveyor Maintainers".as_ptr(),
        _ => std::ptr::null(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i32, name: &str, value: f64, category: i32) -> Record {
        let mut n = [0u8; NAME_LEN];
        let bytes = name.as_bytes();
        n[..bytes.len()].copy_from_slice(bytes);
        Record {
            id,
            name: n,
            value,
            category,
        }
    }

    fn name_str(name: &[u8; NAME_LEN]) -> String {
        String::from_utf8_lossy(&name[..name_len(name)]).into_owned()
    }

    fn with_plugin(params: &str, records: &mut [Record]) -> c_int {
        let params = CString::new(params).unwrap();
        let mut context = PluginContext {
            user_data: std::ptr::null_mut(),
            config_params: params.as_ptr(),
            log_info: None,
            log_error: None,
        };
        assert_eq!(unsafe { init_plugin(&mut context) }, 0);

        let mut batch = RecordBatch {
            records: records.as_mut_ptr(),
            count: records.len(),
            capacity: records.len(),
            batch_id: 1,
        };
        let code = unsafe { process_batch(&mut batch, &mut context) };
        unsafe { cleanup_plugin(&mut context) };
        code
    }

    #[test]
    fn default_enrichment_matches_expected_post_image() {
        let mut records = [
            record(1, "R1", 10.0, 1),
            record(2, "R2", 20.0, 2),
            record(3, "R3", 30.0, 3),
        ];
        assert_eq!(with_plugin("factor=1.1,suffix_format=_CAT%d", &mut records), 0);

        assert_eq!(name_str(&records[0].name), "R1_CAT1");
        assert_eq!(name_str(&records[1].name), "R2_CAT2");
        assert_eq!(name_str(&records[2].name), "R3_CAT3");
        assert!(({ records[0].value } - 11.0).abs() < 1e-9);
        assert!(({ records[1].value } - 22.0).abs() < 1e-9);
        assert!(({ records[2].value } - 33.0).abs() < 1e-9);
    }

    #[test]
    fn custom_factor_applies() {
        let mut records = [record(1, "R1", 100.0, 1)];
        assert_eq!(with_plugin("factor=0.5", &mut records), 0);
        assert!(({ records[0].value } - 50.0).abs() < 1e-9);
    }

    #[test]
    fn oversized_suffix_leaves_name_alone() {
        let long_name = "n".repeat(97);
        let mut records = [record(1, &long_name, 1.0, 123_456)];
        assert_eq!(with_plugin("", &mut records), 0);
        assert_eq!(name_str(&records[0].name), long_name);
    }
}
