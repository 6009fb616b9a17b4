//! Aggregation plugin: keeps running statistics (count, mean, stddev, min,
//! max) over every record it sees. The batch itself is left untouched.
//!
//! Parameter: `compute_stats` (default `true`); when false the plugin is a
//! pass-through.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::sync::Mutex;

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

#[derive(Default)]
struct RunningStats {
    total_sum: f64,
    total_sum_squared: f64,
    total_count: u64,
    min_value: Option<f64>,
    max_value: Option<f64>,
}

struct AggregationState {
    compute_stats: bool,
    stats: Mutex<RunningStats>,
}

fn parse_params(params: &str) -> AggregationState {
    let mut compute_stats = true;
    for pair in params.split(',') {
        if let Some((key, value)) = pair.split_once('=') {
            if key.trim() == "compute_stats" {
                compute_stats = value == "true";
            }
        }
    }
    AggregationState {
        compute_stats,
        stats: Mutex::new(RunningStats::default()),
    }
}

fn log(callback: Option<unsafe extern "C" fn(*const c_char)>, message: &str) {
    if let (Some(callback), Ok(message)) = (callback, CString::new(message)) {
        unsafe { callback(message.as_ptr()) };
    }
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
    log(context.log_info, "aggregation plugin ready");
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
    let state = unsafe { Box::from_raw(context.user_data as *mut AggregationState) };
    let stats = state.stats.lock().unwrap();
    if stats.total_count > 0 {
        let mean = stats.total_sum / stats.total_count as f64;
        let variance = (stats.total_sum_squared / stats.total_count as f64) - mean * mean;
        log(
            context.log_info,
            &format!(
                "final statistics: records={}, mean={:.2}, stddev={:.2}, min={:.2}, max={:.2}",
                stats.total_count,
                mean,
                variance.max(0.0).sqrt(),
                stats.min_value.unwrap_or(0.0),
                stats.max_value.unwrap_or(0.0),
            ),
        );
    }
    drop(stats);
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
    let state = unsafe { &*(context.user_data as *mut AggregationState) };
    if !state.compute_stats {
        return 0;
    }
    let records = unsafe { std::slice::from_raw_parts(batch.records, batch.count) };

    let mut batch_sum = 0.0;
    let mut batch_sum_squared = 0.0;
    let mut batch_min = f64::INFINITY;
    let mut batch_max = f64::NEG_INFINITY;
    for record in records {
        let value = record.value;
        batch_sum += value;
        batch_sum_squared += value * value;
        batch_min = batch_min.min(value);
        batch_max = batch_max.max(value);
    }

    let mut stats = state.stats.lock().unwrap();
    stats.total_sum += batch_sum;
    stats.total_sum_squared += batch_sum_squared;
    stats.total_count += records.len() as u64;
    if !records.is_empty() {
        stats.min_value = Some(stats.min_value.map_or(batch_min, |m| m.min(batch_min)));
        stats.max_value = Some(stats.max_value.map_or(batch_max, |m| m.max(batch_max)));
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
        b"name" => c"Statistical Aggregation Plugin".as_ptr(),
        b"version" => c"1.0.0".as_ptr(),
        b"description" => c"Streaming count/mean/stddev/min/max over record values".as_ptr(),
        b"author" => c"Conveyor Maintainers".as_ptr(),
        _ => std::ptr::null(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(value: f64) -> Record {
        Record {
            id: 1,
            name: [0u8; NAME_LEN],
            value,
            category: 1,
        }
    }

    fn run(params: &str, values: &[f64]) -> (c_int, Option<RunningStats>) {
        let params = CString::new(params).unwrap();
        let mut context = PluginContext {
            user_data: std::ptr::null_mut(),
            config_params: params.as_ptr(),
            log_info: None,
            log_error: None,
        };
        assert_eq!(unsafe { init_plugin(&mut context) }, 0);

        let mut records: Vec<Record> = values.iter().map(|&v| record(v)).collect();
        let mut batch = RecordBatch {
            records: records.as_mut_ptr(),
            count: records.len(),
            capacity: records.len(),
            batch_id: 1,
        };
        let code = unsafe { process_batch(&mut batch, &mut context) };

        let stats = {
            let state = unsafe { &*(context.user_data as *mut AggregationState) };
            let stats = state.stats.lock().unwrap();
            Some(RunningStats {
                total_sum: stats.total_sum,
                total_sum_squared: stats.total_sum_squared,
                total_count: stats.total_count,
                min_value: stats.min_value,
                max_value: stats.max_value,
            })
        };
        unsafe { cleanup_plugin(&mut context) };
        (code, stats)
    }

    #[test]
    fn stats_accumulate_over_a_batch() {
        let (code, stats) = run("", &[10.0, 20.0, 30.0]);
        assert_eq!(code, 0);
        let stats = stats.unwrap();
        assert_eq!(stats.total_count, 3);
        assert!((stats.total_sum - 60.0).abs() < 1e-9);
        assert_eq!(stats.min_value, Some(10.0));
        assert_eq!(stats.max_value, Some(30.0));
    }

    #[test]
    fn disabled_stats_are_a_pass_through() {
        let (code, stats) = run("compute_stats=false", &[10.0]);
        assert_eq!(code, 0);
        assert_eq!(stats.unwrap().total_count, 0);
    }

    #[test]
    fn empty_batch_is_fine() {
        let (code, stats) = run("", &[]);
        assert_eq!(code, 0);
        let stats = stats.unwrap();
        assert_eq!(stats.total_count, 0);
        assert_eq!(stats.min_value, None);
    }
}
