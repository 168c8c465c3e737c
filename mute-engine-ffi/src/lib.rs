//! FFI bindings for the Audio Endpoint Mute Manager.
//!
//! This crate provides C ABI functions for use from C# via P/Invoke.
//! All functions use panic::catch_unwind to prevent Rust panics from
//! unwinding across the FFI boundary.
//!
//! Data flows are passed as integers: 0 = capture, 1 = render.

use mute_manager_rs::{
    AppState, AudioError, Command, DataFlow, DeviceId, DeviceSummary, EngineConfig,
};
use serde::Serialize;
use std::cell::RefCell;
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic;
use std::ptr;
use std::sync::Once;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Error Handling
// ============================================================================

/// Error codes returned by FFI functions.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    InvalidHandle = -1,
    InvalidArgument = -2,
    DeviceNotFound = -3,
    ComError = -4,
    JsonError = -5,
    VolumeNotAvailable = -6,
    SubscriptionFailed = -7,
    Panic = -99,
}

impl From<AudioError> for ErrorCode {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::DeviceNotFound { .. } => ErrorCode::DeviceNotFound,
            AudioError::VolumeNotAvailable { .. } => ErrorCode::VolumeNotAvailable,
            AudioError::SubscriptionFailed(_) => ErrorCode::SubscriptionFailed,
            AudioError::StringConversion(_) => ErrorCode::InvalidArgument,
            AudioError::ComInitFailed(_)
            | AudioError::EnumerationFailed(_)
            | AudioError::HardwareCallFailed { .. } => ErrorCode::ComError,
        }
    }
}

/// Thread-local storage for the last error.
thread_local! {
    static LAST_ERROR: RefCell<Option<(ErrorCode, String)>> = const { RefCell::new(None) };
}

fn set_last_error(code: ErrorCode, message: impl Into<String>) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = Some((code, message.into()));
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

// ============================================================================
// Data Types for JSON Serialization
// ============================================================================

/// Response containing the device list of one flow, "all devices" first.
#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    pub flow: DataFlow,
    pub devices: Vec<DeviceSummary>,
}

/// Response containing operation result.
#[derive(Debug, Serialize)]
pub struct OperationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
}

// ============================================================================
// Engine Handle Type
// ============================================================================

/// Opaque handle to the engine. Actually points to a MuteEngine struct.
pub type MuteEngineHandle = *mut c_void;

/// Internal engine state.
struct MuteEngine {
    app: AppState,
}

impl MuteEngine {
    fn into_handle(self) -> MuteEngineHandle {
        Box::into_raw(Box::new(self)) as MuteEngineHandle
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

static TRACING: Once = Once::new();

/// Install the global subscriber on first use. The host may already have one.
fn init_tracing(level: Option<&str>) {
    TRACING.call_once(|| {
        let filter = match level {
            Some(level) => EnvFilter::new(level),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        };
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// Allocate a C string from a Rust string. Caller must free with mute_engine_free_string.
fn alloc_c_string(s: &str) -> *mut c_char {
    // Interior nul bytes cannot cross the boundary; drop them
    let bytes: Vec<u8> = s.bytes().filter(|b| *b != 0).collect();
    match CString::new(bytes) {
        Ok(cs) => cs.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Parse a C string to a Rust string slice.
unsafe fn parse_c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Borrow the engine behind a handle.
unsafe fn engine<'a>(handle: MuteEngineHandle) -> Option<&'a MuteEngine> {
    (handle as *const MuteEngine).as_ref()
}

fn parse_flow(flow: i32) -> Option<DataFlow> {
    match flow {
        0 => Some(DataFlow::Capture),
        1 => Some(DataFlow::Render),
        _ => None,
    }
}

/// Resolve handle and flow, recording the error on failure.
unsafe fn target<'a>(
    handle: MuteEngineHandle,
    flow: i32,
) -> Result<(&'a MuteEngine, DataFlow), ErrorCode> {
    let Some(engine) = engine(handle) else {
        set_last_error(ErrorCode::InvalidHandle, "Invalid engine handle");
        return Err(ErrorCode::InvalidHandle);
    };
    let Some(flow) = parse_flow(flow) else {
        set_last_error(ErrorCode::InvalidArgument, format!("Invalid data flow {flow}"));
        return Err(ErrorCode::InvalidArgument);
    };
    Ok((engine, flow))
}

fn to_json<T: Serialize>(value: &T) -> *mut c_char {
    match serde_json::to_string(value) {
        Ok(json) => alloc_c_string(&json),
        Err(e) => {
            set_last_error(ErrorCode::JsonError, e.to_string());
            ptr::null_mut()
        }
    }
}

/// Run a command-style entry point: 0 on success, negative error code on failure.
fn run_command(
    handle: MuteEngineHandle,
    flow: i32,
    what: &str,
    command: impl FnOnce() -> Result<Command, ErrorCode> + panic::UnwindSafe,
) -> i32 {
    clear_last_error();

    let result = panic::catch_unwind(|| {
        let (engine, flow) = match unsafe { target(handle, flow) } {
            Ok(target) => target,
            Err(code) => return code as i32,
        };
        match command() {
            Ok(command) => {
                engine.app.handle(flow, command);
                ErrorCode::Success as i32
            }
            Err(code) => code as i32,
        }
    });

    match result {
        Ok(code) => code,
        Err(_) => {
            set_last_error(ErrorCode::Panic, format!("Panic during {what}"));
            ErrorCode::Panic as i32
        }
    }
}

// ============================================================================
// FFI Functions - Lifecycle
// ============================================================================

/// Create a new engine instance and start watching for device changes.
///
/// # Arguments
/// * `config_json` - JSON `EngineConfig` (can be null for defaults)
///
/// # Returns
/// Handle to the engine, or null on failure. Check mute_engine_last_error_code() on failure.
///
/// # Safety
/// The returned handle must be freed with mute_engine_destroy().
#[no_mangle]
pub extern "C" fn mute_engine_create(config_json: *const c_char) -> MuteEngineHandle {
    clear_last_error();

    let result = panic::catch_unwind(|| {
        let config = if config_json.is_null() {
            EngineConfig::default()
        } else {
            let Some(json) = (unsafe { parse_c_str(config_json) }) else {
                set_last_error(ErrorCode::InvalidArgument, "Configuration is not valid UTF-8");
                return ptr::null_mut();
            };
            match EngineConfig::from_json(json) {
                Ok(config) => config,
                Err(e) => {
                    set_last_error(ErrorCode::JsonError, format!("Invalid configuration: {e}"));
                    return ptr::null_mut();
                }
            }
        };

        init_tracing(config.log_level.as_deref());

        match AppState::with_default_backend(config) {
            Ok(app) => {
                info!("Engine created");
                MuteEngine { app }.into_handle()
            }
            Err(e) => {
                warn!(error = %e, "Engine creation failed");
                set_last_error(ErrorCode::from(e.clone()), e.to_string());
                ptr::null_mut()
            }
        }
    });

    match result {
        Ok(handle) => handle,
        Err(_) => {
            set_last_error(ErrorCode::Panic, "Panic during engine creation");
            ptr::null_mut()
        }
    }
}

/// Destroy an engine instance, stopping its watcher threads.
///
/// # Safety
/// The handle must have been created by mute_engine_create() and must not be used after this call.
#[no_mangle]
pub extern "C" fn mute_engine_destroy(handle: MuteEngineHandle) {
    if handle.is_null() {
        return;
    }

    let _ = panic::catch_unwind(|| {
        unsafe {
            let _ = Box::from_raw(handle as *mut MuteEngine);
        }
    });
}

// ============================================================================
// FFI Functions - Queries
// ============================================================================

/// Get the device list of a flow, "all devices" first.
///
/// # Returns
/// JSON string containing the device list. Caller must free with mute_engine_free_string().
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn mute_engine_get_devices(handle: MuteEngineHandle, flow: i32) -> *mut c_char {
    clear_last_error();

    let result = panic::catch_unwind(|| {
        let (engine, flow) = match unsafe { target(handle, flow) } {
            Ok(target) => target,
            Err(_) => return ptr::null_mut(),
        };
        to_json(&DeviceListResponse {
            flow,
            devices: engine.app.devices(flow),
        })
    });

    match result {
        Ok(json) => json,
        Err(_) => {
            set_last_error(ErrorCode::Panic, "Panic during device enumeration");
            ptr::null_mut()
        }
    }
}

/// Get the controller state of a flow: selection, active device, mute, volume.
///
/// # Returns
/// JSON string. Caller must free with mute_engine_free_string().
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn mute_engine_get_state(handle: MuteEngineHandle, flow: i32) -> *mut c_char {
    clear_last_error();

    let result = panic::catch_unwind(|| {
        let (engine, flow) = match unsafe { target(handle, flow) } {
            Ok(target) => target,
            Err(_) => return ptr::null_mut(),
        };
        to_json(&engine.app.status(flow))
    });

    match result {
        Ok(json) => json,
        Err(_) => {
            set_last_error(ErrorCode::Panic, "Panic during state query");
            ptr::null_mut()
        }
    }
}

// ============================================================================
// FFI Functions - Commands
// ============================================================================

/// Select the device a flow's controller acts on.
///
/// # Arguments
/// * `device_id` - Endpoint id (UTF-8); null or empty selects all devices
///
/// # Returns
/// 0 on success, negative error code on failure. Unknown ids are accepted and
/// take effect once the device appears.
#[no_mangle]
pub extern "C" fn mute_engine_select_device(
    handle: MuteEngineHandle,
    flow: i32,
    device_id: *const c_char,
) -> i32 {
    run_command(handle, flow, "select device", || {
        if device_id.is_null() {
            return Ok(Command::Select(DeviceId::all()));
        }
        match unsafe { parse_c_str(device_id) } {
            Some(id) => Ok(Command::Select(DeviceId::new(id))),
            None => {
                set_last_error(ErrorCode::InvalidArgument, "Invalid device ID");
                Err(ErrorCode::InvalidArgument)
            }
        }
    })
}

/// Set the mute state of a flow's selected device(s).
///
/// # Arguments
/// * `muted` - 1 = muted, 0 = unmuted
#[no_mangle]
pub extern "C" fn mute_engine_set_mute(handle: MuteEngineHandle, flow: i32, muted: i32) -> i32 {
    run_command(handle, flow, "set mute", || {
        Ok(if muted != 0 {
            Command::Mute
        } else {
            Command::Unmute
        })
    })
}

/// Set the volume of a flow's selected device(s).
///
/// # Arguments
/// * `volume` - Volume level (0.0 to 1.0, clamped)
#[no_mangle]
pub extern "C" fn mute_engine_set_volume(handle: MuteEngineHandle, flow: i32, volume: f32) -> i32 {
    run_command(handle, flow, "set volume", || {
        if volume.is_nan() {
            set_last_error(ErrorCode::InvalidArgument, "Volume is NaN");
            return Err(ErrorCode::InvalidArgument);
        }
        Ok(Command::SetVolume(volume))
    })
}

/// Re-enumerate a flow's endpoints now instead of waiting for a notification.
#[no_mangle]
pub extern "C" fn mute_engine_refresh(handle: MuteEngineHandle, flow: i32) -> i32 {
    run_command(handle, flow, "refresh", || Ok(Command::Refresh))
}

/// Toggle the mute state of a flow's selected device(s).
///
/// # Returns
/// JSON string with the result (includes new mute state). Caller must free with mute_engine_free_string().
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn mute_engine_toggle_mute(handle: MuteEngineHandle, flow: i32) -> *mut c_char {
    clear_last_error();

    let result = panic::catch_unwind(|| {
        let (engine, flow) = match unsafe { target(handle, flow) } {
            Ok(target) => target,
            Err(_) => return ptr::null_mut(),
        };
        let status = engine.app.handle(flow, Command::ToggleMute);
        to_json(&OperationResult {
            success: true,
            error: None,
            is_muted: status.is_muted,
        })
    });

    match result {
        Ok(json) => json,
        Err(_) => {
            set_last_error(ErrorCode::Panic, "Panic during toggle mute");
            ptr::null_mut()
        }
    }
}

// ============================================================================
// FFI Functions - Memory Management
// ============================================================================

/// Free a string allocated by this library.
///
/// # Safety
/// The pointer must have been returned by one of the mute_engine_* functions.
/// Do not call this on strings from other sources.
#[no_mangle]
pub extern "C" fn mute_engine_free_string(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }

    let _ = panic::catch_unwind(|| {
        unsafe {
            let _ = CString::from_raw(ptr);
        }
    });
}

// ============================================================================
// FFI Functions - Error Handling
// ============================================================================

/// Get the last error code.
///
/// # Returns
/// The error code from the last failed operation, or 0 if no error.
#[no_mangle]
pub extern "C" fn mute_engine_last_error_code() -> i32 {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map(|(code, _)| *code as i32)
            .unwrap_or(0)
    })
}

/// Get the last error message.
///
/// # Returns
/// Error message string. Caller must free with mute_engine_free_string().
/// Returns null if no error.
#[no_mangle]
pub extern "C" fn mute_engine_last_error_message() -> *mut c_char {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map(|(_, msg)| alloc_c_string(msg))
            .unwrap_or(ptr::null_mut())
    })
}

// ============================================================================
// FFI Functions - Utility
// ============================================================================

/// Get the library version.
///
/// # Returns
/// Version string. Caller must free with mute_engine_free_string().
#[no_mangle]
pub extern "C" fn mute_engine_version() -> *mut c_char {
    alloc_c_string(env!("CARGO_PKG_VERSION"))
}

// ============================================================================
// Tests
// ============================================================================
