//! C ABI entry points.
//!
//! Every function reports failure through its return value (`0` handle,
//! null string or `-1`) and leaves a message for
//! [`llama_bridge_last_error`] on the calling thread. Panics are caught
//! here and never unwind into the caller.

pub mod marshal;

use crate::bridge::{Bridge, Handle};
use crate::engine::{CandleEngine, Engine, StopReason};
use crate::error::{BridgeError, Result};
use once_cell::sync::OnceCell;
use std::any::Any;
use std::cell::RefCell;
use std::ffi::{c_void, CString};
use std::os::raw::c_char;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

/// Receives each generated piece. Return `0` to continue, anything else to
/// stop generation.
pub type TokenCallback = extern "C" fn(piece: *const c_char, user_data: *mut c_void) -> i32;

static BRIDGE: OnceCell<Bridge> = OnceCell::new();

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Use `engine` for the process-wide bridge. Only effective before the
/// first C ABI call; returns `false` once the bridge exists.
pub fn install_engine(engine: Arc<dyn Engine>) -> bool {
    BRIDGE.set(Bridge::new(engine)).is_ok()
}

/// The process-wide bridge, created with [`CandleEngine`] on first use.
pub fn bridge() -> &'static Bridge {
    BRIDGE.get_or_init(|| {
        crate::logging::init();
        Bridge::new(Arc::new(CandleEngine::new()))
    })
}

/// Message of the last failed call on this thread.
pub fn last_error_message() -> Option<String> {
    LAST_ERROR.with(|e| e.borrow().as_ref().map(|c| c.to_string_lossy().into_owned()))
}

fn set_last_error(err: &BridgeError) {
    let message = CString::new(err.to_string().replace('\0', "\\0")).unwrap_or_default();
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(message));
}

fn clear_last_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn ffi_call<T, F>(name: &str, failure: T, body: F) -> T
where
    F: FnOnce() -> Result<T>,
{
    clear_last_error();
    let err = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => return value,
        Ok(Err(err)) => err,
        Err(payload) => {
            let err = BridgeError::Panic(panic_message(payload.as_ref()));
            tracing::error!("{} panicked: {}", name, err);
            err
        }
    };
    tracing::debug!("{} failed: {}", name, err);
    set_last_error(&err);
    failure
}

fn to_handle(raw: i64) -> Result<Handle> {
    Handle::from_raw(raw as u64).ok_or(BridgeError::InvalidHandle(0))
}

fn stop_reason_code(reason: StopReason) -> i32 {
    match reason {
        StopReason::Eos => 0,
        StopReason::Length => 1,
        StopReason::StopSequence => 2,
        StopReason::Cancelled => 3,
    }
}

/// Load a model with default parameters. Returns `0` on failure.
///
/// # Safety
///
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn llama_bridge_initialize_model(path: *const c_char) -> i64 {
    ffi_call("initialize_model", 0, || {
        let path = unsafe { marshal::c_str(path, "path")? };
        Ok(bridge().initialize_model(path)?.into_raw() as i64)
    })
}

/// Load a model with a JSON options object applied over the defaults.
/// `options_json` may be null. Returns `0` on failure.
///
/// # Safety
///
/// `path` and `options_json` must each be null or a valid NUL-terminated
/// string.
#[no_mangle]
pub unsafe extern "C" fn llama_bridge_initialize_model_with_options(
    path: *const c_char,
    options_json: *const c_char,
) -> i64 {
    ffi_call("initialize_model_with_options", 0, || {
        let path = unsafe { marshal::c_str(path, "path")? };
        let bridge = bridge();
        let mut params = bridge.engine().default_params();
        if !options_json.is_null() {
            let json = unsafe { marshal::c_str(options_json, "options")? };
            params = params.with_json(json)?;
        }
        Ok(bridge.initialize_model_with(path, &params)?.into_raw() as i64)
    })
}

/// Generate a continuation of `prompt`. Returns null on failure; otherwise
/// the caller owns the string and must pass it to
/// [`llama_bridge_string_free`].
///
/// # Safety
///
/// `prompt` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn llama_bridge_generate(handle: i64, prompt: *const c_char) -> *mut c_char {
    ffi_call("generate", ptr::null_mut(), || {
        let handle = to_handle(handle)?;
        let prompt = unsafe { marshal::c_str(prompt, "prompt")? };
        let text = bridge().generate(handle, prompt)?;
        marshal::string_to_c(text)
    })
}

/// Generate while handing each piece to `callback`. Pieces are only valid
/// during the callback. Returns the stop reason (`0` end of sequence, `1`
/// length, `2` stop sequence, `3` cancelled by the callback) or `-1`.
///
/// # Safety
///
/// `prompt` must be null or a valid NUL-terminated string. `user_data` is
/// passed through untouched and must be valid for whatever `callback` does
/// with it.
#[no_mangle]
pub unsafe extern "C" fn llama_bridge_generate_stream(
    handle: i64,
    prompt: *const c_char,
    callback: Option<TokenCallback>,
    user_data: *mut c_void,
) -> i32 {
    ffi_call("generate_stream", -1, || {
        let callback = callback.ok_or(BridgeError::NullPointer("callback"))?;
        let handle = to_handle(handle)?;
        let prompt = unsafe { marshal::c_str(prompt, "prompt")? };

        let generation = bridge().generate_stream(handle, prompt, |piece| {
            let piece = CString::new(piece.replace('\0', "")).unwrap_or_default();
            callback(piece.as_ptr(), user_data) == 0
        })?;
        Ok(stop_reason_code(generation.stop_reason))
    })
}

/// Release a model. Returns `0`, or `-1` for an unknown or already released
/// handle.
#[no_mangle]
pub extern "C" fn llama_bridge_free_model(handle: i64) -> i32 {
    ffi_call("free_model", -1, || {
        bridge().free_model(to_handle(handle)?)?;
        Ok(0)
    })
}

/// Release a string returned by [`llama_bridge_generate`]. Null is ignored.
///
/// # Safety
///
/// `s` must be null or a string from [`llama_bridge_generate`] that has not
/// been released yet.
#[no_mangle]
pub unsafe extern "C" fn llama_bridge_string_free(s: *mut c_char) {
    unsafe { marshal::free_c_string(s) }
}

/// Message describing the last failure on this thread, or null. The pointer
/// stays valid until the next bridge call on the same thread.
#[no_mangle]
pub extern "C" fn llama_bridge_last_error() -> *const c_char {
    LAST_ERROR.with(|e| e.borrow().as_ref().map_or(ptr::null(), |c| c.as_ptr()))
}

/// Number of live model handles.
#[no_mangle]
pub extern "C" fn llama_bridge_live_models() -> i64 {
    ffi_call("live_models", 0, || Ok(bridge().live_models() as i64))
}
