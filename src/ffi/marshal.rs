//! Conversions between Rust strings and NUL-terminated UTF-8 C strings.

use crate::error::{BridgeError, Result};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

/// Borrow a caller's C string as `&str`.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated buffer that stays valid
/// and unmodified for `'a`.
pub unsafe fn c_str<'a>(ptr: *const c_char, what: &'static str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(BridgeError::NullPointer(what));
    }
    let raw = unsafe { CStr::from_ptr(ptr) };
    raw.to_str().map_err(|source| BridgeError::InvalidUtf8 { what, source })
}

/// Hand a string to the caller. The caller releases it with
/// `llama_bridge_string_free`.
pub fn string_to_c(s: String) -> Result<*mut c_char> {
    CString::new(s)
        .map(CString::into_raw)
        .map_err(|e| BridgeError::InteriorNul(e.nul_position()))
}

/// Take back a string produced by [`string_to_c`].
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by [`string_to_c`] that has not
/// been freed yet.
pub unsafe fn free_c_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(unsafe { CString::from_raw(ptr) });
    }
}
