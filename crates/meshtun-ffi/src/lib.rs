//! # meshtun-ffi - C ABI for meshtun
//!
//! Thin adapter from primitive C arguments to the Rust API. All handle
//! ownership and cleanup stays in `meshtun-core`; this crate only turns
//! integers and strings into calls on one process-wide [`Boundary`].
//!
//! ## Functions
//!
//! - `meshtun_init` - install logging and create the boundary (idempotent)
//! - `meshtun_open_tunnel` - open a tunnel over two host descriptors
//! - `meshtun_set_addresses` - replace the relay address set
//! - `meshtun_shutdown` - stop all sessions and the mesh
//! - `meshtun_version` - static version string
//!
//! ## Safety
//!
//! Callers must pass valid pointers and null-terminated UTF-8 strings, and
//! must not call these functions from a tokio worker thread.

#![cfg(unix)]

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};

use tracing::error;

pub mod boundary;
pub mod error;
pub mod mesh;
pub mod tunnel;

pub use boundary::Boundary;
pub use error::{BoundaryError, MeshtunStatus};

/// Initialize logging and the process boundary.
///
/// Safe to call multiple times. The other functions initialize lazily, so
/// calling this is only required to surface initialization failures early.
/// Returns `0` on success.
#[unsafe(no_mangle)]
pub extern "C" fn meshtun_init() -> c_int {
    match boundary::global() {
        Ok(_) => MeshtunStatus::Success.as_c_int(),
        Err(err) => {
            error!(error = %err, "meshtun init failed");
            err.status().as_c_int()
        }
    }
}

/// Stop every tunnel session and close the relay mesh.
///
/// A later call to any other function creates a fresh boundary.
#[unsafe(no_mangle)]
pub extern "C" fn meshtun_shutdown() {
    boundary::shutdown_global();
}

/// Get the version string of the meshtun library
///
/// Returns a pointer to a static null-terminated string.
/// Caller must NOT free this pointer.
#[unsafe(no_mangle)]
pub extern "C" fn meshtun_version() -> *const c_char {
    const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr() as *const c_char
}

/// Convert a C string to an owned Rust string
///
/// # Safety
///
/// - `s` must be null or a valid null-terminated string
pub(crate) unsafe fn from_c_string(s: *const c_char) -> Option<String> {
    if s.is_null() {
        None
    } else {
        // SAFETY: non-null and null-terminated per the caller's contract.
        unsafe { CStr::from_ptr(s) }
            .to_str()
            .ok()
            .map(str::to_string)
    }
}
