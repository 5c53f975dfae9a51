//! Relay mesh FFI

use std::os::raw::c_char;

use tracing::warn;

use crate::error::BoundaryError;
use crate::{boundary, from_c_string};

/// Copy a C array of C strings into owned strings.
///
/// # Safety
///
/// `addresses` must be null or point to `len` readable pointers, each null
/// or a valid null-terminated string.
unsafe fn collect_addresses(
    addresses: *const *const c_char,
    len: usize,
) -> Result<Vec<String>, BoundaryError> {
    if len == 0 {
        return Ok(Vec::new());
    }
    if addresses.is_null() {
        return Err(BoundaryError::InvalidArgument(format!(
            "address array is null with length {len}"
        )));
    }

    // SAFETY: the caller guarantees `len` readable entries.
    let entries = unsafe { std::slice::from_raw_parts(addresses, len) };
    entries
        .iter()
        .enumerate()
        .map(|(i, &entry)| {
            // SAFETY: each entry is null or a valid C string.
            unsafe { from_c_string(entry) }.ok_or_else(|| {
                BoundaryError::InvalidArgument(format!("address {i} is null or not UTF-8"))
            })
        })
        .collect()
}

/// Replace the set of relay addresses the mesh connects to.
///
/// Links to addresses already in the set are left running. If any entry
/// is null, not UTF-8, or not a valid relay address the whole call is
/// ignored and logged. Connection failures are never reported here.
///
/// # Safety
///
/// - `addresses` must be null (only when `len` is 0) or point to `len`
///   pointers
/// - each pointer must be a valid null-terminated string
#[unsafe(no_mangle)]
pub unsafe extern "C" fn meshtun_set_addresses(addresses: *const *const c_char, len: usize) {
    // SAFETY: forwarded from this function's contract.
    let addresses = match unsafe { collect_addresses(addresses, len) } {
        Ok(addresses) => addresses,
        Err(err) => {
            warn!(error = %err, "set_addresses ignored");
            return;
        }
    };

    match boundary::global() {
        Ok(boundary) => {
            let _ = boundary.set_addresses(&addresses);
        }
        Err(err) => warn!(error = %err, "meshtun boundary unavailable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_collect_addresses() {
        let owned = [CString::new("relay-a:7400").unwrap(), CString::new("relay-b:7400").unwrap()];
        let ptrs: Vec<*const c_char> = owned.iter().map(|s| s.as_ptr()).collect();

        let collected = unsafe { collect_addresses(ptrs.as_ptr(), ptrs.len()) }.unwrap();
        assert_eq!(collected, vec!["relay-a:7400", "relay-b:7400"]);
    }

    #[test]
    fn test_collect_rejects_null_entry() {
        let owned = CString::new("relay-a:7400").unwrap();
        let ptrs = [owned.as_ptr(), std::ptr::null()];
        let err = unsafe { collect_addresses(ptrs.as_ptr(), ptrs.len()) }.unwrap_err();
        assert!(err.to_string().contains("address 1"));
    }

    #[test]
    fn test_collect_empty() {
        let collected = unsafe { collect_addresses(std::ptr::null(), 0) }.unwrap();
        assert!(collected.is_empty());
        assert!(unsafe { collect_addresses(std::ptr::null(), 2) }.is_err());
    }

    #[test]
    fn test_collect_rejects_invalid_utf8() {
        let bad = CString::new(vec![0xff, 0xfe]).unwrap();
        let ptrs = [bad.as_ptr()];
        assert!(unsafe { collect_addresses(ptrs.as_ptr(), 1) }.is_err());
    }
}
