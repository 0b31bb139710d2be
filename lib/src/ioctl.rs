//! This module provides safer versions of the `sync_file` ioctls through simple functions working
//! on anything that implements `AsRawFd`, and safer variants of the structures they exchange with
//! the kernel.
//!
//! Like most kernel ioctls, the sync_file ones take a single structure serving as both input and
//! output. Each proxy function here takes the relevant input as parameters, manages the C structure
//! passed to the kernel, and returns a validated Rust type. Each ioctl also has its own error type
//! so callers can tell a fd that is not a sync_file apart from an actual failure. All error types
//! can be converted to their original error code using their `Into<Errno>` implementation.

mod sync_file_info;
mod sync_merge;

pub use sync_file_info::*;
pub use sync_merge::*;

use std::ffi::CStr;
use std::ffi::FromBytesWithNulError;

/// Constructs an owned String instance from a slice containing a nul-terminated
/// C string, after checking that the passed slice indeed contains a nul
/// character.
fn string_from_cstr(c_str: &[u8]) -> Result<String, FromBytesWithNulError> {
    // Make sure that our string contains a nul character.
    let slice = match c_str.iter().position(|x| *x == b'\0') {
        // Pass the full slice, `from_bytes_with_nul` will return an error.
        None => c_str,
        Some(pos) => &c_str[..pos + 1],
    };

    Ok(CStr::from_bytes_with_nul(slice)?
        .to_string_lossy()
        .into_owned())
}

/// Copies `name` into a fixed-size C string buffer, truncating it if needed so
/// the terminating nul always fits.
fn cstr_to_array<const N: usize>(name: &str) -> [u8; N] {
    let mut array = [0u8; N];
    let len = name.len().min(N - 1);
    array[..len].copy_from_slice(&name.as_bytes()[..len]);
    array
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_from_cstr() {
        assert_eq!(string_from_cstr(b"fence\0garbage").unwrap(), "fence");
        assert!(string_from_cstr(b"no nul").is_err());
    }

    #[test]
    fn test_cstr_to_array() {
        let array: [u8; 8] = cstr_to_array("a-very-long-name");
        assert_eq!(&array, b"a-very-\0");
        assert_eq!(string_from_cstr(&array).unwrap(), "a-very-");

        let array: [u8; 8] = cstr_to_array("ab");
        assert_eq!(string_from_cstr(&array).unwrap(), "ab");
    }
}
