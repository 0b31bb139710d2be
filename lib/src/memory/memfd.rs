//! Allocator backing buffers with anonymous shared memory.
use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::{FromRawFd, OwnedFd};

use log::debug;
use nix::libc;

use super::*;

/// Alignment of the lines of the buffers, in pixels.
const STRIDE_ALIGNMENT: u32 = 16;

/// Allocates CPU-mappable buffers using `memfd_create`.
#[derive(Debug, Clone)]
pub struct MemfdAllocator {
    name: CString,
}

impl MemfdAllocator {
    pub fn new() -> Self {
        Self::with_name("graphic-buffer")
    }

    /// Creates an allocator whose memfds are named `name`, which is visible in
    /// `/proc/<pid>/fd`. Interior nul characters are dropped.
    pub fn with_name(name: &str) -> Self {
        let name = name.replace('\0', "");
        MemfdAllocator {
            // Cannot fail since we just removed all nul characters.
            name: CString::new(name).unwrap_or_default(),
        }
    }

    /// Returns the stride, in pixels, of a buffer of the given width, or
    /// `None` if it does not fit in a `u32`.
    pub fn stride(width: u32) -> Option<u32> {
        let aligned = width.checked_add(STRIDE_ALIGNMENT - 1)?;
        Some(aligned / STRIDE_ALIGNMENT * STRIDE_ALIGNMENT)
    }
}

impl Default for MemfdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphicBufferAllocator for MemfdAllocator {
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: Usage,
    ) -> Result<AllocatedBuffer, AllocationError> {
        if width == 0 || height == 0 {
            return Err(AllocationError::InvalidDimensions(width, height));
        }
        let bpp = format
            .bytes_per_pixel()
            .ok_or(AllocationError::UnsupportedFormat(format))?;

        let too_large = || AllocationError::TooLarge(width, height);
        let stride = Self::stride(width).ok_or_else(too_large)?;
        let size = (stride as usize)
            .checked_mul(height as usize)
            .and_then(|s| s.checked_mul(bpp as usize))
            .filter(|&s| i64::try_from(s).is_ok())
            .ok_or_else(too_large)?;

        let fd = syscall!(memfd_create(self.name.as_ptr(), libc::MFD_CLOEXEC))?;
        // Safe because we just created this fd and nothing else owns it.
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(size as u64)?;

        debug!(
            "Allocated {}x{} {} buffer (stride {}, {} bytes, usage {:?})",
            width, height, format, stride, size, usage
        );

        Ok(AllocatedBuffer {
            fd: OwnedFd::from(file),
            stride,
            size,
        })
    }
}
