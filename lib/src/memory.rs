//! Backing memory of graphic buffers.
//!
//! The queue does not allocate memory itself: it calls into a
//! [`GraphicBufferAllocator`] whenever a slot needs a new buffer. An allocator
//! returns the file descriptor of the memory it allocated along with its
//! layout, which [`crate::graphic_buffer::GraphicBuffer`] then wraps.
//!
//! Allocators for GPU memory live outside of this crate. The
//! [`MemfdAllocator`] provided here backs buffers with anonymous shared memory,
//! which is enough for CPU producers and consumers.
//!
//! Buffers whose memory can be seen by the CPU can be mapped using [`map`],
//! which returns a [`BufferMapping`] that unmaps the memory when dropped.
mod memfd;

pub use memfd::*;

use std::io;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::{AsFd, OwnedFd};
use std::ptr::NonNull;
use std::slice;

use log::error;
use nix::errno::Errno;
use nix::libc::c_void;
use nix::sys::mman;
use thiserror::Error;

use crate::{PixelFormat, Usage};

/// Memory allocated for a buffer, along with its layout.
#[derive(Debug)]
pub struct AllocatedBuffer {
    pub fd: OwnedFd,
    /// Length of a line of the buffer, in pixels.
    pub stride: u32,
    /// Size of the memory, in bytes.
    pub size: usize,
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(PixelFormat),
    #[error("invalid buffer dimensions {0}x{1}")]
    InvalidDimensions(u32, u32),
    #[error("buffer of {0}x{1} pixels is too large")]
    TooLarge(u32, u32),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl From<AllocationError> for Errno {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::UnsupportedFormat(_) | AllocationError::InvalidDimensions(..) => {
                Errno::EINVAL
            }
            AllocationError::TooLarge(..) | AllocationError::IoError(_) => Errno::ENOMEM,
        }
    }
}

/// Trait for types able to allocate the memory of graphic buffers.
///
/// The queue may call this from any thread, and never while holding its
/// internal lock.
pub trait GraphicBufferAllocator: Send + Sync {
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: Usage,
    ) -> Result<AllocatedBuffer, AllocationError>;
}

/// A CPU mapping of the memory of a buffer.
pub struct BufferMapping {
    // A mapping remains valid until we munmap it, that is, until the
    // BufferMapping object is deleted. Hence the static lifetime.
    data: &'static mut [u8],
}

impl BufferMapping {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl AsRef<[u8]> for BufferMapping {
    fn as_ref(&self) -> &[u8] {
        self.data
    }
}

impl AsMut<[u8]> for BufferMapping {
    fn as_mut(&mut self) -> &mut [u8] {
        self.data
    }
}

impl Deref for BufferMapping {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

impl DerefMut for BufferMapping {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}

impl Drop for BufferMapping {
    fn drop(&mut self) {
        let Some(addr) = NonNull::new(self.data.as_mut_ptr() as *mut c_void) else {
            return;
        };
        // Safe because the pointer and length were constructed in map() and
        // are always valid.
        unsafe { mman::munmap(addr, self.data.len()) }.unwrap_or_else(|e| {
            error!("Error while unmapping buffer: {}", e);
        });
    }
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("cannot map an empty buffer")]
    EmptyBuffer,
    #[error("mmap error: {0}")]
    MmapError(#[from] Errno),
}

impl From<MapError> for Errno {
    fn from(err: MapError) -> Self {
        match err {
            MapError::EmptyBuffer => Errno::EINVAL,
            MapError::MmapError(e) => e,
        }
    }
}

/// Maps `size` bytes of the memory behind `fd` for reading and writing.
pub fn map(fd: &impl AsFd, size: usize) -> Result<BufferMapping, MapError> {
    let length = NonZeroUsize::new(size).ok_or(MapError::EmptyBuffer)?;
    let data = unsafe {
        mman::mmap(
            None,
            length,
            mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
            mman::MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }?;

    Ok(BufferMapping {
        // Safe because we know the pointer is valid and has enough data mapped
        // to cover the length.
        data: unsafe { slice::from_raw_parts_mut(data.as_ptr() as *mut u8, size) },
    })
}
