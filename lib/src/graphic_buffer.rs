//! Reference-counted image buffers exchanged through the queue.
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::memory::{self, AllocationError, BufferMapping, GraphicBufferAllocator, MapError};
use crate::{PixelFormat, Usage};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// An image buffer, along with the attributes it has been allocated with.
///
/// Buffers are shared between the producer, the consumer and the queue's
/// slots through an `Arc`, and live as long as their longest holder.
#[derive(Debug)]
pub struct GraphicBuffer {
    id: u64,
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    usage: Usage,
    generation_number: AtomicU32,
    fd: OwnedFd,
    size: usize,
}

impl GraphicBuffer {
    /// Allocates a new buffer using `allocator`.
    pub fn allocate(
        allocator: &dyn GraphicBufferAllocator,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: Usage,
        generation_number: u32,
    ) -> Result<Self, AllocationError> {
        let allocated = allocator.allocate(width, height, format, usage)?;

        Ok(Self::from_parts(
            allocated.fd,
            width,
            height,
            allocated.stride,
            format,
            usage,
            generation_number,
            allocated.size,
        ))
    }

    /// Wraps memory allocated elsewhere, e.g. received from another process.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        fd: OwnedFd,
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
        usage: Usage,
        generation_number: u32,
        size: usize,
    ) -> Self {
        GraphicBuffer {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            stride,
            format,
            usage,
            generation_number: AtomicU32::new(generation_number),
            fd,
            size,
        }
    }

    /// Unique identifier of this buffer within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Length of a line of the buffer, in pixels.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn generation_number(&self) -> u32 {
        self.generation_number.load(Ordering::Acquire)
    }

    /// Updates the generation of this buffer, so it can be attached to a queue
    /// of a different generation.
    pub fn set_generation_number(&self, generation_number: u32) {
        self.generation_number
            .store(generation_number, Ordering::Release);
    }

    /// Returns whether this buffer cannot satisfy a request for a buffer with
    /// the given attributes. The buffer's usage must cover the requested one.
    pub fn needs_reallocation(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: Usage,
    ) -> bool {
        self.width != width
            || self.height != height
            || self.format != format
            || !self.usage.contains(usage)
    }

    /// Maps the memory of the buffer for CPU access.
    pub fn map(&self) -> Result<BufferMapping, MapError> {
        memory::map(&self.fd, self.size)
    }
}

impl AsFd for GraphicBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
