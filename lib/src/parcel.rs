//! Wire representation of the records exchanged between both sides of a
//! queue.
//!
//! A [`Parcel`] is a little-endian byte payload along with an out-of-band list
//! of file descriptors, which a transport is expected to pass using
//! `SCM_RIGHTS` or an equivalent mechanism. Records implementing
//! [`Flattenable`] write their fields into a parcel in a fixed order, and can
//! be read back from it by the other side.
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::stat::fstat;
use thiserror::Error;

use crate::fence::Fence;
use crate::graphic_buffer::GraphicBuffer;
use crate::{PixelFormat, Rect, Region, Usage};

#[derive(Debug, Error)]
pub enum ParcelError {
    #[error("not enough data: {needed} bytes needed, {available} available")]
    NotEnoughData { needed: usize, available: usize },
    #[error("expected a file descriptor but none is left")]
    MissingFd,
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl From<ParcelError> for Errno {
    fn from(err: ParcelError) -> Self {
        match err {
            ParcelError::NotEnoughData { .. } => Errno::ENODATA,
            ParcelError::MissingFd => Errno::EBADF,
            ParcelError::InvalidValue(_) => Errno::EINVAL,
            ParcelError::IoError(_) => Errno::EIO,
        }
    }
}

/// A payload of bytes and file descriptors.
#[derive(Debug, Default)]
pub struct Parcel {
    data: Vec<u8>,
    read_pos: usize,
    fds: VecDeque<OwnedFd>,
}

macro_rules! parcel_primitive {
    ($write: ident, $read: ident, $t: ty) => {
        pub fn $write(&mut self, v: $t) {
            self.data.extend_from_slice(&v.to_le_bytes());
        }

        pub fn $read(&mut self) -> Result<$t, ParcelError> {
            let bytes = self.read_bytes(std::mem::size_of::<$t>())?;
            let mut array = [0u8; std::mem::size_of::<$t>()];
            array.copy_from_slice(bytes);
            Ok(<$t>::from_le_bytes(array))
        }
    };
}

impl Parcel {
    pub fn new() -> Self {
        Default::default()
    }

    /// Builds a parcel to read from received data and descriptors.
    pub fn from_parts(data: Vec<u8>, fds: Vec<OwnedFd>) -> Self {
        Parcel {
            data,
            read_pos: 0,
            fds: fds.into(),
        }
    }

    /// Returns the payload and descriptors of this parcel, for transport.
    pub fn into_parts(self) -> (Vec<u8>, Vec<OwnedFd>) {
        (self.data, self.fds.into())
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn num_fds(&self) -> usize {
        self.fds.len()
    }

    fn read_bytes(&mut self, len: usize) -> Result<&[u8], ParcelError> {
        let available = self.data.len() - self.read_pos;
        if len > available {
            return Err(ParcelError::NotEnoughData {
                needed: len,
                available,
            });
        }

        let bytes = &self.data[self.read_pos..self.read_pos + len];
        self.read_pos += len;
        Ok(bytes)
    }

    parcel_primitive!(write_u32, read_u32, u32);
    parcel_primitive!(write_i32, read_i32, i32);
    parcel_primitive!(write_u64, read_u64, u64);
    parcel_primitive!(write_i64, read_i64, i64);

    /// Booleans take 4 bytes to keep the payload aligned.
    pub fn write_bool(&mut self, v: bool) {
        self.write_u32(v as u32);
    }

    pub fn read_bool(&mut self) -> Result<bool, ParcelError> {
        match self.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ParcelError::InvalidValue("bool")),
        }
    }

    /// Appends a duplicate of `fd` to the descriptors of the parcel.
    pub fn write_fd(&mut self, fd: &impl AsFd) -> Result<(), ParcelError> {
        self.fds.push_back(fd.as_fd().try_clone_to_owned()?);
        Ok(())
    }

    pub fn read_fd(&mut self) -> Result<OwnedFd, ParcelError> {
        self.fds.pop_front().ok_or(ParcelError::MissingFd)
    }
}

/// Trait for records that can be written into and read from a [`Parcel`].
pub trait Flattenable: Sized {
    fn flatten(&self, parcel: &mut Parcel) -> Result<(), ParcelError>;
    fn unflatten(parcel: &mut Parcel) -> Result<Self, ParcelError>;
}

impl Flattenable for Rect {
    fn flatten(&self, parcel: &mut Parcel) -> Result<(), ParcelError> {
        parcel.write_i32(self.left);
        parcel.write_i32(self.top);
        parcel.write_i32(self.right);
        parcel.write_i32(self.bottom);
        Ok(())
    }

    fn unflatten(parcel: &mut Parcel) -> Result<Self, ParcelError> {
        Ok(Rect {
            left: parcel.read_i32()?,
            top: parcel.read_i32()?,
            right: parcel.read_i32()?,
            bottom: parcel.read_i32()?,
        })
    }
}

impl Flattenable for Region {
    fn flatten(&self, parcel: &mut Parcel) -> Result<(), ParcelError> {
        parcel.write_u32(self.0.len() as u32);
        for rect in &self.0 {
            rect.flatten(parcel)?;
        }
        Ok(())
    }

    fn unflatten(parcel: &mut Parcel) -> Result<Self, ParcelError> {
        let len = parcel.read_u32()? as usize;
        // Each rectangle takes 16 bytes, so reject lengths the payload cannot
        // hold before allocating anything.
        let available = parcel.data.len() - parcel.read_pos;
        if len.saturating_mul(16) > available {
            return Err(ParcelError::NotEnoughData {
                needed: len.saturating_mul(16),
                available,
            });
        }

        let rects = (0..len)
            .map(|_| Rect::unflatten(parcel))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Region(rects))
    }
}

/// A fence is a presence flag, followed by a descriptor unless it is
/// `NO_FENCE`.
impl Flattenable for Fence {
    fn flatten(&self, parcel: &mut Parcel) -> Result<(), ParcelError> {
        match self.as_fd() {
            None => parcel.write_bool(false),
            Some(fd) => {
                parcel.write_bool(true);
                parcel.write_fd(&fd)?;
            }
        }
        Ok(())
    }

    fn unflatten(parcel: &mut Parcel) -> Result<Self, ParcelError> {
        match parcel.read_bool()? {
            false => Ok(Fence::NO_FENCE),
            true => Ok(Fence::new(parcel.read_fd()?)),
        }
    }
}

impl Flattenable for Arc<GraphicBuffer> {
    fn flatten(&self, parcel: &mut Parcel) -> Result<(), ParcelError> {
        parcel.write_u32(self.width());
        parcel.write_u32(self.height());
        parcel.write_u32(self.stride());
        parcel.write_u32(self.format().into());
        parcel.write_u64(self.usage().bits());
        parcel.write_u32(self.generation_number());
        parcel.write_u64(self.size() as u64);
        parcel.write_fd(&**self)
    }

    fn unflatten(parcel: &mut Parcel) -> Result<Self, ParcelError> {
        let width = parcel.read_u32()?;
        let height = parcel.read_u32()?;
        let stride = parcel.read_u32()?;
        let format = PixelFormat::from(parcel.read_u32()?);
        let usage = Usage::from_bits_retain(parcel.read_u64()?);
        let generation_number = parcel.read_u32()?;
        let size = usize::try_from(parcel.read_u64()?)
            .map_err(|_| ParcelError::InvalidValue("buffer size"))?;
        let fd = parcel.read_fd()?;

        if stride < width {
            return Err(ParcelError::InvalidValue("buffer stride"));
        }
        // Mapping past the end of the memory would fault on access.
        if let Some(bpp) = format.bytes_per_pixel() {
            let min_size = (stride as usize)
                .checked_mul(height as usize)
                .and_then(|s| s.checked_mul(bpp as usize));
            if min_size.map_or(true, |min_size| size < min_size) {
                return Err(ParcelError::InvalidValue("buffer size"));
            }
        }
        let stat = fstat(fd.as_raw_fd()).map_err(io::Error::from)?;
        if (stat.st_size as u64) < size as u64 {
            return Err(ParcelError::InvalidValue("buffer size"));
        }

        Ok(Arc::new(GraphicBuffer::from_parts(
            fd,
            width,
            height,
            stride,
            format,
            usage,
            generation_number,
            size,
        )))
    }
}

/// Optional records are a presence flag followed by the record.
impl<T: Flattenable> Flattenable for Option<T> {
    fn flatten(&self, parcel: &mut Parcel) -> Result<(), ParcelError> {
        match self {
            None => parcel.write_bool(false),
            Some(v) => {
                parcel.write_bool(true);
                v.flatten(parcel)?;
            }
        }
        Ok(())
    }

    fn unflatten(parcel: &mut Parcel) -> Result<Self, ParcelError> {
        match parcel.read_bool()? {
            false => Ok(None),
            true => Ok(Some(T::unflatten(parcel)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemfdAllocator;

    #[test]
    fn test_primitives() {
        let mut parcel = Parcel::new();
        parcel.write_u32(0x12345678);
        parcel.write_i64(-2);
        parcel.write_bool(true);
        assert_eq!(&parcel.data()[0..4], &[0x78, 0x56, 0x34, 0x12]);

        let (data, fds) = parcel.into_parts();
        let mut parcel = Parcel::from_parts(data, fds);
        assert_eq!(parcel.read_u32().unwrap(), 0x12345678);
        assert_eq!(parcel.read_i64().unwrap(), -2);
        assert!(parcel.read_bool().unwrap());
        assert!(matches!(
            parcel.read_u32(),
            Err(ParcelError::NotEnoughData {
                needed: 4,
                available: 0
            })
        ));
    }

    #[test]
    fn test_invalid_bool() {
        let mut parcel = Parcel::new();
        parcel.write_u32(2);
        assert!(matches!(
            parcel.read_bool(),
            Err(ParcelError::InvalidValue("bool"))
        ));
    }

    #[test]
    fn test_truncated_region() {
        let mut parcel = Parcel::new();
        parcel.write_u32(1000);
        Rect::new(0, 0, 1, 1).flatten(&mut parcel).unwrap();
        assert!(matches!(
            Region::unflatten(&mut parcel),
            Err(ParcelError::NotEnoughData { .. })
        ));
    }

    #[test]
    fn test_fences() {
        let (fence, signaler) = Fence::new_pending().unwrap();
        let mut parcel = Parcel::new();
        Fence::NO_FENCE.flatten(&mut parcel).unwrap();
        fence.flatten(&mut parcel).unwrap();
        assert_eq!(parcel.num_fds(), 1);

        assert!(Fence::unflatten(&mut parcel).unwrap().is_no_fence());
        let received = Fence::unflatten(&mut parcel).unwrap();
        signaler.signal().unwrap();
        assert!(received.wait(std::time::Duration::ZERO).is_ok());
    }

    #[test]
    fn test_missing_fd() {
        let mut parcel = Parcel::new();
        parcel.write_bool(true);
        assert!(matches!(
            Fence::unflatten(&mut parcel),
            Err(ParcelError::MissingFd)
        ));
    }

    #[test]
    fn test_graphic_buffer_shares_memory() {
        let buffer = Arc::new(
            GraphicBuffer::allocate(
                &MemfdAllocator::new(),
                8,
                8,
                PixelFormat::RGBA_8888,
                Usage::CPU_WRITE_OFTEN,
                3,
            )
            .unwrap(),
        );
        buffer.map().unwrap()[0] = 42;

        let mut parcel = Parcel::new();
        Some(buffer.clone()).flatten(&mut parcel).unwrap();
        let received = Option::<Arc<GraphicBuffer>>::unflatten(&mut parcel)
            .unwrap()
            .unwrap();

        assert_eq!(received.width(), 8);
        assert_eq!(received.stride(), buffer.stride());
        assert_eq!(received.generation_number(), 3);
        assert_eq!(received.usage(), Usage::CPU_WRITE_OFTEN);
        assert_eq!(received.map().unwrap()[0], 42);
    }

    /// Writes a buffer record claiming `size` bytes of memory.
    fn write_buffer_record(parcel: &mut Parcel, buffer: &GraphicBuffer, stride: u32, size: u64) {
        parcel.write_u32(buffer.width());
        parcel.write_u32(buffer.height());
        parcel.write_u32(stride);
        parcel.write_u32(buffer.format().into());
        parcel.write_u64(buffer.usage().bits());
        parcel.write_u32(buffer.generation_number());
        parcel.write_u64(size);
        parcel.write_fd(buffer).unwrap();
    }

    #[test]
    fn test_graphic_buffer_layout_checked() {
        let buffer = GraphicBuffer::allocate(
            &MemfdAllocator::new(),
            8,
            8,
            PixelFormat::RGBA_8888,
            Usage::CPU_WRITE_OFTEN,
            0,
        )
        .unwrap();
        let size = buffer.size() as u64;

        let mut parcel = Parcel::new();
        write_buffer_record(&mut parcel, &buffer, buffer.stride(), size);
        assert!(Arc::<GraphicBuffer>::unflatten(&mut parcel).is_ok());

        // Larger than the memory behind the fd.
        let mut parcel = Parcel::new();
        write_buffer_record(&mut parcel, &buffer, buffer.stride(), size * 2);
        assert!(matches!(
            Arc::<GraphicBuffer>::unflatten(&mut parcel),
            Err(ParcelError::InvalidValue("buffer size"))
        ));

        // Too small for the advertised layout.
        let mut parcel = Parcel::new();
        write_buffer_record(&mut parcel, &buffer, buffer.stride(), size / 2);
        assert!(matches!(
            Arc::<GraphicBuffer>::unflatten(&mut parcel),
            Err(ParcelError::InvalidValue("buffer size"))
        ));

        let mut parcel = Parcel::new();
        write_buffer_record(&mut parcel, &buffer, 4, size);
        assert!(matches!(
            Arc::<GraphicBuffer>::unflatten(&mut parcel),
            Err(ParcelError::InvalidValue("buffer stride"))
        ));
    }
}
