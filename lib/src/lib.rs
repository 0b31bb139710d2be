//! This library provides a multi-slot, producer/consumer queue of graphics
//! buffers, in which a small fixed pool of image buffers is brokered between a
//! rendering client (the *producer*) and a display, encode or readback client
//! (the *consumer*):
//!
//! * The `queue` module provides the queue proper, split into a
//!   [`queue::producer::BufferQueueProducer`] and a
//!   [`queue::consumer::BufferQueueConsumer`] sharing the same core. Buffers
//!   move between both sides without being copied, and completion of the
//!   asynchronous work done on them is signaled using fences.
//!
//! * The `fence` module provides [`fence::Fence`], an opaque handle to an
//!   asynchronous completion event backed by a file descriptor (typically a
//!   Linux `sync_file`), and the `ioctl` module the thin wrappers it relies on.
//!
//! * The `memory` and `graphic_buffer` modules provide the buffers
//!   themselves, as well as the allocator interface the queue uses to create
//!   them lazily.
//!
//! * The `parcel` module provides the wire representation of the records
//!   exchanged between both sides of the queue, for use by a cross-process
//!   transport.
//!

/// Calls a libc function and turns a negative return value into the last OS
/// error.
macro_rules! syscall {
    ($f: ident ( $($args: expr),* $(,)* ) ) => {{
        match unsafe { nix::libc::$f($($args, )*) } {
            err if err < 0 => Err(std::io::Error::last_os_error()),
            res => Ok(res)
        }
    }};
}

#[doc(hidden)]
pub mod bindings;
pub mod error;
pub mod fence;
pub mod graphic_buffer;
pub mod ioctl;
pub mod memory;
pub mod parcel;
pub mod queue;

pub use error::{Error, Result};

use std::convert::TryFrom;
use std::fmt;
use std::fmt::{Debug, Display};

use bitflags::bitflags;
use enumn::N;

/// A Fourcc pixel format, used to describe the layout of the pixels of a
/// buffer. It can be converted back and forth from a 32-bit integer, or a
/// 4-bytes string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct PixelFormat(u32);

impl PixelFormat {
    /// 32 bits per pixel, R, G, B, A bytes in memory order.
    pub const RGBA_8888: PixelFormat = PixelFormat::from_fourcc(b"AB24");
    /// 32 bits per pixel, R, G, B bytes in memory order and one unused byte.
    pub const RGBX_8888: PixelFormat = PixelFormat::from_fourcc(b"XB24");
    /// 32 bits per pixel, B, G, R, A bytes in memory order.
    pub const BGRA_8888: PixelFormat = PixelFormat::from_fourcc(b"AR24");
    /// 24 bits per pixel, R, G, B bytes in memory order.
    pub const RGB_888: PixelFormat = PixelFormat::from_fourcc(b"BG24");
    /// 16 bits per pixel, 5 bits of red, 6 of green and 5 of blue.
    pub const RGB_565: PixelFormat = PixelFormat::from_fourcc(b"RG16");

    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const fn from_fourcc(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }

    pub const fn to_fourcc(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Returns the number of bytes used by a single pixel, or `None` if this
    /// format is not a packed single-plane format this crate knows about.
    ///
    /// # Examples
    ///
    /// ```
    /// # use bufferqueue::PixelFormat;
    /// assert_eq!(PixelFormat::RGBA_8888.bytes_per_pixel(), Some(4));
    /// assert_eq!(PixelFormat::from(b"NV12").bytes_per_pixel(), None);
    /// ```
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            PixelFormat::RGBA_8888 | PixelFormat::RGBX_8888 | PixelFormat::BGRA_8888 => Some(4),
            PixelFormat::RGB_888 => Some(3),
            PixelFormat::RGB_565 => Some(2),
            _ => None,
        }
    }
}

/// Converts a Fourcc in 32-bit integer format into the matching pixel format.
///
/// # Examples
///
/// ```
/// # use bufferqueue::PixelFormat;
/// // Fourcc representation of NV12.
/// let nv12 = u32::from_le(0x3231564e);
/// let f = PixelFormat::from(nv12);
/// assert_eq!(u32::from(f), nv12);
/// ```
impl From<u32> for PixelFormat {
    fn from(i: u32) -> Self {
        Self::from_u32(i)
    }
}

/// Converts a pixel format back to its 32-bit representation.
impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.to_u32()
    }
}

/// Simple way to convert a string litteral (e.g. b"AB24") into a pixel
/// format.
///
/// # Examples
///
/// ```
/// # use bufferqueue::PixelFormat;
/// let f = PixelFormat::from(b"AB24");
/// assert_eq!(f, PixelFormat::RGBA_8888);
/// assert_eq!(&<[u8; 4]>::from(f), b"AB24");
/// ```
impl From<&[u8; 4]> for PixelFormat {
    fn from(n: &[u8; 4]) -> Self {
        Self::from_fourcc(n)
    }
}

/// Convert a pixel format back to its 4-character representation.
impl From<PixelFormat> for [u8; 4] {
    fn from(format: PixelFormat) -> Self {
        format.to_fourcc()
    }
}

/// Produces a debug string for this PixelFormat, including its hexadecimal
/// and string representation.
///
/// # Examples
///
/// ```
/// # use bufferqueue::PixelFormat;
/// // Fourcc representation of NV12.
/// let nv12 = u32::from_le(0x3231564e);
/// let f = PixelFormat::from(nv12);
/// assert_eq!(format!("{:?}", f), "0x3231564e (NV12)");
/// ```
impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fourcc = self
            .0
            .to_le_bytes()
            .iter()
            .map(|&x| x as char)
            .collect::<String>();
        f.write_str(fourcc.as_str())
    }
}

/// A rectangle expressed by its edges. `right` and `bottom` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const EMPTY: Rect = Rect {
        left: 0,
        top: 0,
        right: 0,
        bottom: 0,
    };

    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Rect {
        Rect {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Build a rectangle with its top-left corner at the origin.
    pub fn from_size(width: u32, height: u32) -> Rect {
        let clamp = |v: u32| i32::try_from(v).unwrap_or(i32::MAX);
        Rect::new(0, 0, clamp(width), clamp(height))
    }

    /// Saturates at `i32::MAX` and `i32::MIN`.
    pub fn width(&self) -> i32 {
        self.right.saturating_sub(self.left)
    }

    /// Saturates at `i32::MAX` and `i32::MIN`.
    pub fn height(&self) -> i32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    /// Returns the intersection of `self` and `other`, or `Rect::EMPTY` if
    /// they do not overlap.
    ///
    /// # Examples
    ///
    /// ```
    /// # use bufferqueue::Rect;
    /// let a = Rect::new(0, 0, 10, 10);
    /// assert_eq!(a.intersect(&Rect::new(5, 5, 20, 20)), Rect::new(5, 5, 10, 10));
    /// assert_eq!(a.intersect(&Rect::new(10, 0, 20, 10)), Rect::EMPTY);
    /// ```
    pub fn intersect(&self, other: &Rect) -> Rect {
        let res = Rect {
            left: self.left.max(other.left),
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
        };

        if res.is_empty() {
            Rect::EMPTY
        } else {
            res
        }
    }
}

impl Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.left, self.top, self.right, self.bottom
        )
    }
}

/// A list of rectangles, used to describe the damaged area of a frame. An
/// empty region means the whole buffer is damaged.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Region(pub Vec<Rect>);

impl Region {
    pub fn rects(&self) -> &[Rect] {
        &self.0
    }

    /// Adds the rectangles of `other` to this region.
    pub fn merge(&mut self, other: &Region) {
        self.0.extend(other.0.iter().filter(|r| !r.is_empty()));
    }
}

/// Describes how the data of a buffer is to be interpreted (color space,
/// transfer function and range). The queue only carries this value, it never
/// interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Dataspace(pub u32);

impl Dataspace {
    /// Dataspace left for the consumer to decide.
    pub const UNKNOWN: Dataspace = Dataspace(0);
}

bitflags! {
    /// Transform to apply to a buffer's content before presenting it.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash)]
    pub struct Transform: u32 {
        const FLIP_H = 0x01;
        const FLIP_V = 0x02;
        const ROT_90 = 0x04;
        const ROT_180 = 0x03;
        const ROT_270 = 0x07;
        /// Apply the inverse of the display transform before the other ones.
        const INVERSE_DISPLAY = 0x08;
    }
}

bitflags! {
    /// How a buffer is going to be used. The producer and consumer usages are
    /// combined when a buffer is allocated.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash)]
    pub struct Usage: u64 {
        const CPU_READ_RARELY = 0x2;
        const CPU_READ_OFTEN = 0x3;
        const CPU_WRITE_RARELY = 0x20;
        const CPU_WRITE_OFTEN = 0x30;
        const GPU_TEXTURE = 0x100;
        const GPU_RENDER_TARGET = 0x200;
        const COMPOSER_OVERLAY = 0x800;
        const PROTECTED = 0x4000;
        const VIDEO_ENCODER = 0x10000;
    }
}

/// How the content of a buffer is to be scaled to fit its destination.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, N)]
pub enum ScalingMode {
    /// The buffer is only presented if its size matches the destination's.
    #[default]
    Freeze = 0,
    ScaleToWindow = 1,
    ScaleCrop = 2,
    NoScaleCrop = 3,
}

impl TryFrom<u32> for ScalingMode {
    type Error = Error;

    fn try_from(mode: u32) -> std::result::Result<Self, Self::Error> {
        ScalingMode::n(mode).ok_or(Error::BadValue)
    }
}

/// The kind of client that can connect as a producer.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, N)]
pub enum ProducerApi {
    Egl = 1,
    Cpu = 2,
    Media = 3,
    Camera = 4,
}

impl TryFrom<u32> for ProducerApi {
    type Error = Error;

    fn try_from(api: u32) -> std::result::Result<Self, Self::Error> {
        ProducerApi::n(api).ok_or(Error::BadValue)
    }
}

impl Display for ProducerApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_intersect() {
        let buffer = Rect::from_size(320, 240);

        assert_eq!(buffer.intersect(&buffer), buffer);
        assert_eq!(
            buffer.intersect(&Rect::new(-10, -10, 10, 10)),
            Rect::new(0, 0, 10, 10)
        );
        assert_eq!(buffer.intersect(&Rect::new(400, 0, 500, 10)), Rect::EMPTY);
        assert!(Rect::EMPTY.is_empty());
        assert!(Rect::new(5, 5, 5, 10).is_empty());
    }

    #[test]
    fn test_rect_extreme_edges() {
        let inverted = Rect::new(i32::MAX, 0, i32::MIN, 1);
        assert!(inverted.is_empty());
        assert_eq!(inverted.width(), i32::MIN);
        assert_eq!(inverted.intersect(&Rect::from_size(16, 16)), Rect::EMPTY);

        let huge = Rect::new(i32::MIN, i32::MIN, i32::MAX, i32::MAX);
        assert!(!huge.is_empty());
        assert_eq!(huge.width(), i32::MAX);
        assert_eq!(huge.height(), i32::MAX);
        assert_eq!(
            huge.intersect(&Rect::from_size(16, 16)),
            Rect::from_size(16, 16)
        );

        assert_eq!(
            Rect::from_size(u32::MAX, 1),
            Rect::new(0, 0, i32::MAX, 1)
        );
    }

    #[test]
    fn test_raw_enum_conversion() {
        assert_eq!(ScalingMode::try_from(2u32), Ok(ScalingMode::ScaleCrop));
        assert_eq!(ScalingMode::try_from(4u32), Err(Error::BadValue));
        assert_eq!(ProducerApi::try_from(1u32), Ok(ProducerApi::Egl));
        assert_eq!(ProducerApi::try_from(0u32), Err(Error::BadValue));
    }

    #[test]
    fn test_region_merge() {
        let mut damage = Region(vec![Rect::new(0, 0, 4, 4)]);
        damage.merge(&Region(vec![Rect::EMPTY, Rect::new(8, 8, 10, 10)]));

        assert_eq!(
            damage.rects(),
            &[Rect::new(0, 0, 4, 4), Rect::new(8, 8, 10, 10)]
        );
    }

    #[test]
    fn test_transform_bits() {
        assert!(Transform::ROT_270.contains(Transform::ROT_90));
        assert!(Transform::ROT_180.contains(Transform::FLIP_H | Transform::FLIP_V));
        let t = Transform::from_bits_truncate(0x0c);
        assert!(t.contains(Transform::INVERSE_DISPLAY));
        assert_eq!(t - Transform::INVERSE_DISPLAY, Transform::ROT_90);
    }
}
