//! Records exchanged between the producer, the queue and the consumer.
use std::sync::Arc;

use crate::fence::Fence;
use crate::graphic_buffer::GraphicBuffer;
use crate::parcel::{Flattenable, Parcel, ParcelError};
use crate::{Dataspace, Rect, Region, ScalingMode, Transform};

/// A frame waiting in the queue, or handed to the consumer by
/// [`super::consumer::BufferQueueConsumer::acquire_buffer`].
#[derive(Debug, Clone, Default)]
pub struct BufferItem {
    pub slot: usize,
    pub frame_number: u64,
    pub crop: Rect,
    /// Transform to apply, without the `INVERSE_DISPLAY` bit.
    pub transform: Transform,
    pub scaling_mode: ScalingMode,
    /// Desired presentation time, in nanoseconds.
    pub timestamp: i64,
    pub is_auto_timestamp: bool,
    pub dataspace: Dataspace,
    /// This frame may be replaced by the next one before being acquired.
    pub is_droppable: bool,
    /// The consumer already holds a reference to the slot's buffer, in which
    /// case `graphic_buffer` is `None` on acquire.
    pub acquire_called: bool,
    pub transform_to_display_inverse: bool,
    pub graphic_buffer: Option<Arc<GraphicBuffer>>,
    /// Fence to wait on before reading the buffer.
    pub fence: Fence,
    pub surface_damage: Region,
}

impl Flattenable for BufferItem {
    fn flatten(&self, parcel: &mut Parcel) -> Result<(), ParcelError> {
        parcel.write_i32(self.slot as i32);
        parcel.write_u64(self.frame_number);
        self.crop.flatten(parcel)?;
        parcel.write_u32(self.transform.bits());
        parcel.write_u32(self.scaling_mode as u32);
        parcel.write_i64(self.timestamp);
        parcel.write_bool(self.is_auto_timestamp);
        parcel.write_u32(self.dataspace.0);
        parcel.write_bool(self.is_droppable);
        parcel.write_bool(self.acquire_called);
        parcel.write_bool(self.transform_to_display_inverse);
        self.graphic_buffer.flatten(parcel)?;
        self.fence.flatten(parcel)?;
        self.surface_damage.flatten(parcel)
    }

    fn unflatten(parcel: &mut Parcel) -> Result<Self, ParcelError> {
        let slot = parcel.read_i32()?;
        if !(0..super::NUM_BUFFER_SLOTS as i32).contains(&slot) {
            return Err(ParcelError::InvalidValue("slot"));
        }

        Ok(BufferItem {
            slot: slot as usize,
            frame_number: parcel.read_u64()?,
            crop: Rect::unflatten(parcel)?,
            transform: Transform::from_bits_retain(parcel.read_u32()?),
            scaling_mode: ScalingMode::try_from(parcel.read_u32()?)
                .map_err(|_| ParcelError::InvalidValue("scaling mode"))?,
            timestamp: parcel.read_i64()?,
            is_auto_timestamp: parcel.read_bool()?,
            dataspace: Dataspace(parcel.read_u32()?),
            is_droppable: parcel.read_bool()?,
            acquire_called: parcel.read_bool()?,
            transform_to_display_inverse: parcel.read_bool()?,
            graphic_buffer: Flattenable::unflatten(parcel)?,
            fence: Fence::unflatten(parcel)?,
            surface_damage: Region::unflatten(parcel)?,
        })
    }
}

/// Parameters of [`super::producer::BufferQueueProducer::queue_buffer`].
#[derive(Debug, Clone)]
pub struct QueueBufferInput {
    /// Desired presentation time, in nanoseconds.
    pub timestamp: i64,
    pub is_auto_timestamp: bool,
    /// `Dataspace::UNKNOWN` is replaced by the consumer's default dataspace.
    pub dataspace: Dataspace,
    /// Must fit within the buffer. An empty crop means the whole buffer.
    pub crop: Rect,
    /// Raw value of a [`ScalingMode`].
    pub scaling_mode: u32,
    pub transform: Transform,
    /// Transform the producer wants to keep applying to subsequent frames.
    pub sticky_transform: Transform,
    /// Allow this frame to be replaced by the next one before it is acquired.
    pub async_mode: bool,
    /// Fence signaling the end of the producer's work on the buffer.
    pub fence: Fence,
    pub surface_damage: Region,
}

impl QueueBufferInput {
    /// Returns an input for an auto-timestamped, uncropped frame which buffer
    /// can be read once `fence` signals.
    pub fn new(fence: Fence) -> Self {
        QueueBufferInput {
            timestamp: 0,
            is_auto_timestamp: true,
            dataspace: Dataspace::UNKNOWN,
            crop: Rect::EMPTY,
            scaling_mode: ScalingMode::Freeze as u32,
            transform: Transform::empty(),
            sticky_transform: Transform::empty(),
            async_mode: false,
            fence,
            surface_damage: Region::default(),
        }
    }
}

impl Flattenable for QueueBufferInput {
    fn flatten(&self, parcel: &mut Parcel) -> Result<(), ParcelError> {
        parcel.write_i64(self.timestamp);
        parcel.write_bool(self.is_auto_timestamp);
        parcel.write_u32(self.dataspace.0);
        self.crop.flatten(parcel)?;
        parcel.write_u32(self.scaling_mode);
        parcel.write_u32(self.transform.bits());
        parcel.write_u32(self.sticky_transform.bits());
        parcel.write_bool(self.async_mode);
        self.fence.flatten(parcel)?;
        self.surface_damage.flatten(parcel)
    }

    fn unflatten(parcel: &mut Parcel) -> Result<Self, ParcelError> {
        Ok(QueueBufferInput {
            timestamp: parcel.read_i64()?,
            is_auto_timestamp: parcel.read_bool()?,
            dataspace: Dataspace(parcel.read_u32()?),
            crop: Rect::unflatten(parcel)?,
            // Validated by the queue.
            scaling_mode: parcel.read_u32()?,
            transform: Transform::from_bits_retain(parcel.read_u32()?),
            sticky_transform: Transform::from_bits_retain(parcel.read_u32()?),
            async_mode: parcel.read_bool()?,
            fence: Fence::unflatten(parcel)?,
            surface_damage: Region::unflatten(parcel)?,
        })
    }
}

/// Returned to the producer upon connection and after each queued frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueBufferOutput {
    pub width: u32,
    pub height: u32,
    pub transform_hint: Transform,
    /// Number of frames waiting in the queue.
    pub num_pending_buffers: u32,
}

impl Flattenable for QueueBufferOutput {
    fn flatten(&self, parcel: &mut Parcel) -> Result<(), ParcelError> {
        parcel.write_u32(self.width);
        parcel.write_u32(self.height);
        parcel.write_u32(self.transform_hint.bits());
        parcel.write_u32(self.num_pending_buffers);
        Ok(())
    }

    fn unflatten(parcel: &mut Parcel) -> Result<Self, ParcelError> {
        Ok(QueueBufferOutput {
            width: parcel.read_u32()?,
            height: parcel.read_u32()?,
            transform_hint: Transform::from_bits_retain(parcel.read_u32()?),
            num_pending_buffers: parcel.read_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemfdAllocator;
    use crate::{PixelFormat, Usage};

    #[test]
    fn test_buffer_item_layout() {
        let item = BufferItem {
            slot: 3,
            frame_number: 7,
            crop: Rect::new(0, 0, 4, 4),
            transform: Transform::ROT_90,
            scaling_mode: ScalingMode::ScaleCrop,
            timestamp: 1_000,
            ..Default::default()
        };
        let mut parcel = Parcel::new();
        item.flatten(&mut parcel).unwrap();

        let data = parcel.data();
        assert_eq!(&data[0..4], &3i32.to_le_bytes());
        assert_eq!(&data[4..12], &7u64.to_le_bytes());
        // Crop, then transform.
        assert_eq!(&data[28..32], &Transform::ROT_90.bits().to_le_bytes());
        // No buffer, no fence, no damage.
        assert_eq!(parcel.num_fds(), 0);

        let received = BufferItem::unflatten(&mut parcel).unwrap();
        assert_eq!(received.slot, 3);
        assert_eq!(received.crop, item.crop);
        assert_eq!(received.scaling_mode, ScalingMode::ScaleCrop);
        assert!(received.graphic_buffer.is_none());
        assert!(received.fence.is_no_fence());
    }

    #[test]
    fn test_buffer_item_with_buffer() {
        let buffer = GraphicBuffer::allocate(
            &MemfdAllocator::new(),
            4,
            4,
            PixelFormat::RGBA_8888,
            Usage::CPU_READ_OFTEN,
            0,
        )
        .unwrap();
        let item = BufferItem {
            graphic_buffer: Some(Arc::new(buffer)),
            surface_damage: Region(vec![Rect::new(0, 0, 1, 1)]),
            ..Default::default()
        };
        let mut parcel = Parcel::new();
        item.flatten(&mut parcel).unwrap();
        assert_eq!(parcel.num_fds(), 1);

        let received = BufferItem::unflatten(&mut parcel).unwrap();
        assert_eq!(received.graphic_buffer.unwrap().width(), 4);
        assert_eq!(received.surface_damage, item.surface_damage);
    }

    #[test]
    fn test_invalid_slot() {
        let mut parcel = Parcel::new();
        parcel.write_i32(-1);
        assert!(matches!(
            BufferItem::unflatten(&mut parcel),
            Err(ParcelError::InvalidValue("slot"))
        ));
    }

    #[test]
    fn test_queue_buffer_input_keeps_raw_scaling_mode() {
        let input = QueueBufferInput {
            scaling_mode: 42,
            ..QueueBufferInput::new(Fence::NO_FENCE)
        };
        let mut parcel = Parcel::new();
        input.flatten(&mut parcel).unwrap();
        let received = QueueBufferInput::unflatten(&mut parcel).unwrap();
        assert_eq!(received.scaling_mode, 42);
        assert!(received.is_auto_timestamp);
    }

    #[test]
    fn test_queue_buffer_output() {
        let output = QueueBufferOutput {
            width: 320,
            height: 240,
            transform_hint: Transform::ROT_180,
            num_pending_buffers: 2,
        };
        let mut parcel = Parcel::new();
        output.flatten(&mut parcel).unwrap();
        assert_eq!(parcel.data().len(), 16);
        assert_eq!(QueueBufferOutput::unflatten(&mut parcel).unwrap(), output);
    }
}
