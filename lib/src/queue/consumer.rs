//! Consumer side of a queue.
use std::sync::{Arc, Weak};

use super::buffer_core::{BufferQueueCore, CoreState, SlotLimits};
use super::item::BufferItem;
use super::listener::{ConsumerListener, ProxyConsumerListener};
use super::{MAX_MAX_ACQUIRED_BUFFERS, NUM_BUFFER_SLOTS};
use crate::fence::Fence;
use crate::graphic_buffer::GraphicBuffer;
use crate::{Dataspace, Error, PixelFormat, Result, Transform, Usage};

/// Frames scheduled further than this from the expected presentation time are
/// assumed to carry a bogus timestamp.
const MAX_REASONABLE_NSEC: i64 = 1_000_000_000;

/// The consumer side of a queue, used to acquire the frames queued by the
/// producer and release them once done.
pub struct BufferQueueConsumer {
    core: Arc<BufferQueueCore>,
}

fn check_abandoned(state: &CoreState, op: &str) -> Result<()> {
    if state.is_abandoned {
        bq_error!(state, "{}: queue has been abandoned", op);
        return Err(Error::NoInit);
    }
    Ok(())
}

impl BufferQueueConsumer {
    pub(crate) fn new(core: Arc<BufferQueueCore>) -> Self {
        BufferQueueConsumer { core }
    }

    /// Connects `listener` as the consumer of the queue.
    ///
    /// The queue only keeps a weak reference to the listener, which stops
    /// receiving events once dropped. `controlled_by_app` makes dequeue
    /// non-blocking for the producers connecting afterwards.
    pub fn consumer_connect<L: ConsumerListener + 'static>(
        &self,
        listener: &Arc<L>,
        controlled_by_app: bool,
    ) -> Result<()> {
        let mut state = self.core.lock();
        check_abandoned(&state, "consumer_connect")?;

        if state.consumer_listener.is_some() {
            bq_error!(state, "consumer_connect: a consumer is already connected");
            return Err(Error::AlreadyConnected);
        }

        let listener: Weak<L> = Arc::downgrade(listener);
        let listener: Weak<dyn ConsumerListener> = listener;
        state.consumer_listener = Some(ProxyConsumerListener::new(listener));
        state.consumer_controlled_by_app = controlled_by_app;

        bq_debug!(
            state,
            "consumer_connect: controlled by app = {}",
            controlled_by_app
        );
        Ok(())
    }

    /// Disconnects the consumer and abandons the queue. Every pending and
    /// future producer operation fails with `NoInit`.
    pub fn consumer_disconnect(&self) -> Result<()> {
        let state = self.core.lock();
        let mut state = self.core.wait_while_allocating(state);

        if state.consumer_listener.is_none() {
            bq_error!(state, "consumer_disconnect: no consumer is connected");
            return Err(Error::BadValue);
        }

        state.is_abandoned = true;
        state.consumer_listener = None;
        state.free_all_buffers();
        state.validate_consistency();
        self.core.dequeue_cond.notify_all();

        bq_debug!(state, "consumer_disconnect: queue abandoned");
        Ok(())
    }

    /// Pops the selected frame from the queue, or rebuilds the shared one.
    fn take_next_item(state: &mut CoreState) -> Result<BufferItem> {
        if let Some(item) = state.queue.pop_front() {
            state.slots[item.slot].state.acquire();
            return Ok(item);
        }

        // Auto-refresh: hand the shared buffer out again with the attributes
        // of its last frame.
        let slot = state.shared_buffer_slot.ok_or(Error::NoBufferAvailable)?;
        let buffer = state.slots[slot]
            .buffer
            .clone()
            .ok_or(Error::NoBufferAvailable)?;
        let cache = state.shared_buffer_cache;

        state.slots[slot].state.acquire_not_in_queue();
        Ok(BufferItem {
            slot,
            frame_number: state.frame_counter,
            crop: cache.crop,
            transform: cache.transform - Transform::INVERSE_DISPLAY,
            transform_to_display_inverse: cache.transform.contains(Transform::INVERSE_DISPLAY),
            scaling_mode: cache.scaling_mode,
            timestamp: 0,
            is_auto_timestamp: true,
            dataspace: cache.dataspace,
            is_droppable: false,
            acquire_called: state.slots[slot].acquire_called,
            graphic_buffer: Some(buffer),
            fence: Fence::NO_FENCE,
            surface_damage: Default::default(),
        })
    }

    /// Drops the frames at the head of the queue that the next one supersedes
    /// at `expected_present` time. Returns the number of frames dropped.
    fn drop_superseded_frames(
        state: &mut CoreState,
        expected_present: i64,
        max_frame_number: u64,
    ) -> usize {
        let mut dropped = 0;

        while state.queue.len() > 1 && !state.queue[0].is_auto_timestamp {
            let next = &state.queue[1];

            // The consumer is not ready for the next frame yet.
            if max_frame_number != 0 && next.frame_number > max_frame_number {
                break;
            }
            let desired_present = next.timestamp;
            if desired_present < expected_present.saturating_sub(MAX_REASONABLE_NSEC)
                || desired_present > expected_present
            {
                break;
            }

            let front = match state.queue.pop_front() {
                Some(front) => front,
                None => break,
            };
            bq_debug!(
                state,
                "acquire_buffer: dropping frame {} in slot {} (desired {}, expected {})",
                front.frame_number,
                front.slot,
                front.timestamp,
                expected_present
            );
            state.slots[front.slot].state.free_queued();
            state.return_free_slot(front.slot);
            dropped += 1;
        }

        dropped
    }

    /// Picks the frame to acquire, dropping the ones superseded at
    /// `present_when`.
    fn select_next_item(
        state: &mut CoreState,
        present_when: i64,
        max_frame_number: u64,
        dropped: &mut usize,
    ) -> Result<BufferItem> {
        if !state.queue.is_empty() {
            if present_when != 0 {
                let expected_present = present_when.saturating_add(state.present_time_offset);
                *dropped = Self::drop_superseded_frames(state, expected_present, max_frame_number);

                let front = &state.queue[0];
                let desired_present = front.timestamp;
                let is_due = desired_present <= expected_present
                    || desired_present > expected_present.saturating_add(MAX_REASONABLE_NSEC);
                if !is_due {
                    bq_trace!(
                        state,
                        "acquire_buffer: frame {} is due at {}, expected {}",
                        front.frame_number,
                        desired_present,
                        expected_present
                    );
                    return Err(Error::PresentLater(desired_present));
                }
            }

            let front = &state.queue[0];
            if max_frame_number != 0 && front.frame_number > max_frame_number {
                bq_trace!(
                    state,
                    "acquire_buffer: frame {} is past {}",
                    front.frame_number,
                    max_frame_number
                );
                return Err(Error::NoBufferAvailable);
            }
        }

        Self::take_next_item(state)
    }

    /// Acquires the oldest frame of the queue.
    ///
    /// If `present_when` is not 0, it is the time in nanoseconds at which the
    /// frame will be presented: older frames superseded by then are dropped,
    /// and `PresentLater` is returned if the oldest frame is not due yet. If
    /// `max_frame_number` is not 0, frames with a higher number are not
    /// acquired.
    ///
    /// The returned item holds the buffer only if the consumer has not seen it
    /// before. Its fence must be waited on before reading the buffer.
    pub fn acquire_buffer(&self, present_when: i64, max_frame_number: u64) -> Result<BufferItem> {
        let mut state = self.core.lock();
        if state.shared_buffer_mode {
            state = self.core.wait_while_allocating(state);
        }
        check_abandoned(&state, "acquire_buffer")?;

        let (_, acquired) = state.active_counts();
        if acquired >= state.max_acquired_buffer_count {
            bq_error!(
                state,
                "acquire_buffer: max acquired buffer count reached: {} (max {})",
                acquired,
                state.max_acquired_buffer_count
            );
            return Err(Error::InvalidOperation);
        }

        let shared_available = state.shared_buffer_mode
            && state.auto_refresh
            && state.shared_buffer_slot.is_some();
        if state.queue.is_empty() && !shared_available {
            return Err(Error::NoBufferAvailable);
        }

        let mut dropped = 0;
        let result =
            Self::select_next_item(&mut state, present_when, max_frame_number, &mut dropped);
        let result = result.map(|mut item| {
            let s = &mut state.slots[item.slot];
            s.acquire_called = true;
            s.fence = Fence::NO_FENCE;
            if item.acquire_called {
                item.graphic_buffer = None;
            }
            item
        });

        if result.is_ok() || dropped > 0 {
            state.validate_consistency();
            self.core.dequeue_cond.notify_all();
        }
        if let Ok(item) = &result {
            bq_trace!(
                state,
                "acquire_buffer: slot {} frame {}",
                item.slot,
                item.frame_number
            );
        }

        let listener = state.connected_producer_listener.clone();
        drop(state);

        if let Some(listener) = listener {
            for _ in 0..dropped {
                listener.on_buffer_released();
            }
        }

        result
    }

    /// Returns an acquired slot to the queue. `fence` signals when the consumer
    /// is done reading the buffer.
    ///
    /// Fails with `StaleBufferSlot` if `frame_number` is not the last frame
    /// queued into `slot`, e.g. because the buffer was freed meanwhile.
    pub fn release_buffer(&self, slot: usize, frame_number: u64, fence: Fence) -> Result<()> {
        let mut state = self.core.lock();

        if slot >= NUM_BUFFER_SLOTS {
            bq_error!(
                state,
                "release_buffer: slot {} out of range [0, {})",
                slot,
                NUM_BUFFER_SLOTS
            );
            return Err(Error::BadValue);
        }
        let s = &state.slots[slot];
        if s.frame_number != frame_number && !s.state.is_shared() {
            bq_debug!(
                state,
                "release_buffer: slot {} holds frame {}, not {}",
                slot,
                s.frame_number,
                frame_number
            );
            return Err(Error::StaleBufferSlot);
        }
        if !s.state.is_acquired() {
            bq_error!(
                state,
                "release_buffer: slot {} is not owned by the consumer (state = {})",
                slot,
                s.state.state()
            );
            return Err(Error::BadValue);
        }

        let old_fence = std::mem::take(&mut state.slots[slot].fence);
        let new_fence = match Fence::merge(&state.consumer_name, &old_fence, &fence) {
            Ok(merged) => merged,
            Err(e) => {
                bq_warn!(state, "release_buffer: failed to merge release fences: {}", e);
                state.wait_fence(&old_fence, "release_buffer");
                fence
            }
        };

        let s = &mut state.slots[slot];
        s.fence = new_fence;
        s.state.release();
        state.return_free_slot(slot);
        state.validate_consistency();
        self.core.dequeue_cond.notify_all();

        bq_trace!(state, "release_buffer: slot {} frame {}", slot, frame_number);
        let listener = state.connected_producer_listener.clone();
        drop(state);

        if let Some(listener) = listener {
            listener.on_buffer_released();
        }

        Ok(())
    }

    /// Removes the buffer of an acquired slot from the queue, and hands its
    /// ownership to the caller.
    pub fn detach_buffer(&self, slot: usize) -> Result<Arc<GraphicBuffer>> {
        let mut state = self.core.lock();
        check_abandoned(&state, "detach_buffer")?;

        if state.shared_buffer_mode || state.shared_buffer_slot == Some(slot) {
            bq_error!(state, "detach_buffer: cannot detach a buffer in shared buffer mode");
            return Err(Error::BadValue);
        }
        if slot >= NUM_BUFFER_SLOTS {
            bq_error!(
                state,
                "detach_buffer: slot {} out of range [0, {})",
                slot,
                NUM_BUFFER_SLOTS
            );
            return Err(Error::BadValue);
        }
        if !state.slots[slot].state.is_acquired() {
            bq_error!(
                state,
                "detach_buffer: slot {} is not owned by the consumer (state = {})",
                slot,
                state.slots[slot].state.state()
            );
            return Err(Error::BadValue);
        }
        let buffer = match state.slots[slot].buffer.take() {
            Some(buffer) => buffer,
            None => {
                bq_error!(state, "detach_buffer: slot {} has no buffer", slot);
                return Err(Error::BadValue);
            }
        };

        state.slots[slot].state.detach_consumer();
        state.active_buffers.remove(&slot);
        state.slots[slot].clear();
        state.free_slots.insert(slot);
        state.validate_consistency();
        self.core.dequeue_cond.notify_all();

        bq_debug!(state, "detach_buffer: slot {}", slot);
        Ok(buffer)
    }

    /// Installs `buffer` in a free slot and acquires it. The producer will have
    /// to request the buffer before queueing the slot.
    pub fn attach_buffer(&self, buffer: Arc<GraphicBuffer>) -> Result<usize> {
        let mut state = self.core.lock();
        check_abandoned(&state, "attach_buffer")?;

        if state.shared_buffer_mode {
            bq_error!(state, "attach_buffer: cannot attach a buffer in shared buffer mode");
            return Err(Error::BadValue);
        }
        let (_, acquired) = state.active_counts();
        if acquired >= state.max_acquired_buffer_count {
            bq_error!(
                state,
                "attach_buffer: max acquired buffer count reached: {} (max {})",
                acquired,
                state.max_acquired_buffer_count
            );
            return Err(Error::InvalidOperation);
        }
        if buffer.generation_number() != state.generation_number {
            bq_error!(
                state,
                "attach_buffer: generation number mismatch [buffer {}] [queue {}]",
                buffer.generation_number(),
                state.generation_number
            );
            return Err(Error::BadValue);
        }

        let slot = match state.free_slots.pop_first() {
            Some(slot) => slot,
            None => match state.free_buffers.pop_front() {
                Some(slot) => slot,
                None => {
                    bq_error!(state, "attach_buffer: could not find a free slot");
                    return Err(Error::NoMemory);
                }
            },
        };

        let s = &mut state.slots[slot];
        s.buffer = Some(buffer);
        s.state.attach_consumer();
        s.request_needed = true;
        s.fence = Fence::NO_FENCE;
        s.frame_number = 0;
        s.acquire_called = false;
        s.attached_by_producer = false;
        state.active_buffers.insert(slot);
        state.validate_consistency();

        bq_debug!(state, "attach_buffer: slot {}", slot);
        Ok(slot)
    }

    /// Sets the size of the buffers dequeued without an explicit size.
    pub fn set_default_buffer_size(&self, width: u32, height: u32) -> Result<()> {
        let mut state = self.core.lock();
        check_abandoned(&state, "set_default_buffer_size")?;

        if width == 0 || height == 0 {
            bq_error!(
                state,
                "set_default_buffer_size: dimensions cannot be 0 ({}x{})",
                width,
                height
            );
            return Err(Error::BadValue);
        }

        state.default_width = width;
        state.default_height = height;
        bq_debug!(state, "set_default_buffer_size: {}x{}", width, height);
        Ok(())
    }

    pub fn set_default_buffer_format(&self, format: PixelFormat) -> Result<()> {
        let mut state = self.core.lock();
        check_abandoned(&state, "set_default_buffer_format")?;
        state.default_buffer_format = format;
        Ok(())
    }

    pub fn set_default_buffer_dataspace(&self, dataspace: Dataspace) -> Result<()> {
        let mut state = self.core.lock();
        check_abandoned(&state, "set_default_buffer_dataspace")?;
        state.default_buffer_dataspace = dataspace;
        Ok(())
    }

    /// Sets the usage bits added to every allocation.
    pub fn set_consumer_usage_bits(&self, usage: Usage) -> Result<()> {
        let mut state = self.core.lock();
        check_abandoned(&state, "set_consumer_usage_bits")?;
        state.consumer_usage_bits = usage;
        Ok(())
    }

    pub fn set_transform_hint(&self, hint: Transform) -> Result<()> {
        let mut state = self.core.lock();
        check_abandoned(&state, "set_transform_hint")?;
        state.transform_hint = hint;
        Ok(())
    }

    /// Renames the queue. The name prefixes every log message.
    pub fn set_consumer_name(&self, name: &str) -> Result<()> {
        let mut state = self.core.lock();
        check_abandoned(&state, "set_consumer_name")?;
        state.consumer_name = name.to_owned();
        Ok(())
    }

    /// Sets the maximum number of slots the queue can use. Only possible while
    /// no producer is connected.
    pub fn set_max_buffer_count(&self, max_buffer_count: usize) -> Result<()> {
        let state = self.core.lock();
        let mut state = self.core.wait_while_allocating(state);
        check_abandoned(&state, "set_max_buffer_count")?;

        if !(1..=NUM_BUFFER_SLOTS).contains(&max_buffer_count) {
            bq_error!(state, "set_max_buffer_count: invalid count {}", max_buffer_count);
            return Err(Error::BadValue);
        }
        if let Some(api) = state.connected_api {
            bq_error!(state, "set_max_buffer_count: producer {} is connected", api);
            return Err(Error::InvalidOperation);
        }

        let limits = SlotLimits {
            max_buffer_count,
            ..state.limits()
        };
        if !state.apply_limits(limits) {
            bq_error!(
                state,
                "set_max_buffer_count: {} buffers are needed but the maximum buffer count is {}",
                limits.buffer_count(),
                max_buffer_count
            );
            return Err(Error::BadValue);
        }
        state.validate_consistency();

        bq_debug!(state, "set_max_buffer_count: {}", max_buffer_count);
        Ok(())
    }

    /// Sets the number of buffers the consumer can hold at the same time.
    pub fn set_max_acquired_buffer_count(&self, max_acquired: usize) -> Result<()> {
        let state = self.core.lock();
        let mut state = self.core.wait_while_allocating(state);

        if !(1..=MAX_MAX_ACQUIRED_BUFFERS).contains(&max_acquired) {
            bq_error!(
                state,
                "set_max_acquired_buffer_count: invalid count {}",
                max_acquired
            );
            return Err(Error::BadValue);
        }
        check_abandoned(&state, "set_max_acquired_buffer_count")?;
        if max_acquired == state.max_acquired_buffer_count {
            return Ok(());
        }

        let (_, acquired) = state.active_counts();
        if acquired > max_acquired {
            bq_error!(
                state,
                "set_max_acquired_buffer_count: consumer holds {} buffers, more than {}",
                acquired,
                max_acquired
            );
            return Err(Error::BadValue);
        }

        let old_count = state.max_buffer_count_locked();
        let limits = SlotLimits {
            max_acquired,
            ..state.limits()
        };
        if !state.apply_limits(limits) {
            bq_error!(
                state,
                "set_max_acquired_buffer_count: {} buffers are needed but the maximum buffer count is {}",
                limits.buffer_count(),
                limits.max_buffer_count
            );
            return Err(Error::BadValue);
        }
        let shrunk = state.max_buffer_count_locked() < old_count;
        state.validate_consistency();
        self.core.dequeue_cond.notify_all();

        bq_debug!(state, "set_max_acquired_buffer_count: {}", max_acquired);
        let listener = state.consumer_listener.clone().filter(|_| shrunk);
        drop(state);

        if let Some(listener) = listener {
            listener.on_buffers_released();
        }

        Ok(())
    }

    /// Sets the delay in nanoseconds between acquiring a frame and presenting
    /// it, used to select frames in [`Self::acquire_buffer`].
    pub fn set_present_time_offset(&self, offset: i64) -> Result<()> {
        let mut state = self.core.lock();
        check_abandoned(&state, "set_present_time_offset")?;
        state.present_time_offset = offset;
        Ok(())
    }

    /// Frees the buffers of all free slots, so that the next dequeues allocate
    /// new ones.
    pub fn discard_free_buffers(&self) -> Result<()> {
        let mut state = self.core.lock();
        check_abandoned(&state, "discard_free_buffers")?;
        state.discard_free_buffers();
        state.validate_consistency();
        Ok(())
    }

    /// Returns a mask of the slots whose buffer the consumer has not received
    /// since it was last replaced. The consumer must drop the references it
    /// caches for these slots.
    pub fn get_released_buffers(&self) -> Result<u64> {
        let state = self.core.lock();
        check_abandoned(&state, "get_released_buffers")?;

        let mut mask = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.acquire_called)
            .fold(0u64, |mask, (i, _)| mask | (1u64 << i));

        // The consumer will not receive the buffers of these frames again.
        for item in state.queue.iter().filter(|item| item.acquire_called) {
            mask &= !(1u64 << item.slot);
        }

        Ok(mask)
    }

    /// Returns a human-readable description of the state of the queue, each
    /// line starting with `prefix`.
    pub fn dump_state(&self, prefix: &str) -> String {
        self.core.lock().dump(prefix)
    }
}
