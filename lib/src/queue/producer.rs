//! Producer side of a queue.
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::buffer_core::{wait_fence, BufferQueueCore, CoreState, SlotLimits};
use super::item::{BufferItem, QueueBufferInput, QueueBufferOutput};
use super::listener::{ConsumerListener, ProducerListener};
use super::{DequeueFlags, NativeWindowQuery, NUM_BUFFER_SLOTS};
use crate::fence::Fence;
use crate::graphic_buffer::GraphicBuffer;
use crate::{
    Dataspace, Error, PixelFormat, ProducerApi, Rect, Result, ScalingMode, Transform, Usage,
};

/// A slot handed to the producer by [`BufferQueueProducer::dequeue_buffer`].
#[derive(Debug)]
pub struct DequeuedBuffer {
    pub slot: usize,
    /// Fence to wait on before writing into the buffer.
    pub fence: Fence,
    pub flags: DequeueFlags,
    /// Number of frames queued since the content of the buffer was last
    /// queued, or 0 if the buffer is new.
    pub buffer_age: u64,
}

/// Attributes of the buffer requested by a dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BufferRequest {
    width: u32,
    height: u32,
    format: PixelFormat,
    usage: Usage,
}

impl BufferRequest {
    /// Fills the unspecified attributes with the defaults of the queue.
    fn resolve(state: &CoreState, width: u32, height: u32, format: PixelFormat, usage: Usage) -> Self {
        let (width, height) = if width == 0 && height == 0 {
            (state.default_width, state.default_height)
        } else {
            (width, height)
        };
        let format = if format == PixelFormat::default() {
            state.default_buffer_format
        } else {
            format
        };

        BufferRequest {
            width,
            height,
            format,
            usage: usage | state.consumer_usage_bits,
        }
    }
}

/// State used to deliver the consumer callbacks of concurrent queue calls in
/// order.
#[derive(Debug, Default)]
struct CallbackState {
    /// Ticket of the next queue call allowed to call the consumer listener.
    current_ticket: u64,
    last_queue_buffer_fence: Fence,
}

/// The producer side of a queue, used to dequeue buffers, fill them and queue
/// them for the consumer.
pub struct BufferQueueProducer {
    core: Arc<BufferQueueCore>,
    callback: Mutex<CallbackState>,
    callback_cond: Condvar,
}

fn check_connected(state: &CoreState, op: &str) -> Result<()> {
    if state.is_abandoned {
        bq_error!(state, "{}: queue has been abandoned", op);
        return Err(Error::NoInit);
    }
    if state.connected_api.is_none() {
        bq_error!(state, "{}: queue has no connected producer", op);
        return Err(Error::NoInit);
    }
    Ok(())
}

fn check_abandoned(state: &CoreState, op: &str) -> Result<()> {
    if state.is_abandoned {
        bq_error!(state, "{}: queue has been abandoned", op);
        return Err(Error::NoInit);
    }
    Ok(())
}

fn check_slot_dequeued(state: &CoreState, slot: usize, op: &str) -> Result<()> {
    if slot >= NUM_BUFFER_SLOTS {
        bq_error!(state, "{}: slot {} out of range [0, {})", op, slot, NUM_BUFFER_SLOTS);
        return Err(Error::BadValue);
    }
    let s = &state.slots[slot];
    if !s.state.is_dequeued() {
        bq_error!(
            state,
            "{}: slot {} is not owned by the producer (state = {})",
            op,
            slot,
            s.state.state()
        );
        return Err(Error::BadValue);
    }
    Ok(())
}

fn output(state: &CoreState) -> QueueBufferOutput {
    QueueBufferOutput {
        width: state.default_width,
        height: state.default_height,
        transform_hint: state.transform_hint,
        num_pending_buffers: state.queue.len() as u32,
    }
}

impl BufferQueueProducer {
    pub(crate) fn new(core: Arc<BufferQueueCore>) -> Self {
        BufferQueueProducer {
            core,
            callback: Mutex::new(Default::default()),
            callback_cond: Condvar::new(),
        }
    }

    /// Removes the lowest free slot, or the least recently freed buffer.
    fn take_free_slot(state: &mut CoreState) -> Option<usize> {
        state
            .free_slots
            .pop_first()
            .or_else(|| state.free_buffers.pop_front())
    }

    /// Finds a free slot for a dequeue, waiting for one to become free
    /// according to the blocking mode of the queue.
    ///
    /// The returned slot is removed from its free list, unless it is the
    /// shared slot which always stays active.
    fn wait_for_free_slot<'a>(
        &self,
        mut state: MutexGuard<'a, CoreState>,
        request: &BufferRequest,
        async_request: bool,
    ) -> Result<(MutexGuard<'a, CoreState>, usize)> {
        let op = "dequeue_buffer";
        let deadline = state.dequeue_timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if state.is_abandoned {
                bq_error!(state, "{}: queue has been abandoned", op);
                return Err(Error::NoInit);
            }

            let (dequeued, _) = state.active_counts();
            if dequeued >= state.max_dequeued_buffer_count {
                bq_error!(
                    state,
                    "{}: attempting to exceed the max dequeued buffer count ({})",
                    op,
                    state.max_dequeued_buffer_count
                );
                return Err(Error::Busy);
            }

            // Let the consumer catch up if too many frames are waiting.
            let too_many_buffers = state.queue.len() > state.max_buffer_count_locked();
            if too_many_buffers {
                bq_trace!(state, "{}: queue size is {}, waiting", op, state.queue.len());
            } else if let (true, Some(slot)) = (state.shared_buffer_mode, state.shared_buffer_slot) {
                return Ok((state, slot));
            } else {
                let found = if let Some(slot) = state.take_matching_free_buffer(
                    request.width,
                    request.height,
                    request.format,
                    request.usage,
                ) {
                    Some(slot)
                } else if state.allow_allocation {
                    Self::take_free_slot(&mut state)
                } else if !state.free_slots.is_empty() || !state.free_buffers.is_empty() {
                    bq_error!(
                        state,
                        "{}: no free buffer matches {}x{} {} and allocation is disallowed",
                        op,
                        request.width,
                        request.height,
                        request.format
                    );
                    return Err(Error::WouldBlock);
                } else {
                    None
                };

                if let Some(slot) = found {
                    return Ok((state, slot));
                }
            }

            state = self.core.wait_while_allocating(state);
            if state.is_abandoned {
                continue;
            }

            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    bq_error!(state, "{}: timed out waiting for a free slot", op);
                    return Err(Error::TimedOut);
                }
                let (guard, res) = self
                    .core
                    .dequeue_cond
                    .wait_timeout(state, deadline - now)
                    .unwrap();
                state = guard;
                if res.timed_out() && !state.is_abandoned {
                    bq_error!(state, "{}: timed out waiting for a free slot", op);
                    return Err(Error::TimedOut);
                }
            } else if state.async_mode || state.dequeue_buffer_cannot_block || async_request {
                bq_error!(state, "{}: no free slot and blocking is not allowed", op);
                return Err(Error::WouldBlock);
            } else {
                state = self.core.dequeue_cond.wait(state).unwrap();
            }
        }
    }

    /// Allocates a buffer without the lock held and installs it in `slot`,
    /// which must have been marked as allocating by the caller.
    fn allocate_into_slot<'a>(
        &'a self,
        state: MutexGuard<'a, CoreState>,
        slot: usize,
        request: &BufferRequest,
        op: &str,
    ) -> Result<MutexGuard<'a, CoreState>> {
        let generation = state.generation_number;
        drop(state);

        let allocation = GraphicBuffer::allocate(
            &*self.core.allocator,
            request.width,
            request.height,
            request.format,
            request.usage,
            generation,
        );

        let mut state = self.core.lock();
        self.core.allocation_done(&mut state);

        let buffer = match allocation {
            Ok(buffer) => buffer,
            Err(e) => {
                bq_error!(state, "{}: failed to allocate buffer for slot {}: {}", op, slot, e);
                return Err(Error::NoMemory);
            }
        };

        let s = &state.slots[slot];
        if state.is_abandoned || !s.state.is_dequeued() || s.buffer.is_some() {
            bq_error!(state, "{}: queue was abandoned while allocating", op);
            return Err(Error::NoInit);
        }

        buffer.set_generation_number(state.generation_number);
        state.slots[slot].buffer = Some(Arc::new(buffer));
        bq_debug!(
            state,
            "{}: allocated {}x{} {} buffer for slot {}",
            op,
            request.width,
            request.height,
            request.format,
            slot
        );
        Ok(state)
    }

    /// Connects a producer to the queue. The queue needs a consumer.
    ///
    /// `listener` is notified every time the consumer releases a buffer.
    /// `controlled_by_app` makes dequeue non-blocking unless a dequeue
    /// timeout is set.
    pub fn connect(
        &self,
        api: ProducerApi,
        controlled_by_app: bool,
        listener: Option<Arc<dyn ProducerListener>>,
    ) -> Result<QueueBufferOutput> {
        let state = self.core.lock();
        let mut state = self.core.wait_while_allocating(state);

        if state.is_abandoned {
            bq_error!(state, "connect: queue has been abandoned");
            return Err(Error::NoInit);
        }
        if state.consumer_listener.is_none() {
            bq_error!(state, "connect: queue has no consumer");
            return Err(Error::NoInit);
        }
        if let Some(connected_api) = state.connected_api {
            bq_error!(
                state,
                "connect: already connected (cur = {}, req = {})",
                connected_api,
                api
            );
            return Err(Error::BadValue);
        }

        let cannot_block = state.dequeue_timeout.is_none()
            && (state.consumer_controlled_by_app || controlled_by_app);
        let limits = SlotLimits {
            cannot_block,
            ..state.limits()
        };
        if !state.apply_limits(limits) {
            bq_error!(
                state,
                "connect: {} buffers are needed but the maximum buffer count is {}",
                limits.buffer_count(),
                limits.max_buffer_count
            );
            return Err(Error::BadValue);
        }

        state.connected_api = Some(api);
        state.connected_producer_listener = listener;
        state.producer_controlled_by_app = controlled_by_app;
        state.buffer_has_been_queued = false;
        state.allow_allocation = true;
        state.validate_consistency();

        bq_debug!(
            state,
            "connect: api = {}, controlled by app = {}",
            api,
            controlled_by_app
        );
        Ok(output(&state))
    }

    /// Disconnects the producer connected with `api`.
    ///
    /// Everything the producer owns or has queued is freed, but buffers
    /// acquired by the consumer are left alone.
    pub fn disconnect(&self, api: ProducerApi) -> Result<()> {
        let state = self.core.lock();
        let mut state = self.core.wait_while_allocating(state);

        if state.is_abandoned {
            // The consumer is gone, so there is nothing left to tear down.
            bq_debug!(state, "disconnect: queue is abandoned");
            return Ok(());
        }
        match state.connected_api {
            None => {
                bq_error!(state, "disconnect: not connected (req = {})", api);
                return Err(Error::NoInit);
            }
            Some(connected_api) if connected_api != api => {
                bq_error!(
                    state,
                    "disconnect: still connected to another api (cur = {}, req = {})",
                    connected_api,
                    api
                );
                return Err(Error::BadValue);
            }
            Some(_) => (),
        }

        state.free_producer_buffers();
        state.connected_api = None;
        state.connected_producer_listener = None;

        let limits = SlotLimits {
            cannot_block: false,
            ..state.limits()
        };
        if !state.apply_limits(limits) {
            bq_warn!(state, "disconnect: could not adjust the number of available slots");
        }
        state.validate_consistency();
        self.core.dequeue_cond.notify_all();

        let listener = state.consumer_listener.clone();
        bq_debug!(state, "disconnect: api = {}", api);
        drop(state);

        self.callback.lock().unwrap().last_queue_buffer_fence = Fence::NO_FENCE;

        if let Some(listener) = listener {
            listener.on_buffers_released();
            listener.on_disconnect();
        }

        Ok(())
    }

    /// Sets the number of buffers the producer can hold at the same time.
    pub fn set_max_dequeued_buffer_count(&self, max_dequeued: usize) -> Result<()> {
        let state = self.core.lock();
        let mut state = self.core.wait_while_allocating(state);

        if max_dequeued < 1 {
            bq_error!(state, "set_max_dequeued_buffer_count: invalid count {}", max_dequeued);
            return Err(Error::BadValue);
        }
        check_abandoned(&state, "set_max_dequeued_buffer_count")?;
        if max_dequeued == state.max_dequeued_buffer_count {
            return Ok(());
        }

        let (dequeued, _) = state.active_counts();
        if dequeued > max_dequeued {
            bq_error!(
                state,
                "set_max_dequeued_buffer_count: producer holds {} buffers, more than {}",
                dequeued,
                max_dequeued
            );
            return Err(Error::BadValue);
        }

        let old_count = state.max_buffer_count_locked();
        let limits = SlotLimits {
            max_dequeued,
            ..state.limits()
        };
        if limits.buffer_count() > NUM_BUFFER_SLOTS
            || limits.buffer_count() < state.min_max_buffer_count()
            || !state.apply_limits(limits)
        {
            bq_error!(
                state,
                "set_max_dequeued_buffer_count: {} buffers are needed but the maximum buffer count is {}",
                limits.buffer_count(),
                limits.max_buffer_count
            );
            return Err(Error::BadValue);
        }
        let shrunk = state.max_buffer_count_locked() < old_count;
        state.validate_consistency();
        self.core.dequeue_cond.notify_all();

        bq_debug!(state, "set_max_dequeued_buffer_count: {}", max_dequeued);
        let listener = state.consumer_listener.clone().filter(|_| shrunk);
        drop(state);

        if let Some(listener) = listener {
            listener.on_buffers_released();
        }

        Ok(())
    }

    /// Makes every queued frame droppable, and lets dequeue return
    /// `WouldBlock` instead of waiting. Needs one more buffer.
    pub fn set_async_mode(&self, async_mode: bool) -> Result<()> {
        let state = self.core.lock();
        let mut state = self.core.wait_while_allocating(state);

        check_abandoned(&state, "set_async_mode")?;
        if async_mode == state.async_mode {
            return Ok(());
        }

        let limits = SlotLimits {
            async_mode,
            ..state.limits()
        };
        if !state.apply_limits(limits) {
            bq_error!(
                state,
                "set_async_mode: {} buffers are needed but the maximum buffer count is {}",
                limits.buffer_count(),
                limits.max_buffer_count
            );
            return Err(Error::BadValue);
        }
        state.validate_consistency();
        self.core.dequeue_cond.notify_all();

        bq_debug!(state, "set_async_mode: {}", async_mode);
        Ok(())
    }

    /// Dequeues a slot holding a buffer of the given attributes.
    ///
    /// A width and height of 0 request the default size, and a format of 0
    /// the default format. The consumer usage bits are added to `usage`.
    /// `async_mode` makes this call fail with `WouldBlock` rather than wait.
    ///
    /// If the returned flags contain `BUFFER_NEEDS_REALLOCATION`, the
    /// producer must call [`Self::request_buffer`] before queueing the slot.
    pub fn dequeue_buffer(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: Usage,
        async_mode: bool,
    ) -> Result<DequeuedBuffer> {
        let state = self.core.lock();
        check_connected(&state, "dequeue_buffer")?;

        if (width == 0) != (height == 0) {
            bq_error!(state, "dequeue_buffer: invalid size {}x{}", width, height);
            return Err(Error::BadValue);
        }

        let state = self.core.wait_while_allocating(state);
        let request = BufferRequest::resolve(&state, width, height, format, usage);
        let (mut state, slot) =
            self.wait_for_free_slot(state, &request, async_mode)?;

        let needs_reallocation = match &state.slots[slot].buffer {
            None => true,
            Some(buffer) => {
                buffer.needs_reallocation(request.width, request.height, request.format, request.usage)
                    || buffer.generation_number() != state.generation_number
            }
        };
        let is_shared_slot = state.shared_buffer_slot == Some(slot);
        if is_shared_slot && needs_reallocation {
            bq_error!(
                state,
                "dequeue_buffer: cannot reallocate the shared buffer in slot {}",
                slot
            );
            return Err(Error::BadValue);
        }

        if !is_shared_slot {
            state.active_buffers.insert(slot);
        }
        state.slots[slot].state.dequeue();

        let mut flags = DequeueFlags::empty();
        if needs_reallocation {
            let s = &mut state.slots[slot];
            s.buffer = None;
            s.request_needed = true;
            s.acquire_called = false;
            s.attached_by_producer = false;
            s.frame_number = 0;
            s.fence = Fence::NO_FENCE;
            state.buffer_age = 0;
            state.is_allocating = true;
            flags |= DequeueFlags::BUFFER_NEEDS_REALLOCATION;
        } else {
            state.buffer_age = state.frame_counter + 1 - state.slots[slot].frame_number;
            if state.slots[slot].request_needed {
                flags |= DequeueFlags::BUFFER_NEEDS_REALLOCATION;
            }
        }

        let fence = if is_shared_slot {
            Fence::NO_FENCE
        } else {
            std::mem::take(&mut state.slots[slot].fence)
        };

        if state.shared_buffer_mode && state.shared_buffer_slot.is_none() {
            state.shared_buffer_slot = Some(slot);
            state.slots[slot].state.shared = true;
        }
        if state.release_all_pending {
            flags |= DequeueFlags::RELEASE_ALL_BUFFERS;
            state.release_all_pending = false;
        }
        let buffer_age = state.buffer_age;

        if needs_reallocation {
            state = match self.allocate_into_slot(state, slot, &request, "dequeue_buffer") {
                Ok(state) => state,
                Err(e) => {
                    let mut state = self.core.lock();
                    if !state.is_abandoned && state.slots[slot].state.is_dequeued() {
                        state.active_buffers.remove(&slot);
                        state.slots[slot].clear();
                        state.free_slots.insert(slot);
                        if state.shared_buffer_slot == Some(slot) {
                            state.shared_buffer_slot = None;
                        }
                        state.validate_consistency();
                    }
                    self.core.dequeue_cond.notify_all();
                    return Err(e);
                }
            };
        }
        state.validate_consistency();

        bq_trace!(
            state,
            "dequeue_buffer: slot {} flags {:?} age {}",
            slot,
            flags,
            buffer_age
        );
        Ok(DequeuedBuffer {
            slot,
            fence,
            flags,
            buffer_age,
        })
    }

    /// Returns the buffer of a dequeued slot the producer has not seen yet,
    /// allocating it if needed.
    pub fn request_buffer(&self, slot: usize) -> Result<Arc<GraphicBuffer>> {
        let state = self.core.lock();
        check_connected(&state, "request_buffer")?;
        let mut state = self.core.wait_while_allocating(state);
        check_slot_dequeued(&state, slot, "request_buffer")?;

        if !state.slots[slot].request_needed {
            bq_error!(state, "request_buffer: slot {} does not need a request", slot);
            return Err(Error::BadValue);
        }

        if state.slots[slot].buffer.is_none() {
            let request = BufferRequest::resolve(&state, 0, 0, PixelFormat::default(), Usage::empty());
            state.is_allocating = true;
            state = self.allocate_into_slot(state, slot, &request, "request_buffer")?;
        }

        let buffer = match &state.slots[slot].buffer {
            Some(buffer) => Arc::clone(buffer),
            None => return Err(Error::NoMemory),
        };
        state.slots[slot].request_needed = false;
        state.validate_consistency();

        Ok(buffer)
    }

    /// Queues a dequeued slot for the consumer to acquire.
    pub fn queue_buffer(&self, slot: usize, input: QueueBufferInput) -> Result<QueueBufferOutput> {
        let QueueBufferInput {
            timestamp,
            is_auto_timestamp,
            dataspace,
            crop,
            scaling_mode,
            transform,
            sticky_transform,
            async_mode,
            fence,
            surface_damage,
        } = input;

        let (item, replaced, listener, ticket, output, api, name) = {
            let mut state = self.core.lock();

            let scaling_mode = match ScalingMode::try_from(scaling_mode) {
                Ok(mode) => mode,
                Err(e) => {
                    bq_error!(state, "queue_buffer: unknown scaling mode {}", scaling_mode);
                    return Err(e);
                }
            };
            check_connected(&state, "queue_buffer")?;
            check_slot_dequeued(&state, slot, "queue_buffer")?;
            if state.slots[slot].request_needed {
                bq_error!(
                    state,
                    "queue_buffer: slot {} was queued without requesting a buffer",
                    slot
                );
                return Err(Error::BadValue);
            }
            let buffer = match &state.slots[slot].buffer {
                Some(buffer) => Arc::clone(buffer),
                None => {
                    bq_error!(state, "queue_buffer: slot {} has no buffer", slot);
                    return Err(Error::BadValue);
                }
            };

            let buffer_rect = Rect::from_size(buffer.width(), buffer.height());
            if crop.intersect(&buffer_rect) != crop {
                bq_error!(
                    state,
                    "queue_buffer: crop {} does not fit within buffer {}",
                    crop,
                    buffer_rect
                );
                return Err(Error::BadValue);
            }

            let dataspace = if dataspace == Dataspace::UNKNOWN {
                state.default_buffer_dataspace
            } else {
                dataspace
            };

            if state.shared_buffer_mode && state.shared_buffer_slot.is_none() {
                state.shared_buffer_slot = Some(slot);
                state.slots[slot].state.shared = true;
            }

            state.frame_counter += 1;
            let frame_number = state.frame_counter;
            let s = &mut state.slots[slot];
            s.fence = fence.clone();
            s.state.queue();
            s.frame_number = frame_number;
            let acquire_called = s.acquire_called;

            let is_shared_slot = state.shared_buffer_slot == Some(slot);
            let item = BufferItem {
                slot,
                frame_number,
                crop,
                transform: transform - Transform::INVERSE_DISPLAY,
                transform_to_display_inverse: transform.contains(Transform::INVERSE_DISPLAY),
                scaling_mode,
                timestamp,
                is_auto_timestamp,
                dataspace,
                is_droppable: state.async_mode
                    || state.dequeue_buffer_cannot_block
                    || async_mode
                    || is_shared_slot,
                acquire_called,
                graphic_buffer: Some(buffer),
                fence,
                surface_damage,
            };

            state.sticky_transform = sticky_transform;
            if state.shared_buffer_mode {
                state.shared_buffer_cache = super::buffer_core::SharedBufferCache {
                    crop,
                    transform,
                    scaling_mode,
                    dataspace,
                };
            }

            let droppable_tail = match state.queue.back() {
                Some(last) if last.is_droppable => Some(last.slot),
                _ => None,
            };
            let replaced = if let Some(last_slot) = droppable_tail {
                if last_slot != slot {
                    state.slots[last_slot].state.free_queued();
                    state.return_free_slot(last_slot);
                }
                bq_debug!(
                    state,
                    "queue_buffer: frame {} replaces droppable frame in slot {}",
                    frame_number,
                    last_slot
                );
                if let Some(last) = state.queue.back_mut() {
                    *last = item.clone();
                }
                true
            } else {
                state.queue.push_back(item.clone());
                false
            };

            state.buffer_has_been_queued = true;
            state.last_queued_slot = Some(slot);
            self.core.dequeue_cond.notify_all();

            let ticket = state.next_callback_ticket;
            state.next_callback_ticket += 1;
            state.validate_consistency();

            bq_trace!(
                state,
                "queue_buffer: slot {} frame {} timestamp {}",
                slot,
                frame_number,
                timestamp
            );
            let name = match state.connected_api {
                Some(ProducerApi::Egl) => Some(state.consumer_name.clone()),
                _ => None,
            };
            (
                item,
                replaced,
                state.consumer_listener.clone(),
                ticket,
                output(&state),
                state.connected_api,
                name,
            )
        };

        // Deliver the callbacks of concurrent queue calls in frame order.
        let mut callback = self
            .callback_cond
            .wait_while(self.callback.lock().unwrap(), |c| c.current_ticket != ticket)
            .unwrap();

        if let Some(listener) = listener {
            if replaced {
                listener.on_frame_replaced(&item);
            } else {
                listener.on_frame_available(&item);
            }
        }

        let last_fence = std::mem::replace(&mut callback.last_queue_buffer_fence, item.fence);
        callback.current_ticket += 1;
        self.callback_cond.notify_all();
        drop(callback);

        // Keep EGL producers at most one frame ahead of the GPU.
        if let (Some(ProducerApi::Egl), Some(name)) = (api, name) {
            wait_fence(&name, &last_fence, "queue_buffer");
        }

        Ok(output)
    }

    /// Returns a dequeued slot to the queue without queueing it. `fence`
    /// guards the buffer's next use.
    pub fn cancel_buffer(&self, slot: usize, fence: Fence) -> Result<()> {
        let mut state = self.core.lock();
        check_connected(&state, "cancel_buffer")?;

        if state.shared_buffer_mode {
            bq_error!(state, "cancel_buffer: cannot cancel a buffer in shared buffer mode");
            return Err(Error::BadValue);
        }
        check_slot_dequeued(&state, slot, "cancel_buffer")?;

        let s = &mut state.slots[slot];
        s.state.cancel();
        s.fence = fence;
        state.return_free_slot(slot);
        state.validate_consistency();
        self.core.dequeue_cond.notify_all();

        bq_trace!(state, "cancel_buffer: slot {}", slot);
        Ok(())
    }

    /// Removes the buffer of a dequeued slot from the queue, and hands its
    /// ownership to the caller.
    pub fn detach_buffer(&self, slot: usize) -> Result<Arc<GraphicBuffer>> {
        let mut state = self.core.lock();
        check_connected(&state, "detach_buffer")?;

        if state.shared_buffer_mode || state.shared_buffer_slot == Some(slot) {
            bq_error!(state, "detach_buffer: cannot detach a buffer in shared buffer mode");
            return Err(Error::BadValue);
        }
        check_slot_dequeued(&state, slot, "detach_buffer")?;
        if state.slots[slot].request_needed {
            bq_error!(
                state,
                "detach_buffer: slot {} was detached without requesting a buffer",
                slot
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

        state.slots[slot].state.detach_producer();
        state.active_buffers.remove(&slot);
        state.slots[slot].clear();
        state.free_slots.insert(slot);
        state.validate_consistency();
        self.core.dequeue_cond.notify_all();

        bq_debug!(state, "detach_buffer: slot {}", slot);
        Ok(buffer)
    }

    /// Installs `buffer` in a free slot and dequeues it. The producer can queue
    /// the returned slot without requesting its buffer. Never waits: fails
    /// with `NoMemory` if no slot is free.
    pub fn attach_buffer(&self, buffer: Arc<GraphicBuffer>) -> Result<usize> {
        let state = self.core.lock();
        check_connected(&state, "attach_buffer")?;

        if state.shared_buffer_mode {
            bq_error!(state, "attach_buffer: cannot attach a buffer in shared buffer mode");
            return Err(Error::BadValue);
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

        let mut state = self.core.wait_while_allocating(state);
        let (dequeued, _) = state.active_counts();
        if dequeued >= state.max_dequeued_buffer_count {
            bq_error!(
                state,
                "attach_buffer: attempting to exceed the max dequeued buffer count ({})",
                state.max_dequeued_buffer_count
            );
            return Err(Error::Busy);
        }
        let slot = match Self::take_free_slot(&mut state) {
            Some(slot) => slot,
            None => {
                bq_error!(state, "attach_buffer: could not find a free slot");
                return Err(Error::NoMemory);
            }
        };

        let s = &mut state.slots[slot];
        s.buffer = Some(buffer);
        s.state.attach_producer();
        s.fence = Fence::NO_FENCE;
        s.request_needed = false;
        s.acquire_called = false;
        s.attached_by_producer = true;
        state.active_buffers.insert(slot);
        state.validate_consistency();

        bq_debug!(state, "attach_buffer: slot {}", slot);
        Ok(slot)
    }

    /// Allocates buffers for all the free slots that have none, so that later
    /// dequeues do not have to. Zero attributes take the defaults of the
    /// queue, like [`Self::dequeue_buffer`].
    pub fn allocate_buffers(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: Usage,
    ) -> Result<()> {
        loop {
            let (count, request, generation) = {
                let state = self.core.lock();
                let mut state = self.core.wait_while_allocating(state);
                check_abandoned(&state, "allocate_buffers")?;

                if !state.allow_allocation {
                    bq_error!(state, "allocate_buffers: allocation is not allowed");
                    return Err(Error::InvalidOperation);
                }

                let count = state.free_slots.len();
                if count == 0 {
                    return Ok(());
                }

                let request = BufferRequest::resolve(&state, width, height, format, usage);
                state.is_allocating = true;
                (count, request, state.generation_number)
            };

            let buffers = (0..count)
                .map(|_| {
                    GraphicBuffer::allocate(
                        &*self.core.allocator,
                        request.width,
                        request.height,
                        request.format,
                        request.usage,
                        generation,
                    )
                })
                .collect::<std::result::Result<Vec<_>, _>>();

            let mut state = self.core.lock();
            self.core.allocation_done(&mut state);

            let buffers = match buffers {
                Ok(buffers) => buffers,
                Err(e) => {
                    bq_error!(state, "allocate_buffers: failed to allocate buffers: {}", e);
                    return Err(Error::NoMemory);
                }
            };
            check_abandoned(&state, "allocate_buffers")?;

            if BufferRequest::resolve(&state, width, height, format, usage) != request {
                bq_debug!(state, "allocate_buffers: defaults changed while allocating, retrying");
                continue;
            }

            for buffer in buffers {
                let slot = match state.free_slots.pop_first() {
                    Some(slot) => slot,
                    None => break,
                };
                buffer.set_generation_number(state.generation_number);
                let s = &mut state.slots[slot];
                s.buffer = Some(Arc::new(buffer));
                s.request_needed = true;
                s.fence = Fence::NO_FENCE;
                state.free_buffers.push_front(slot);
                bq_trace!(state, "allocate_buffers: allocated buffer for slot {}", slot);
            }
            state.validate_consistency();
            self.core.dequeue_cond.notify_all();

            return Ok(());
        }
    }

    /// Whether dequeue may allocate buffers. When disallowed, dequeue only
    /// reuses buffers matching the request.
    pub fn allow_allocation(&self, allow: bool) -> Result<()> {
        let mut state = self.core.lock();
        check_abandoned(&state, "allow_allocation")?;
        state.allow_allocation = allow;
        bq_debug!(state, "allow_allocation: {}", allow);
        Ok(())
    }

    /// Sets the generation number of future allocations. Only buffers of that
    /// generation can be attached to the queue.
    pub fn set_generation_number(&self, generation_number: u32) -> Result<()> {
        let mut state = self.core.lock();
        check_abandoned(&state, "set_generation_number")?;
        state.generation_number = generation_number;
        Ok(())
    }

    /// Bounds the time dequeue waits for a free slot, regardless of the
    /// blocking mode. `None` lets it wait forever.
    pub fn set_dequeue_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let state = self.core.lock();
        let mut state = self.core.wait_while_allocating(state);
        check_abandoned(&state, "set_dequeue_timeout")?;

        let limits = SlotLimits {
            cannot_block: false,
            ..state.limits()
        };
        if !state.apply_limits(limits) {
            bq_error!(state, "set_dequeue_timeout: could not adjust the number of available slots");
            return Err(Error::BadValue);
        }
        state.dequeue_timeout = timeout;
        state.validate_consistency();

        bq_debug!(state, "set_dequeue_timeout: {:?}", timeout);
        Ok(())
    }

    /// Pins the next dequeued slot so that it is shared by both sides.
    pub fn set_shared_buffer_mode(&self, shared: bool) -> Result<()> {
        let state = self.core.lock();
        let mut state = self.core.wait_while_allocating(state);
        check_abandoned(&state, "set_shared_buffer_mode")?;

        if shared == state.shared_buffer_mode {
            return Ok(());
        }

        let limits = SlotLimits {
            shared,
            ..state.limits()
        };
        if !state.apply_limits(limits) {
            bq_error!(
                state,
                "set_shared_buffer_mode: {} buffers are needed but the maximum buffer count is {}",
                limits.buffer_count(),
                limits.max_buffer_count
            );
            return Err(Error::BadValue);
        }

        if !shared {
            if let Some(slot) = state.shared_buffer_slot.take() {
                state.return_free_slot(slot);
            }
        }
        state.validate_consistency();
        self.core.dequeue_cond.notify_all();

        bq_debug!(state, "set_shared_buffer_mode: {}", shared);
        Ok(())
    }

    /// In shared buffer mode, lets the consumer acquire the shared buffer
    /// again even if no new frame has been queued.
    pub fn set_auto_refresh(&self, auto_refresh: bool) -> Result<()> {
        let mut state = self.core.lock();
        check_abandoned(&state, "set_auto_refresh")?;
        state.auto_refresh = auto_refresh;
        Ok(())
    }

    pub fn query(&self, what: NativeWindowQuery) -> Result<u64> {
        let state = self.core.lock();
        check_abandoned(&state, "query")?;

        let value = match what {
            NativeWindowQuery::Width | NativeWindowQuery::DefaultWidth => {
                state.default_width as u64
            }
            NativeWindowQuery::Height | NativeWindowQuery::DefaultHeight => {
                state.default_height as u64
            }
            NativeWindowQuery::Format => state.default_buffer_format.to_u32() as u64,
            NativeWindowQuery::MinUndequeuedBuffers => state.min_undequeued_buffer_count() as u64,
            NativeWindowQuery::TransformHint => state.transform_hint.bits() as u64,
            NativeWindowQuery::ConsumerRunningBehind => (state.queue.len() > 1) as u64,
            NativeWindowQuery::ConsumerUsageBits => state.consumer_usage_bits.bits(),
            NativeWindowQuery::StickyTransform => state.sticky_transform.bits() as u64,
            NativeWindowQuery::DefaultDataspace => state.default_buffer_dataspace.0 as u64,
            NativeWindowQuery::BufferAge => {
                if state.buffer_age > i32::MAX as u64 {
                    0
                } else {
                    state.buffer_age
                }
            }
        };

        Ok(value)
    }

    pub fn consumer_name(&self) -> String {
        self.core.lock().consumer_name.clone()
    }
}
