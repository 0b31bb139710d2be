//! State shared by both sides of a queue.
use std::collections::{BTreeSet, VecDeque};
use std::fmt::Write;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::item::BufferItem;
use super::listener::{ProducerListener, ProxyConsumerListener};
use super::slot::Slot;
use super::{BufferQueueConfig, NUM_BUFFER_SLOTS};
use crate::fence::{Fence, FenceError};
use crate::memory::GraphicBufferAllocator;
use crate::{Dataspace, PixelFormat, ProducerApi, Rect, ScalingMode, Transform, Usage};

/// How long internal paths wait on a fence before giving up.
pub(crate) const FENCE_WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Attributes of the last frame queued into the shared slot, used to
/// re-acquire it when auto-refresh is enabled.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SharedBufferCache {
    pub crop: Rect,
    pub transform: Transform,
    pub scaling_mode: ScalingMode,
    pub dataspace: Dataspace,
}

/// The parameters determining how many slots a queue can use.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotLimits {
    pub max_acquired: usize,
    pub max_dequeued: usize,
    pub max_buffer_count: usize,
    pub async_mode: bool,
    pub cannot_block: bool,
    pub shared: bool,
}

impl SlotLimits {
    /// Number of buffers needed so that both sides can hold their maximum
    /// while the producer never waits on the consumer if it cannot block.
    pub fn buffer_count(&self) -> usize {
        let extra = self.async_mode || self.cannot_block || self.shared;
        self.max_acquired + self.max_dequeued + extra as usize
    }
}

/// Everything protected by the queue's lock.
pub(crate) struct CoreState {
    pub consumer_name: String,
    pub slots: [Slot; NUM_BUFFER_SLOTS],
    /// Frames waiting to be acquired, oldest first.
    pub queue: VecDeque<BufferItem>,

    /// Free slots without a buffer. The lowest index is used first.
    pub free_slots: BTreeSet<usize>,
    /// Free slots with a buffer, least recently freed first.
    pub free_buffers: VecDeque<usize>,
    /// Slots beyond the current maximum buffer count.
    pub unused_slots: VecDeque<usize>,
    /// Slots dequeued, queued or acquired, plus the shared slot.
    pub active_buffers: BTreeSet<usize>,

    pub consumer_listener: Option<ProxyConsumerListener>,
    pub consumer_controlled_by_app: bool,
    pub connected_api: Option<ProducerApi>,
    pub connected_producer_listener: Option<Arc<dyn ProducerListener>>,
    pub producer_controlled_by_app: bool,
    /// Set once the consumer disconnects. There is no coming back.
    pub is_abandoned: bool,

    pub default_width: u32,
    pub default_height: u32,
    pub default_buffer_format: PixelFormat,
    pub default_buffer_dataspace: Dataspace,
    pub consumer_usage_bits: Usage,
    pub transform_hint: Transform,
    pub sticky_transform: Transform,

    pub max_buffer_count: usize,
    pub max_acquired_buffer_count: usize,
    pub max_dequeued_buffer_count: usize,

    pub buffer_has_been_queued: bool,
    pub frame_counter: u64,
    pub buffer_age: u64,
    pub dequeue_buffer_cannot_block: bool,
    pub dequeue_timeout: Option<Duration>,
    pub async_mode: bool,
    pub shared_buffer_mode: bool,
    pub auto_refresh: bool,
    pub shared_buffer_slot: Option<usize>,
    pub shared_buffer_cache: SharedBufferCache,
    pub allow_allocation: bool,
    /// A buffer is being allocated without the lock held.
    pub is_allocating: bool,
    pub generation_number: u32,
    pub present_time_offset: i64,
    /// Buffers have been freed behind the producer's back since its last
    /// dequeue.
    pub release_all_pending: bool,
    pub last_queued_slot: Option<usize>,
    pub next_callback_ticket: u64,
}

impl CoreState {
    fn new(name: String, config: &BufferQueueConfig) -> Self {
        let mut state = CoreState {
            consumer_name: name,
            slots: std::array::from_fn(|_| Slot::default()),
            queue: VecDeque::new(),
            free_slots: BTreeSet::new(),
            free_buffers: VecDeque::new(),
            unused_slots: VecDeque::new(),
            active_buffers: BTreeSet::new(),
            consumer_listener: None,
            consumer_controlled_by_app: false,
            connected_api: None,
            connected_producer_listener: None,
            producer_controlled_by_app: false,
            is_abandoned: false,
            default_width: config.default_width,
            default_height: config.default_height,
            default_buffer_format: config.default_format,
            default_buffer_dataspace: config.default_dataspace,
            consumer_usage_bits: config.consumer_usage,
            transform_hint: Transform::empty(),
            sticky_transform: Transform::empty(),
            max_buffer_count: config.max_buffer_count,
            max_acquired_buffer_count: config.max_acquired_buffers,
            max_dequeued_buffer_count: config.max_dequeued_buffers,
            buffer_has_been_queued: false,
            frame_counter: 0,
            buffer_age: 0,
            dequeue_buffer_cannot_block: false,
            dequeue_timeout: config.dequeue_timeout,
            async_mode: false,
            shared_buffer_mode: false,
            auto_refresh: false,
            shared_buffer_slot: None,
            shared_buffer_cache: Default::default(),
            allow_allocation: config.allow_allocation,
            is_allocating: false,
            generation_number: config.generation_number,
            present_time_offset: config.present_time_offset,
            release_all_pending: false,
            last_queued_slot: None,
            next_callback_ticket: 0,
        };

        let num_starting_buffers = state.max_buffer_count_locked();
        state.free_slots.extend(0..num_starting_buffers);
        for slot in num_starting_buffers..NUM_BUFFER_SLOTS {
            state.unused_slots.push_front(slot);
        }

        state
    }

    /// Number of buffers the producer cannot dequeue.
    pub fn min_undequeued_buffer_count(&self) -> usize {
        let limits = self.limits();
        limits.buffer_count() - limits.max_dequeued
    }

    /// Minimum value the maximum buffer count can take.
    pub fn min_max_buffer_count(&self) -> usize {
        self.min_undequeued_buffer_count() + 1
    }

    /// Number of slots currently usable, i.e. not in `unused_slots`.
    pub fn max_buffer_count_locked(&self) -> usize {
        let limits = self.limits();
        limits.buffer_count().min(limits.max_buffer_count)
    }

    pub fn limits(&self) -> SlotLimits {
        SlotLimits {
            max_acquired: self.max_acquired_buffer_count,
            max_dequeued: self.max_dequeued_buffer_count,
            max_buffer_count: self.max_buffer_count,
            async_mode: self.async_mode,
            cannot_block: self.dequeue_buffer_cannot_block,
            shared: self.shared_buffer_mode,
        }
    }

    /// Switches to `limits`, making slots available or unused accordingly.
    ///
    /// Fails without changing anything if the limits need more buffers than
    /// `limits.max_buffer_count`, or if the slots to retire are not free.
    pub fn apply_limits(&mut self, limits: SlotLimits) -> bool {
        if limits.buffer_count() > limits.max_buffer_count {
            return false;
        }

        let new_count = limits.buffer_count().min(limits.max_buffer_count);
        let delta = new_count as isize - self.max_buffer_count_locked() as isize;
        if !self.adjust_available_slots(delta) {
            return false;
        }

        self.max_acquired_buffer_count = limits.max_acquired;
        self.max_dequeued_buffer_count = limits.max_dequeued;
        self.max_buffer_count = limits.max_buffer_count;
        self.async_mode = limits.async_mode;
        self.dequeue_buffer_cannot_block = limits.cannot_block;
        self.shared_buffer_mode = limits.shared;
        true
    }

    /// Moves `delta` slots from `unused_slots` to `free_slots`, or the other
    /// way around if `delta` is negative. Shrinking takes free slots first,
    /// then frees buffers, and never touches active slots.
    ///
    /// Returns `false` without changing anything if there are not enough slots
    /// to move.
    pub fn adjust_available_slots(&mut self, delta: isize) -> bool {
        if delta >= 0 {
            let delta = delta as usize;
            if delta > self.unused_slots.len() {
                return false;
            }
            for _ in 0..delta {
                if let Some(slot) = self.unused_slots.pop_back() {
                    self.free_slots.insert(slot);
                }
            }
        } else {
            let delta = delta.unsigned_abs();
            if delta > self.free_slots.len() + self.free_buffers.len() {
                return false;
            }
            for _ in 0..delta {
                let slot = if let Some(slot) = self.free_slots.pop_first() {
                    slot
                } else if let Some(slot) = self.free_buffers.pop_back() {
                    self.release_all_pending = true;
                    slot
                } else {
                    return false;
                };
                self.slots[slot].clear();
                self.unused_slots.push_back(slot);
            }
        }

        if delta != 0 {
            bq_debug!(
                self,
                "adjust_available_slots: {} slots now usable",
                NUM_BUFFER_SLOTS - self.unused_slots.len()
            );
        }
        true
    }

    /// Returns the number of slots currently dequeued and acquired.
    pub fn active_counts(&self) -> (usize, usize) {
        self.active_buffers
            .iter()
            .fold((0, 0), |(dequeued, acquired), &s| {
                let state = &self.slots[s].state;
                (
                    dequeued + state.is_dequeued() as usize,
                    acquired + state.is_acquired() as usize,
                )
            })
    }

    /// Puts a slot that just became free back on the right free list.
    ///
    /// The shared slot stays active, and loses its status if shared buffer
    /// mode has been left.
    pub fn return_free_slot(&mut self, slot: usize) {
        let state = &mut self.slots[slot].state;
        if !state.is_free() {
            return;
        }
        if !self.shared_buffer_mode && state.is_shared() {
            state.shared = false;
        }
        if state.is_shared() {
            return;
        }

        self.active_buffers.remove(&slot);
        if self.slots[slot].buffer.is_some() {
            self.free_buffers.push_back(slot);
        } else {
            self.free_slots.insert(slot);
        }
    }

    /// Removes the first slot of `free_buffers` whose buffer satisfies the
    /// request.
    pub fn take_matching_free_buffer(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: Usage,
    ) -> Option<usize> {
        let pos = self.free_buffers.iter().position(|&s| match &self.slots[s].buffer {
            Some(buffer) => {
                !buffer.needs_reallocation(width, height, format, usage)
                    && buffer.generation_number() == self.generation_number
            }
            None => false,
        })?;
        self.free_buffers.remove(pos)
    }

    /// Frees the buffers of all slots, and drops all queued frames.
    pub fn free_all_buffers(&mut self) {
        self.buffer_has_been_queued = false;
        self.queue.clear();
        let slots = std::mem::take(&mut self.free_buffers)
            .into_iter()
            .chain(std::mem::take(&mut self.active_buffers))
            .collect::<Vec<_>>();
        self.free_slots.extend(slots);
        for &slot in &self.free_slots {
            self.slots[slot].clear();
        }
        self.shared_buffer_slot = None;
        self.release_all_pending = true;
    }

    /// Frees everything the producer owns or has queued, and the free
    /// buffers it knows about. Acquired slots stay with the consumer, but
    /// their buffers will have to be requested again by the next producer.
    pub fn free_producer_buffers(&mut self) {
        self.buffer_has_been_queued = false;
        self.queue.clear();

        for slot in std::mem::take(&mut self.free_buffers) {
            self.slots[slot].clear();
            self.free_slots.insert(slot);
        }

        let active = self.active_buffers.iter().copied().collect::<Vec<_>>();
        for slot in active {
            let s = &mut self.slots[slot];
            if s.state.is_acquired() {
                s.state.drop_producer_ownership();
                s.state.shared = false;
                s.request_needed = true;
                s.attached_by_producer = false;
            } else {
                s.clear();
                self.active_buffers.remove(&slot);
                self.free_slots.insert(slot);
            }
        }

        self.shared_buffer_slot = None;
        self.release_all_pending = true;
    }

    /// Frees the buffers of the slots in `free_buffers`, keeping the slots
    /// free.
    pub fn discard_free_buffers(&mut self) {
        for slot in std::mem::take(&mut self.free_buffers) {
            self.slots[slot].clear();
            self.free_slots.insert(slot);
        }
    }

    /// Waits on `fence`, logging if it does not signal in time.
    pub fn wait_fence(&self, fence: &Fence, what: &str) {
        wait_fence(&self.consumer_name, fence, what)
    }

    /// Checks that the slot lists and states agree with each other.
    ///
    /// Panics on the first violation in debug builds. Release builds log the
    /// violations and reset the offending slots.
    pub fn validate_consistency(&mut self) {
        let mut errors: Vec<(Option<usize>, String)> = Vec::new();
        let mut allocated_slots = 0;

        for slot in 0..NUM_BUFFER_SLOTS {
            let in_free_slots = self.free_slots.contains(&slot);
            let in_free_buffers = self.free_buffers.contains(&slot);
            let in_active = self.active_buffers.contains(&slot);
            let in_unused = self.unused_slots.contains(&slot);
            let state = &self.slots[slot].state;
            let has_buffer = self.slots[slot].buffer.is_some();

            let memberships = [in_free_slots, in_free_buffers, in_active, in_unused]
                .iter()
                .filter(|&&m| m)
                .count();
            if memberships != 1 {
                errors.push((
                    Some(slot),
                    format!("slot {} is in {} slot lists", slot, memberships),
                ));
                continue;
            }

            if in_unused {
                if !state.is_free() || has_buffer {
                    errors.push((Some(slot), format!("unused slot {} is in use", slot)));
                }
                continue;
            }

            allocated_slots += 1;
            if in_free_slots && (!state.is_free() || has_buffer) {
                errors.push((
                    Some(slot),
                    format!("slot {} is in free_slots but is {}", slot, state.state()),
                ));
            } else if in_free_buffers && (!state.is_free() || !has_buffer) {
                errors.push((
                    Some(slot),
                    format!(
                        "slot {} is in free_buffers but is {} (has buffer: {})",
                        slot,
                        state.state(),
                        has_buffer
                    ),
                ));
            } else if in_active {
                if state.is_free() && !state.is_shared() {
                    errors.push((Some(slot), format!("active slot {} is free", slot)));
                } else if !has_buffer && !self.is_allocating {
                    errors.push((Some(slot), format!("active slot {} has no buffer", slot)));
                }
            }
        }

        let mut queued_slots = BTreeSet::new();
        for item in &self.queue {
            if !self.slots[item.slot].state.is_queued() {
                errors.push((
                    Some(item.slot),
                    format!("slot {} is in the queue but is not queued", item.slot),
                ));
            }
            if !queued_slots.insert(item.slot) {
                errors.push((
                    Some(item.slot),
                    format!("slot {} is in the queue twice", item.slot),
                ));
            }
        }

        let expected_slots = self.max_buffer_count_locked();
        if allocated_slots != expected_slots {
            errors.push((
                None,
                format!(
                    "{} slots are usable but there should be {}",
                    allocated_slots, expected_slots
                ),
            ));
        }

        let (dequeued, acquired) = self.active_counts();
        if dequeued > self.max_dequeued_buffer_count {
            errors.push((
                None,
                format!(
                    "{} slots are dequeued, limit is {}",
                    dequeued, self.max_dequeued_buffer_count
                ),
            ));
        }
        if acquired > self.max_acquired_buffer_count {
            errors.push((
                None,
                format!(
                    "{} slots are acquired, limit is {}",
                    acquired, self.max_acquired_buffer_count
                ),
            ));
        }

        if errors.is_empty() {
            return;
        }

        for (_, error) in &errors {
            bq_error!(self, "validate_consistency: {}", error);
        }
        if cfg!(debug_assertions) {
            panic!(
                "[{}] inconsistent queue state: {}",
                self.consumer_name,
                errors
                    .iter()
                    .map(|(_, e)| e.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            );
        }

        for slot in errors.into_iter().filter_map(|(slot, _)| slot) {
            self.repair_slot(slot);
        }
    }

    /// Resets `slot` to a free state, dropping its buffer and any frame it had
    /// in the queue.
    fn repair_slot(&mut self, slot: usize) {
        bq_warn!(self, "repair_slot: resetting slot {}", slot);
        let was_unused = self.unused_slots.contains(&slot);

        self.free_slots.remove(&slot);
        self.free_buffers.retain(|&s| s != slot);
        self.unused_slots.retain(|&s| s != slot);
        self.active_buffers.remove(&slot);
        self.queue.retain(|item| item.slot != slot);
        if self.shared_buffer_slot == Some(slot) {
            self.shared_buffer_slot = None;
        }

        self.slots[slot].clear();
        if was_unused {
            self.unused_slots.push_back(slot);
        } else {
            self.free_slots.insert(slot);
        }
    }

    /// Returns a human-readable description of the state.
    pub fn dump(&self, prefix: &str) -> String {
        let mut out = String::new();
        let (dequeued, acquired) = self.active_counts();

        let _ = writeln!(
            out,
            "{}[{}] max_acquired={} ({} acquired) max_dequeued={} ({} dequeued) \
             max_buffer_count={} default={}x{} {} frame_counter={}{}",
            prefix,
            self.consumer_name,
            self.max_acquired_buffer_count,
            acquired,
            self.max_dequeued_buffer_count,
            dequeued,
            self.max_buffer_count,
            self.default_width,
            self.default_height,
            self.default_buffer_format,
            self.frame_counter,
            if self.is_abandoned { " ABANDONED" } else { "" },
        );

        let _ = writeln!(out, "{}  FIFO({}):", prefix, self.queue.len());
        for item in &self.queue {
            let _ = writeln!(
                out,
                "{}    {:02}: frame={} crop={} transform={:#x} scaling={:?} timestamp={}{}",
                prefix,
                item.slot,
                item.frame_number,
                item.crop,
                item.transform.bits(),
                item.scaling_mode,
                item.timestamp,
                if item.is_auto_timestamp { " (auto)" } else { "" },
            );
        }

        let _ = writeln!(out, "{}  Slots:", prefix);
        for &slot in &self.active_buffers {
            let s = &self.slots[slot];
            let marker = if self.last_queued_slot == Some(slot) { ">" } else { " " };
            let _ = write!(
                out,
                "{}   {}{:02}: state={} frame={}",
                prefix,
                marker,
                slot,
                s.state.state(),
                s.frame_number
            );
            if let Some(buffer) = &s.buffer {
                let _ = write!(
                    out,
                    " buffer={} {}x{} stride={} {}",
                    buffer.id(),
                    buffer.width(),
                    buffer.height(),
                    buffer.stride(),
                    buffer.format()
                );
            }
            let _ = writeln!(out);
        }
        for &slot in &self.free_buffers {
            if let Some(buffer) = &self.slots[slot].buffer {
                let _ = writeln!(
                    out,
                    "{}    {:02}: state=FREE buffer={} {}x{} {}",
                    prefix,
                    slot,
                    buffer.id(),
                    buffer.width(),
                    buffer.height(),
                    buffer.format()
                );
            }
        }

        let _ = writeln!(
            out,
            "{}  free_slots={:?} unused_slots={}",
            prefix,
            self.free_slots,
            self.unused_slots.len()
        );

        out
    }
}

/// Waits on `fence` for at most [`FENCE_WAIT_TIMEOUT`]. Failures are logged
/// and otherwise ignored.
pub(crate) fn wait_fence(consumer_name: &str, fence: &Fence, what: &str) {
    match fence.wait(FENCE_WAIT_TIMEOUT) {
        Ok(()) => (),
        Err(FenceError::TimedOut) => {
            log::warn!("[{}] {}: timed out waiting on fence", consumer_name, what)
        }
        Err(e) => log::warn!(
            "[{}] {}: error while waiting on fence: {}",
            consumer_name,
            what,
            e
        ),
    }
}

/// The lock-protected state of a queue along with its condition variables.
pub(crate) struct BufferQueueCore {
    state: Mutex<CoreState>,
    /// Signaled whenever a slot may have become available to dequeue.
    pub dequeue_cond: Condvar,
    /// Signaled when an allocation done without the lock completes.
    alloc_cond: Condvar,
    pub allocator: Arc<dyn GraphicBufferAllocator>,
}

impl BufferQueueCore {
    pub fn new(
        allocator: Arc<dyn GraphicBufferAllocator>,
        name: String,
        config: &BufferQueueConfig,
    ) -> Self {
        BufferQueueCore {
            state: Mutex::new(CoreState::new(name, config)),
            dequeue_cond: Condvar::new(),
            alloc_cond: Condvar::new(),
            allocator,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap()
    }

    /// Waits until no buffer is being allocated without the lock held.
    pub fn wait_while_allocating<'a>(
        &self,
        guard: MutexGuard<'a, CoreState>,
    ) -> MutexGuard<'a, CoreState> {
        self.alloc_cond
            .wait_while(guard, |state| state.is_allocating)
            .unwrap()
    }

    /// Marks the end of an allocation started with `is_allocating`.
    pub fn allocation_done(&self, state: &mut CoreState) {
        state.is_allocating = false;
        self.alloc_cond.notify_all();
    }
}
