//! Per-slot bookkeeping of the queue.
use std::fmt;
use std::sync::Arc;

use crate::fence::Fence;
use crate::graphic_buffer::GraphicBuffer;

/// Externally visible state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Owned by the queue, available for dequeue.
    Free,
    /// Owned by the producer.
    Dequeued,
    /// Waiting in the queue for the consumer to acquire it.
    Queued,
    /// Owned by the consumer.
    Acquired,
    /// Pinned in shared buffer mode. It may be dequeued, queued and acquired at
    /// the same time.
    Shared,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotState::Free => "FREE",
            SlotState::Dequeued => "DEQUEUED",
            SlotState::Queued => "QUEUED",
            SlotState::Acquired => "ACQUIRED",
            SlotState::Shared => "SHARED",
        };
        f.write_str(s)
    }
}

/// Ownership counts of a slot.
///
/// Outside of shared buffer mode a slot is owned by at most one party at a
/// time and the counts never exceed 1. The shared slot however can be dequeued
/// several times by the producer and acquired several times by the consumer
/// while a frame is waiting in the queue, which is why ownership is tracked
/// with counts rather than a single state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferState {
    dequeue_count: u32,
    queued: bool,
    acquire_count: u32,
    pub(crate) shared: bool,
}

impl BufferState {
    pub fn is_free(&self) -> bool {
        !self.is_acquired() && !self.is_dequeued() && !self.is_queued()
    }

    pub fn is_dequeued(&self) -> bool {
        self.dequeue_count > 0
    }

    pub fn is_queued(&self) -> bool {
        self.queued
    }

    pub fn is_acquired(&self) -> bool {
        self.acquire_count > 0
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn state(&self) -> SlotState {
        if self.shared {
            SlotState::Shared
        } else if self.is_acquired() {
            SlotState::Acquired
        } else if self.is_dequeued() {
            SlotState::Dequeued
        } else if self.is_queued() {
            SlotState::Queued
        } else {
            SlotState::Free
        }
    }

    fn take(&mut self) {
        if self.shared {
            self.dequeue_count += 1;
        } else {
            self.dequeue_count = 1;
        }
    }

    pub fn dequeue(&mut self) {
        self.take();
    }

    pub fn attach_producer(&mut self) {
        self.take();
    }

    pub fn detach_producer(&mut self) {
        self.dequeue_count = self.dequeue_count.saturating_sub(1);
    }

    pub fn queue(&mut self) {
        self.dequeue_count = self.dequeue_count.saturating_sub(1);
        self.queued = true;
    }

    pub fn cancel(&mut self) {
        self.dequeue_count = self.dequeue_count.saturating_sub(1);
    }

    /// Drops the queued frame of this slot without it being acquired.
    pub fn free_queued(&mut self) {
        self.queued = false;
    }

    fn grab(&mut self) {
        if self.shared {
            self.acquire_count += 1;
        } else {
            self.acquire_count = 1;
        }
    }

    pub fn acquire(&mut self) {
        self.grab();
        self.queued = false;
    }

    /// Acquires the shared slot again without a frame being queued.
    pub fn acquire_not_in_queue(&mut self) {
        self.grab();
    }

    pub fn attach_consumer(&mut self) {
        self.grab();
    }

    pub fn release(&mut self) {
        self.acquire_count = self.acquire_count.saturating_sub(1);
    }

    pub fn detach_consumer(&mut self) {
        self.acquire_count = self.acquire_count.saturating_sub(1);
    }

    /// Forgets everything the producer did to this slot, leaving only the
    /// consumer's ownership.
    pub(crate) fn drop_producer_ownership(&mut self) {
        self.dequeue_count = 0;
        self.queued = false;
    }
}

/// A cell of the queue's slot table.
#[derive(Debug, Default)]
pub(crate) struct Slot {
    pub buffer: Option<Arc<GraphicBuffer>>,
    pub state: BufferState,
    /// The producer has not seen `buffer` yet and must request it before
    /// queueing.
    pub request_needed: bool,
    /// Number of the last frame queued into this slot.
    pub frame_number: u64,
    /// Fence to wait on before the next user can access the buffer.
    pub fence: Fence,
    /// The consumer has already received `buffer` through an acquire.
    pub acquire_called: bool,
    pub attached_by_producer: bool,
}

impl Slot {
    /// Resets the slot to its initial state, dropping its buffer.
    pub fn clear(&mut self) {
        *self = Default::default();
    }
}
