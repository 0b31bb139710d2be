//! A multi-slot queue brokering graphics buffers between a producer and a
//! consumer.
//!
//! The queue owns a fixed table of [`NUM_BUFFER_SLOTS`] slots, each of which
//! can hold a [`GraphicBuffer`](crate::graphic_buffer::GraphicBuffer). Buffers
//! cycle between both sides of the queue:
//!
//! * The producer dequeues a free slot, renders into its buffer, and queues it
//!   along with a fence that signals when rendering is complete.
//! * The consumer is notified, acquires the oldest queued frame, waits on its
//!   fence before reading the buffer, and releases it with a fence of its own.
//! * The producer is notified and can dequeue the slot again, waiting on the
//!   consumer's fence before writing into the buffer.
//!
//! Buffers are allocated lazily when a dequeued slot has no buffer matching
//! the requested attributes, and are otherwise reused.
//!
//! [`BufferQueue::new`] creates a queue and returns its two sides, the
//! [`BufferQueueProducer`] and the [`BufferQueueConsumer`], which can be moved
//! to different threads. All the state is protected by a single lock, and no
//! listener is ever called with that lock held.

/// Logging macros that prefix their message with the consumer name of the
/// queue whose state is passed as first argument.
macro_rules! bq_log {
    ($level: ident, $core: expr, $($arg: tt)+) => {
        log::$level!("[{}] {}", $core.consumer_name, format_args!($($arg)+))
    };
}

macro_rules! bq_error {
    ($core: expr, $($arg: tt)+) => { bq_log!(error, $core, $($arg)+) };
}

macro_rules! bq_warn {
    ($core: expr, $($arg: tt)+) => { bq_log!(warn, $core, $($arg)+) };
}

macro_rules! bq_debug {
    ($core: expr, $($arg: tt)+) => { bq_log!(debug, $core, $($arg)+) };
}

macro_rules! bq_trace {
    ($core: expr, $($arg: tt)+) => { bq_log!(trace, $core, $($arg)+) };
}

mod buffer_core;
pub mod consumer;
pub mod item;
pub mod listener;
pub mod producer;
mod slot;

#[cfg(test)]
mod tests;

pub use consumer::BufferQueueConsumer;
pub use item::{BufferItem, QueueBufferInput, QueueBufferOutput};
pub use listener::{ConsumerListener, ProducerListener};
pub use producer::{BufferQueueProducer, DequeuedBuffer};
pub use slot::SlotState;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use enumn::N;

use self::buffer_core::BufferQueueCore;
use crate::memory::GraphicBufferAllocator;
use crate::{Dataspace, Error, PixelFormat, Result, Usage};

/// Number of slots of a queue.
pub const NUM_BUFFER_SLOTS: usize = 32;

/// Maximum number of buffers the consumer can acquire at the same time. Two
/// slots are kept out of its reach so the producer can always make progress.
pub const MAX_MAX_ACQUIRED_BUFFERS: usize = NUM_BUFFER_SLOTS - 2;

bitflags! {
    /// Returned by a successful dequeue.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct DequeueFlags: u32 {
        /// The slot's buffer is unknown to the producer, which must request it
        /// before queueing.
        const BUFFER_NEEDS_REALLOCATION = 0x1;
        /// All buffers have been freed since the last dequeue, and the
        /// producer must drop every buffer reference it caches.
        const RELEASE_ALL_BUFFERS = 0x2;
    }
}

/// Values the producer can query with
/// [`BufferQueueProducer::query`].
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, N)]
pub enum NativeWindowQuery {
    Width = 0,
    Height = 1,
    Format = 2,
    MinUndequeuedBuffers = 3,
    DefaultWidth = 6,
    DefaultHeight = 7,
    TransformHint = 8,
    ConsumerRunningBehind = 9,
    ConsumerUsageBits = 10,
    StickyTransform = 11,
    DefaultDataspace = 12,
    BufferAge = 13,
}

impl TryFrom<u32> for NativeWindowQuery {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Self::n(value).ok_or(Error::BadValue)
    }
}

/// Initial parameters of a queue.
///
/// # Examples
///
/// ```
/// # use bufferqueue::queue::BufferQueueConfig;
/// # use bufferqueue::PixelFormat;
/// let config = BufferQueueConfig::new()
///     .consumer_name("preview")
///     .default_size(640, 480)
///     .default_format(PixelFormat::RGBX_8888)
///     .max_acquired_buffers(2);
/// ```
#[derive(Debug, Clone)]
pub struct BufferQueueConfig {
    pub(crate) consumer_name: Option<String>,
    pub(crate) max_acquired_buffers: usize,
    pub(crate) max_dequeued_buffers: usize,
    pub(crate) max_buffer_count: usize,
    pub(crate) default_width: u32,
    pub(crate) default_height: u32,
    pub(crate) default_format: PixelFormat,
    pub(crate) default_dataspace: Dataspace,
    pub(crate) consumer_usage: Usage,
    pub(crate) allow_allocation: bool,
    pub(crate) dequeue_timeout: Option<Duration>,
    pub(crate) generation_number: u32,
    pub(crate) present_time_offset: i64,
}

impl Default for BufferQueueConfig {
    fn default() -> Self {
        BufferQueueConfig {
            consumer_name: None,
            max_acquired_buffers: 1,
            max_dequeued_buffers: 1,
            max_buffer_count: NUM_BUFFER_SLOTS,
            default_width: 1,
            default_height: 1,
            default_format: PixelFormat::RGBA_8888,
            default_dataspace: Dataspace::UNKNOWN,
            consumer_usage: Usage::empty(),
            allow_allocation: true,
            dequeue_timeout: None,
            generation_number: 0,
            present_time_offset: 0,
        }
    }
}

impl BufferQueueConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// Name of the queue, used to prefix its log messages.
    pub fn consumer_name(mut self, name: &str) -> Self {
        self.consumer_name = Some(name.to_owned());
        self
    }

    pub fn max_acquired_buffers(mut self, count: usize) -> Self {
        self.max_acquired_buffers = count;
        self
    }

    pub fn max_dequeued_buffers(mut self, count: usize) -> Self {
        self.max_dequeued_buffers = count;
        self
    }

    pub fn max_buffer_count(mut self, count: usize) -> Self {
        self.max_buffer_count = count;
        self
    }

    /// Size of the buffers dequeued with a width and height of 0.
    pub fn default_size(mut self, width: u32, height: u32) -> Self {
        self.default_width = width;
        self.default_height = height;
        self
    }

    pub fn default_format(mut self, format: PixelFormat) -> Self {
        self.default_format = format;
        self
    }

    pub fn default_dataspace(mut self, dataspace: Dataspace) -> Self {
        self.default_dataspace = dataspace;
        self
    }

    /// Usage bits added to every allocation.
    pub fn consumer_usage(mut self, usage: Usage) -> Self {
        self.consumer_usage = usage;
        self
    }

    pub fn allow_allocation(mut self, allow: bool) -> Self {
        self.allow_allocation = allow;
        self
    }

    pub fn dequeue_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn generation_number(mut self, generation_number: u32) -> Self {
        self.generation_number = generation_number;
        self
    }

    /// Nanoseconds between the time a frame is acquired and the time it is
    /// actually presented.
    pub fn present_time_offset(mut self, offset: i64) -> Self {
        self.present_time_offset = offset;
        self
    }

    fn validate(&self) -> Result<()> {
        let max_acquired = self.max_acquired_buffers;
        let max_dequeued = self.max_dequeued_buffers;

        if !(1..=MAX_MAX_ACQUIRED_BUFFERS).contains(&max_acquired)
            || max_dequeued < 1
            || !(1..=NUM_BUFFER_SLOTS).contains(&self.max_buffer_count)
            || max_acquired + max_dequeued > self.max_buffer_count
            || self.default_width == 0
            || self.default_height == 0
        {
            return Err(Error::BadValue);
        }

        Ok(())
    }
}

/// Returns a default name for a queue, unique within the process.
fn default_consumer_name() -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "unnamed-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Entry point to create queues.
pub struct BufferQueue;

impl BufferQueue {
    /// Creates a queue with the default configuration, allocating its buffers
    /// using `allocator`, and returns both of its sides.
    pub fn new(
        allocator: Arc<dyn GraphicBufferAllocator>,
    ) -> (BufferQueueProducer, BufferQueueConsumer) {
        Self::build(allocator, BufferQueueConfig::default())
    }

    /// Creates a queue using `config`. Fails with `BadValue` if the limits of
    /// `config` are inconsistent.
    pub fn with_config(
        allocator: Arc<dyn GraphicBufferAllocator>,
        config: BufferQueueConfig,
    ) -> Result<(BufferQueueProducer, BufferQueueConsumer)> {
        config.validate()?;
        Ok(Self::build(allocator, config))
    }

    fn build(
        allocator: Arc<dyn GraphicBufferAllocator>,
        config: BufferQueueConfig,
    ) -> (BufferQueueProducer, BufferQueueConsumer) {
        let name = config
            .consumer_name
            .clone()
            .unwrap_or_else(default_consumer_name);
        let core = Arc::new(BufferQueueCore::new(allocator, name, &config));

        (
            BufferQueueProducer::new(Arc::clone(&core)),
            BufferQueueConsumer::new(core),
        )
    }
}
