use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::buffer_core::BufferQueueCore;
use super::*;
use crate::fence::Fence;
use crate::graphic_buffer::GraphicBuffer;
use crate::memory::{AllocatedBuffer, AllocationError, GraphicBufferAllocator, MemfdAllocator};
use crate::{Dataspace, PixelFormat, ProducerApi, Rect, Transform, Usage};

const PIXEL: u32 = 0x12345678;
const USAGE: Usage = Usage::CPU_WRITE_OFTEN;

#[derive(Default)]
struct TestConsumerListener {
    available: AtomicUsize,
    replaced: AtomicUsize,
    buffers_released: AtomicUsize,
    disconnected: AtomicBool,
}

impl ConsumerListener for TestConsumerListener {
    fn on_frame_available(&self, _item: &BufferItem) {
        self.available.fetch_add(1, Ordering::SeqCst);
    }

    fn on_frame_replaced(&self, _item: &BufferItem) {
        self.replaced.fetch_add(1, Ordering::SeqCst);
    }

    fn on_buffers_released(&self) {
        self.buffers_released.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct TestProducerListener {
    released: AtomicUsize,
}

impl ProducerListener for TestProducerListener {
    fn on_buffer_released(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Memfd allocator that can be told to fail.
#[derive(Default)]
struct FailingAllocator {
    inner: MemfdAllocator,
    fail: AtomicBool,
    attempts: AtomicUsize,
}

impl GraphicBufferAllocator for FailingAllocator {
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: Usage,
    ) -> std::result::Result<AllocatedBuffer, AllocationError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AllocationError::TooLarge(width, height));
        }
        self.inner.allocate(width, height, format, usage)
    }
}

struct TestQueue {
    core: Arc<BufferQueueCore>,
    producer: BufferQueueProducer,
    consumer: BufferQueueConsumer,
    consumer_listener: Arc<TestConsumerListener>,
    producer_listener: Arc<TestProducerListener>,
}

impl TestQueue {
    /// Creates a queue with a connected consumer.
    fn new(config: BufferQueueConfig) -> Self {
        Self::with_allocator(Arc::new(MemfdAllocator::new()), config)
    }

    fn with_allocator(
        allocator: Arc<dyn GraphicBufferAllocator>,
        config: BufferQueueConfig,
    ) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        config.validate().unwrap();
        let name = config
            .consumer_name
            .clone()
            .unwrap_or_else(default_consumer_name);
        let core = Arc::new(BufferQueueCore::new(allocator, name, &config));
        let producer = BufferQueueProducer::new(Arc::clone(&core));
        let consumer = BufferQueueConsumer::new(Arc::clone(&core));
        let consumer_listener = Arc::new(TestConsumerListener::default());
        consumer.consumer_connect(&consumer_listener, false).unwrap();

        TestQueue {
            core,
            producer,
            consumer,
            consumer_listener,
            producer_listener: Default::default(),
        }
    }

    /// Creates a queue with both sides connected.
    fn connected(config: BufferQueueConfig) -> Self {
        let queue = Self::new(config);
        queue.connect(ProducerApi::Cpu, false).unwrap();
        queue
    }

    fn connect(&self, api: ProducerApi, controlled_by_app: bool) -> Result<QueueBufferOutput> {
        let listener: Arc<dyn ProducerListener> = self.producer_listener.clone();
        self.producer.connect(api, controlled_by_app, Some(listener))
    }

    fn dequeue(&self) -> Result<DequeuedBuffer> {
        self.producer
            .dequeue_buffer(0, 0, PixelFormat::default(), USAGE, false)
    }

    /// Dequeues a slot and requests its buffer if needed.
    fn dequeue_and_request(&self) -> (usize, Option<Arc<GraphicBuffer>>) {
        let dequeued = self.dequeue().unwrap();
        let buffer = if dequeued
            .flags
            .contains(DequeueFlags::BUFFER_NEEDS_REALLOCATION)
        {
            Some(self.producer.request_buffer(dequeued.slot).unwrap())
        } else {
            None
        };
        (dequeued.slot, buffer)
    }

    fn queue(&self, slot: usize) -> QueueBufferOutput {
        self.producer
            .queue_buffer(slot, QueueBufferInput::new(Fence::NO_FENCE))
            .unwrap()
    }

    fn queue_at(&self, slot: usize, timestamp: i64) -> QueueBufferOutput {
        let input = QueueBufferInput {
            timestamp,
            is_auto_timestamp: false,
            ..QueueBufferInput::new(Fence::NO_FENCE)
        };
        self.producer.queue_buffer(slot, input).unwrap()
    }

    /// Dequeues and queues a new frame, returning its slot.
    fn produce(&self) -> usize {
        let (slot, _) = self.dequeue_and_request();
        self.queue(slot);
        slot
    }

    fn acquire(&self) -> Result<BufferItem> {
        self.consumer.acquire_buffer(0, 0)
    }

    fn release(&self, item: &BufferItem) -> Result<()> {
        self.consumer
            .release_buffer(item.slot, item.frame_number, Fence::NO_FENCE)
    }
}

fn write_pixel(buffer: &GraphicBuffer, value: u32) {
    let mut mapping = buffer.map().unwrap();
    mapping[0..4].copy_from_slice(&value.to_ne_bytes());
}

fn read_pixel(buffer: &GraphicBuffer) -> u32 {
    let mapping = buffer.map().unwrap();
    u32::from_ne_bytes([mapping[0], mapping[1], mapping[2], mapping[3]])
}

#[test]
fn test_single_round_trip() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    let dequeued = q.dequeue().unwrap();
    assert_eq!(dequeued.flags, DequeueFlags::BUFFER_NEEDS_REALLOCATION);
    assert!(dequeued.fence.is_no_fence());
    let slot = dequeued.slot;

    let buffer = q.producer.request_buffer(slot).unwrap();
    write_pixel(&buffer, PIXEL);

    let input = QueueBufferInput {
        crop: Rect::new(0, 0, 1, 1),
        ..QueueBufferInput::new(Fence::NO_FENCE)
    };
    let output = q.producer.queue_buffer(slot, input).unwrap();
    assert_eq!(output.num_pending_buffers, 1);
    assert_eq!(q.consumer_listener.available.load(Ordering::SeqCst), 1);

    let item = q.acquire().unwrap();
    assert_eq!(item.slot, slot);
    assert_eq!(item.frame_number, 1);
    assert_eq!(item.crop, Rect::new(0, 0, 1, 1));
    let acquired_buffer = item.graphic_buffer.clone().unwrap();
    assert_eq!(read_pixel(&acquired_buffer), PIXEL);

    q.release(&item).unwrap();
    assert_eq!(q.producer_listener.released.load(Ordering::SeqCst), 1);

    let dequeued = q.dequeue().unwrap();
    assert_eq!(dequeued.slot, slot);
    assert_eq!(dequeued.flags, DequeueFlags::empty());
    assert_eq!(dequeued.buffer_age, 1);
}

#[test]
fn test_async_drop() {
    let q = TestQueue::new(BufferQueueConfig::new());
    q.producer.set_max_dequeued_buffer_count(2).unwrap();
    q.producer.set_async_mode(true).unwrap();
    q.connect(ProducerApi::Cpu, false).unwrap();

    let slot_a = q.produce();
    let slot_b = q.produce();
    assert_ne!(slot_a, slot_b);
    assert_eq!(q.consumer_listener.available.load(Ordering::SeqCst), 1);
    assert_eq!(q.consumer_listener.replaced.load(Ordering::SeqCst), 1);

    let item = q.acquire().unwrap();
    assert_eq!(item.slot, slot_b);
    assert_eq!(item.frame_number, 2);
    assert!(item.is_droppable);
    assert_eq!(q.acquire().unwrap_err(), Error::InvalidOperation);

    // The dropped slot kept its buffer and can be reused as is.
    let dequeued = q.dequeue().unwrap();
    assert_eq!(dequeued.slot, slot_a);
    assert_eq!(dequeued.flags, DequeueFlags::empty());
}

#[test]
fn test_disallow_allocation() {
    let q = TestQueue::connected(BufferQueueConfig::new());
    q.consumer.set_default_buffer_size(320, 240).unwrap();
    q.producer.allow_allocation(false).unwrap();

    assert_eq!(q.dequeue().unwrap_err(), Error::WouldBlock);

    q.producer.allow_allocation(true).unwrap();
    let dequeued = q.dequeue().unwrap();
    assert!(dequeued
        .flags
        .contains(DequeueFlags::BUFFER_NEEDS_REALLOCATION));
    q.producer
        .cancel_buffer(dequeued.slot, Fence::NO_FENCE)
        .unwrap();

    q.producer.allow_allocation(false).unwrap();
    assert_eq!(
        q.producer
            .dequeue_buffer(640, 480, PixelFormat::default(), USAGE, false)
            .unwrap_err(),
        Error::WouldBlock
    );

    // A buffer of the default size is still available.
    assert_eq!(q.dequeue().unwrap().slot, dequeued.slot);
    assert_eq!(
        q.producer
            .allocate_buffers(0, 0, PixelFormat::default(), USAGE)
            .unwrap_err(),
        Error::InvalidOperation
    );
}

#[test]
fn test_generation_numbers() {
    let q = TestQueue::connected(BufferQueueConfig::new());
    q.producer.set_generation_number(1).unwrap();

    let (slot, buffer) = q.dequeue_and_request();
    let buffer = buffer.unwrap();
    assert_eq!(buffer.generation_number(), 1);
    let detached = q.producer.detach_buffer(slot).unwrap();
    assert_eq!(detached.id(), buffer.id());

    q.producer.set_generation_number(2).unwrap();
    assert_eq!(
        q.producer.attach_buffer(Arc::clone(&buffer)).unwrap_err(),
        Error::BadValue
    );

    buffer.set_generation_number(2);
    let slot = q.producer.attach_buffer(buffer).unwrap();
    // Attached buffers can be queued without being requested.
    q.queue(slot);
    let item = q.acquire().unwrap();
    assert_eq!(item.slot, slot);
    assert_eq!(item.graphic_buffer.unwrap().generation_number(), 2);
}

#[test]
fn test_detach_and_reattach_across_sides() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    let (slot, buffer) = q.dequeue_and_request();
    write_pixel(&buffer.unwrap(), PIXEL);
    q.queue(slot);

    let item = q.acquire().unwrap();
    let detached = q.consumer.detach_buffer(item.slot).unwrap();
    assert_eq!(
        q.consumer.release_buffer(item.slot, item.frame_number, Fence::NO_FENCE),
        Err(Error::StaleBufferSlot)
    );

    let slot = q.producer.attach_buffer(detached).unwrap();
    q.queue(slot);

    let item = q.acquire().unwrap();
    assert_eq!(item.slot, slot);
    assert_eq!(read_pixel(&item.graphic_buffer.unwrap()), PIXEL);
}

#[test]
fn test_producer_attach_without_free_slot() {
    let q = TestQueue::connected(
        BufferQueueConfig::new()
            .max_dequeued_buffers(2)
            .max_buffer_count(3),
    );
    let spare = Arc::new(
        GraphicBuffer::allocate(
            &MemfdAllocator::new(),
            1,
            1,
            PixelFormat::default(),
            USAGE,
            0,
        )
        .unwrap(),
    );

    q.produce();
    q.produce();
    let (held, _) = q.dequeue_and_request();

    // Every slot is in use. Attach fails instead of waiting for a release.
    let start = Instant::now();
    assert_eq!(
        q.producer.attach_buffer(Arc::clone(&spare)).unwrap_err(),
        Error::NoMemory
    );
    assert!(start.elapsed() < Duration::from_secs(1));

    let item = q.acquire().unwrap();
    q.release(&item).unwrap();
    let slot = q.producer.attach_buffer(spare).unwrap();
    assert_eq!(slot, item.slot);

    // Two slots are now dequeued.
    assert_eq!(
        q.producer
            .attach_buffer(Arc::new(
                GraphicBuffer::allocate(
                    &MemfdAllocator::new(),
                    1,
                    1,
                    PixelFormat::default(),
                    USAGE,
                    0,
                )
                .unwrap(),
            ))
            .unwrap_err(),
        Error::Busy
    );
    q.queue(held);
    q.queue(slot);
}

#[test]
fn test_max_acquired_enforcement() {
    let q = TestQueue::new(BufferQueueConfig::new());
    q.consumer.set_max_acquired_buffer_count(2).unwrap();
    q.connect(ProducerApi::Cpu, false).unwrap();

    for _ in 0..3 {
        q.produce();
    }

    let first = q.acquire().unwrap();
    q.acquire().unwrap();
    assert_eq!(q.acquire().unwrap_err(), Error::InvalidOperation);
    assert_eq!(q.acquire().unwrap_err(), Error::InvalidOperation);

    q.release(&first).unwrap();
    assert_eq!(q.acquire().unwrap().frame_number, 3);
}

#[test]
fn test_frame_numbers_increase() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    let mut last = 0;
    for _ in 0..5 {
        q.produce();
        let item = q.acquire().unwrap();
        assert!(item.frame_number > last);
        last = item.frame_number;
        q.release(&item).unwrap();
    }
}

#[test]
fn test_matched_reuse_does_not_allocate() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    let (slot, buffer) = q.dequeue_and_request();
    let buffer = buffer.unwrap();
    q.producer.cancel_buffer(slot, Fence::NO_FENCE).unwrap();

    let dequeued = q.dequeue().unwrap();
    assert_eq!(dequeued.slot, slot);
    assert_eq!(dequeued.flags, DequeueFlags::empty());
    q.queue(slot);
    let item = q.acquire().unwrap();
    assert_eq!(item.graphic_buffer.unwrap().id(), buffer.id());
}

#[test]
fn test_reallocation_on_new_size() {
    let q = TestQueue::connected(BufferQueueConfig::new().default_size(64, 32));

    let (slot, buffer) = q.dequeue_and_request();
    let buffer = buffer.unwrap();
    assert_eq!((buffer.width(), buffer.height()), (64, 32));
    q.producer.cancel_buffer(slot, Fence::NO_FENCE).unwrap();

    let dequeued = q
        .producer
        .dequeue_buffer(128, 128, PixelFormat::default(), USAGE, false)
        .unwrap();
    assert!(dequeued
        .flags
        .contains(DequeueFlags::BUFFER_NEEDS_REALLOCATION));
    assert_eq!(dequeued.buffer_age, 0);
    let buffer = q.producer.request_buffer(dequeued.slot).unwrap();
    assert_eq!((buffer.width(), buffer.height()), (128, 128));
}

#[test]
fn test_default_size() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    assert_eq!(
        q.consumer.set_default_buffer_size(0, 10),
        Err(Error::BadValue)
    );
    q.consumer.set_default_buffer_size(48, 16).unwrap();
    q.consumer.set_default_buffer_size(48, 16).unwrap();
    assert_eq!(q.producer.query(NativeWindowQuery::DefaultWidth), Ok(48));
    assert_eq!(q.producer.query(NativeWindowQuery::DefaultHeight), Ok(16));

    let (_, buffer) = q.dequeue_and_request();
    let buffer = buffer.unwrap();
    assert_eq!((buffer.width(), buffer.height()), (48, 16));
    assert_eq!(buffer.format(), PixelFormat::RGBA_8888);

    assert_eq!(
        q.producer
            .dequeue_buffer(0, 16, PixelFormat::default(), USAGE, false)
            .unwrap_err(),
        Error::BadValue
    );
}

#[test]
fn test_acquire_empty_queue() {
    let q = TestQueue::connected(BufferQueueConfig::new());
    assert_eq!(q.acquire().unwrap_err(), Error::NoBufferAvailable);
}

#[test]
fn test_stale_release() {
    let q = TestQueue::connected(BufferQueueConfig::new());
    q.produce();
    let item = q.acquire().unwrap();

    assert_eq!(
        q.consumer
            .release_buffer(item.slot, item.frame_number + 1, Fence::NO_FENCE),
        Err(Error::StaleBufferSlot)
    );
    // The slot is still acquired.
    q.release(&item).unwrap();
    assert_eq!(q.release(&item), Err(Error::BadValue));
}

#[test]
fn test_invalid_queue_calls() {
    let q = TestQueue::connected(BufferQueueConfig::new().default_size(4, 4));

    let dequeued = q.dequeue().unwrap();
    let slot = dequeued.slot;
    assert_eq!(
        q.producer
            .queue_buffer(slot, QueueBufferInput::new(Fence::NO_FENCE))
            .unwrap_err(),
        Error::BadValue,
        "queueing before requesting the buffer"
    );
    q.producer.request_buffer(slot).unwrap();
    assert_eq!(
        q.producer.request_buffer(slot).unwrap_err(),
        Error::BadValue,
        "requesting twice"
    );

    let input = QueueBufferInput {
        crop: Rect::new(0, 0, 5, 4),
        ..QueueBufferInput::new(Fence::NO_FENCE)
    };
    assert_eq!(q.producer.queue_buffer(slot, input), Err(Error::BadValue));

    let input = QueueBufferInput {
        scaling_mode: 42,
        ..QueueBufferInput::new(Fence::NO_FENCE)
    };
    assert_eq!(q.producer.queue_buffer(slot, input), Err(Error::BadValue));

    assert_eq!(
        q.producer
            .queue_buffer(NUM_BUFFER_SLOTS, QueueBufferInput::new(Fence::NO_FENCE))
            .unwrap_err(),
        Error::BadValue
    );
    assert_eq!(
        q.producer.cancel_buffer(slot + 1, Fence::NO_FENCE),
        Err(Error::BadValue)
    );

    // None of the failures changed the slot.
    q.queue(slot);
}

#[test]
fn test_queue_with_extreme_crop() {
    let q = TestQueue::connected(BufferQueueConfig::new().default_size(4, 4));
    let (slot, _) = q.dequeue_and_request();

    for crop in [
        Rect::new(i32::MAX, 0, i32::MIN, 1),
        Rect::new(i32::MIN, i32::MIN, i32::MAX, i32::MAX),
        Rect::new(0, i32::MIN, 4, 4),
    ] {
        let input = QueueBufferInput {
            crop,
            ..QueueBufferInput::new(Fence::NO_FENCE)
        };
        assert_eq!(
            q.producer.queue_buffer(slot, input),
            Err(Error::BadValue),
            "crop {}",
            crop
        );
    }

    q.queue(slot);
    let item = q.acquire().unwrap();
    assert_eq!(item.slot, slot);
    assert_eq!(item.crop, Rect::EMPTY);
}

#[test]
fn test_queue_attributes() {
    let q = TestQueue::connected(
        BufferQueueConfig::new()
            .default_size(8, 8)
            .default_dataspace(Dataspace(0x10)),
    );

    let (slot, _) = q.dequeue_and_request();
    let input = QueueBufferInput {
        timestamp: 1234,
        is_auto_timestamp: false,
        crop: Rect::new(2, 2, 6, 6),
        transform: Transform::ROT_90 | Transform::INVERSE_DISPLAY,
        sticky_transform: Transform::FLIP_H,
        ..QueueBufferInput::new(Fence::NO_FENCE)
    };
    q.producer.queue_buffer(slot, input).unwrap();
    assert_eq!(
        q.producer.query(NativeWindowQuery::StickyTransform),
        Ok(Transform::FLIP_H.bits() as u64)
    );

    let item = q.acquire().unwrap();
    assert_eq!(item.timestamp, 1234);
    assert!(!item.is_auto_timestamp);
    assert_eq!(item.crop, Rect::new(2, 2, 6, 6));
    assert_eq!(item.transform, Transform::ROT_90);
    assert!(item.transform_to_display_inverse);
    assert_eq!(item.dataspace, Dataspace(0x10));
    assert!(!item.is_droppable);
}

#[test]
fn test_max_dequeued_busy() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    q.dequeue().unwrap();
    assert_eq!(q.dequeue().unwrap_err(), Error::Busy);
    assert_eq!(Error::Busy.status(), -(nix::errno::Errno::EBUSY as i32));
}

#[test]
fn test_set_max_dequeued_buffer_count() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    assert_eq!(
        q.producer.set_max_dequeued_buffer_count(0),
        Err(Error::BadValue)
    );
    q.producer.set_max_dequeued_buffer_count(3).unwrap();
    let slots = (0..3).map(|_| q.dequeue().unwrap().slot).collect::<Vec<_>>();
    assert_eq!(slots, vec![0, 1, 2]);

    // Cannot go below what the producer holds.
    assert_eq!(
        q.producer.set_max_dequeued_buffer_count(2),
        Err(Error::BadValue)
    );
    for slot in slots {
        q.producer.cancel_buffer(slot, Fence::NO_FENCE).unwrap();
    }
    q.producer.set_max_dequeued_buffer_count(1).unwrap();
    assert!(q.consumer_listener.buffers_released.load(Ordering::SeqCst) > 0);

    // Slot count above the configured maximum.
    let q = TestQueue::connected(BufferQueueConfig::new().max_buffer_count(3));
    assert_eq!(
        q.producer.set_max_dequeued_buffer_count(3),
        Err(Error::BadValue)
    );
    q.producer.set_max_dequeued_buffer_count(2).unwrap();
}

#[test]
fn test_blocking_dequeue_woken_by_release() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    q.produce();
    let item = q.acquire().unwrap();
    q.produce();

    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            q.release(&item).unwrap();
        });

        let start = Instant::now();
        let dequeued = q.dequeue().unwrap();
        assert_eq!(dequeued.slot, item.slot);
        assert!(start.elapsed() >= Duration::from_millis(40));
    });
}

#[test]
fn test_blocking_dequeue_woken_by_abandon() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    q.produce();
    q.acquire().unwrap();
    q.produce();

    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            q.consumer.consumer_disconnect().unwrap();
        });

        assert_eq!(q.dequeue().unwrap_err(), Error::NoInit);
    });

    // Every producer operation fails from now on, except disconnect.
    assert_eq!(q.producer.query(NativeWindowQuery::Width), Err(Error::NoInit));
    assert_eq!(q.producer.allow_allocation(true), Err(Error::NoInit));
    q.producer.disconnect(ProducerApi::Cpu).unwrap();
    assert_eq!(q.consumer.consumer_disconnect(), Err(Error::BadValue));
}

#[test]
fn test_dequeue_timeout() {
    let q = TestQueue::connected(BufferQueueConfig::new());
    q.producer
        .set_dequeue_timeout(Some(Duration::from_millis(30)))
        .unwrap();

    q.produce();
    q.acquire().unwrap();
    q.produce();

    let start = Instant::now();
    assert_eq!(q.dequeue().unwrap_err(), Error::TimedOut);
    assert!(start.elapsed() >= Duration::from_millis(25));
}

#[test]
fn test_non_blocking_dequeue() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    q.produce();
    q.acquire().unwrap();
    q.produce();

    assert_eq!(
        q.producer
            .dequeue_buffer(0, 0, PixelFormat::default(), USAGE, true)
            .unwrap_err(),
        Error::WouldBlock
    );
}

#[test]
fn test_controlled_by_app_needs_extra_buffer() {
    let q = TestQueue::new(BufferQueueConfig::new());
    q.connect(ProducerApi::Cpu, true).unwrap();
    assert_eq!(
        q.producer.query(NativeWindowQuery::MinUndequeuedBuffers),
        Ok(2)
    );

    // Frames are droppable, so the producer never waits on the consumer.
    q.produce();
    q.acquire().unwrap();
    for _ in 0..4 {
        q.produce();
    }
    assert_eq!(q.consumer_listener.replaced.load(Ordering::SeqCst), 3);

    q.producer.disconnect(ProducerApi::Cpu).unwrap();
    let q = TestQueue::new(BufferQueueConfig::new().max_buffer_count(2));
    assert_eq!(
        q.connect(ProducerApi::Cpu, true).unwrap_err(),
        Error::BadValue
    );
}

#[test]
fn test_present_later() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    let (slot, _) = q.dequeue_and_request();
    q.queue_at(slot, 1_000_000);

    assert_eq!(
        q.consumer.acquire_buffer(500_000, 0).unwrap_err(),
        Error::PresentLater(1_000_000)
    );

    // The offset delays the presentation time.
    q.consumer.set_present_time_offset(600_000).unwrap();
    let item = q.consumer.acquire_buffer(500_000, 0).unwrap();
    assert_eq!(item.timestamp, 1_000_000);
}

#[test]
fn test_present_drops_superseded_frames() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    let (slot_a, _) = q.dequeue_and_request();
    q.queue_at(slot_a, 1_000);
    let (slot_b, _) = q.dequeue_and_request();
    q.queue_at(slot_b, 2_000);

    let item = q.consumer.acquire_buffer(3_000, 0).unwrap();
    assert_eq!(item.slot, slot_b);
    assert_eq!(item.frame_number, 2);
    assert_eq!(q.producer_listener.released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_max_frame_number() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    q.produce();
    let item = q.acquire().unwrap();
    q.release(&item).unwrap();
    q.produce();

    assert_eq!(
        q.consumer.acquire_buffer(0, 1).unwrap_err(),
        Error::NoBufferAvailable
    );
    assert_eq!(q.consumer.acquire_buffer(0, 2).unwrap().frame_number, 2);
}

#[test]
fn test_connect_rules() {
    let q = TestQueue::new(BufferQueueConfig::new());

    assert_eq!(q.producer.disconnect(ProducerApi::Cpu), Err(Error::NoInit));
    assert_eq!(q.dequeue().unwrap_err(), Error::NoInit);

    let output = q.connect(ProducerApi::Egl, false).unwrap();
    assert_eq!((output.width, output.height), (1, 1));
    assert_eq!(output.num_pending_buffers, 0);
    assert_eq!(
        q.connect(ProducerApi::Cpu, false).unwrap_err(),
        Error::BadValue
    );
    assert_eq!(q.producer.disconnect(ProducerApi::Cpu), Err(Error::BadValue));
    q.producer.disconnect(ProducerApi::Egl).unwrap();
    q.connect(ProducerApi::Cpu, false).unwrap();

    assert_eq!(
        q.consumer
            .consumer_connect(&Arc::new(TestConsumerListener::default()), false),
        Err(Error::AlreadyConnected)
    );

    // A producer needs a consumer.
    let (producer, _consumer) = BufferQueue::new(Arc::new(MemfdAllocator::new()));
    assert_eq!(
        producer.connect(ProducerApi::Cpu, false, None).unwrap_err(),
        Error::NoInit
    );
}

#[test]
fn test_producer_disconnect_keeps_acquired_buffers() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    q.produce();
    let item = q.acquire().unwrap();
    let (slot, _) = q.dequeue_and_request();
    assert_ne!(slot, item.slot);

    q.producer.disconnect(ProducerApi::Cpu).unwrap();
    assert!(q.consumer_listener.disconnected.load(Ordering::SeqCst));
    assert_eq!(q.consumer_listener.buffers_released.load(Ordering::SeqCst), 1);

    // The consumer can still release what it holds.
    q.release(&item).unwrap();

    q.connect(ProducerApi::Cpu, false).unwrap();
    let dequeued = q.dequeue().unwrap();
    assert!(dequeued.flags.contains(
        DequeueFlags::BUFFER_NEEDS_REALLOCATION | DequeueFlags::RELEASE_ALL_BUFFERS
    ));
}

#[test]
fn test_consumer_attach_and_detach() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    let buffer = Arc::new(
        GraphicBuffer::allocate(
            &MemfdAllocator::new(),
            1,
            1,
            PixelFormat::RGBA_8888,
            USAGE,
            0,
        )
        .unwrap(),
    );
    let slot = q.consumer.attach_buffer(Arc::clone(&buffer)).unwrap();
    assert_eq!(
        q.consumer.attach_buffer(Arc::clone(&buffer)).unwrap_err(),
        Error::InvalidOperation
    );

    assert_eq!(
        q.consumer.detach_buffer(slot + 1).unwrap_err(),
        Error::BadValue
    );
    let detached = q.consumer.detach_buffer(slot).unwrap();
    assert_eq!(detached.id(), buffer.id());

    buffer.set_generation_number(7);
    assert_eq!(
        q.consumer.attach_buffer(buffer).unwrap_err(),
        Error::BadValue
    );
}

#[test]
fn test_allocate_buffers() {
    let q = TestQueue::connected(BufferQueueConfig::new().default_size(16, 16));

    q.producer
        .allocate_buffers(0, 0, PixelFormat::default(), USAGE)
        .unwrap();

    // Dequeue reuses the preallocated buffers, which still need a request.
    let dequeued = q.dequeue().unwrap();
    assert_eq!(dequeued.flags, DequeueFlags::BUFFER_NEEDS_REALLOCATION);
    let buffer = q.producer.request_buffer(dequeued.slot).unwrap();
    assert_eq!((buffer.width(), buffer.height()), (16, 16));
}

#[test]
fn test_allocation_failure() {
    let allocator = Arc::new(FailingAllocator::default());
    allocator.fail.store(true, Ordering::SeqCst);
    let q = TestQueue::with_allocator(allocator.clone(), BufferQueueConfig::new());
    q.connect(ProducerApi::Cpu, false).unwrap();
    let free_slots = q.core.lock().free_slots.clone();

    assert_eq!(q.dequeue().unwrap_err(), Error::NoMemory);
    assert_eq!(allocator.attempts.load(Ordering::SeqCst), 1);
    {
        let state = q.core.lock();
        assert!(!state.is_allocating);
        assert_eq!(state.free_slots, free_slots);
        assert!(state.free_buffers.is_empty());
        assert!(state.active_buffers.is_empty());
        assert!(state
            .slots
            .iter()
            .all(|s| s.state.is_free() && s.buffer.is_none()));
    }

    assert_eq!(
        q.producer
            .allocate_buffers(0, 0, PixelFormat::default(), USAGE),
        Err(Error::NoMemory)
    );
    assert_eq!(q.core.lock().free_slots, free_slots);

    // Nothing is left waiting for the failed allocations.
    q.producer.set_async_mode(false).unwrap();
    assert_eq!(
        q.consumer.set_max_buffer_count(8),
        Err(Error::InvalidOperation)
    );

    allocator.fail.store(false, Ordering::SeqCst);
    let (slot, buffer) = q.dequeue_and_request();
    assert_eq!(free_slots.first(), Some(&slot));
    assert!(buffer.is_some());
    q.queue(slot);
    assert_eq!(q.acquire().unwrap().slot, slot);
}

#[test]
fn test_oversized_dequeue() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    assert_eq!(
        q.producer
            .dequeue_buffer(u32::MAX, 1, PixelFormat::default(), USAGE, false)
            .unwrap_err(),
        Error::NoMemory
    );
    assert!(!q.core.lock().is_allocating);

    q.producer.set_async_mode(false).unwrap();
    let slot = q.produce();
    let item = q.acquire().unwrap();
    assert_eq!(item.slot, slot);
}

#[test]
fn test_discard_free_buffers() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    let (slot, _) = q.dequeue_and_request();
    q.producer.cancel_buffer(slot, Fence::NO_FENCE).unwrap();
    q.consumer.discard_free_buffers().unwrap();

    let dequeued = q.dequeue().unwrap();
    assert_eq!(dequeued.slot, slot);
    assert!(dequeued
        .flags
        .contains(DequeueFlags::BUFFER_NEEDS_REALLOCATION));
}

#[test]
fn test_released_buffers_mask() {
    let q = TestQueue::connected(BufferQueueConfig::new());
    assert_eq!(q.consumer.get_released_buffers(), Ok(0xffff_ffff));

    let slot = q.produce();
    let item = q.acquire().unwrap();
    assert!(item.graphic_buffer.is_some());
    assert_eq!(
        q.consumer.get_released_buffers(),
        Ok(0xffff_ffff & !(1 << slot))
    );
    q.release(&item).unwrap();

    // The consumer already knows this buffer.
    q.produce();
    let item = q.acquire().unwrap();
    assert_eq!(item.slot, slot);
    assert!(item.graphic_buffer.is_none());
}

#[test]
fn test_max_buffer_count() {
    let q = TestQueue::new(BufferQueueConfig::new());

    assert_eq!(q.consumer.set_max_buffer_count(0), Err(Error::BadValue));
    assert_eq!(
        q.consumer.set_max_buffer_count(NUM_BUFFER_SLOTS + 1),
        Err(Error::BadValue)
    );
    q.consumer.set_max_acquired_buffer_count(2).unwrap();
    assert_eq!(q.consumer.set_max_buffer_count(2), Err(Error::BadValue));
    q.consumer.set_max_buffer_count(3).unwrap();

    q.connect(ProducerApi::Cpu, false).unwrap();
    assert_eq!(
        q.consumer.set_max_buffer_count(4),
        Err(Error::InvalidOperation)
    );
    assert_eq!(
        q.consumer.set_max_acquired_buffer_count(MAX_MAX_ACQUIRED_BUFFERS + 1),
        Err(Error::BadValue)
    );
}

#[test]
fn test_config_validation() {
    let allocator = Arc::new(MemfdAllocator::new());

    for config in [
        BufferQueueConfig::new().max_acquired_buffers(0),
        BufferQueueConfig::new().max_dequeued_buffers(0),
        BufferQueueConfig::new().max_buffer_count(1),
        BufferQueueConfig::new().default_size(0, 0),
    ] {
        assert!(matches!(
            BufferQueue::with_config(allocator.clone(), config),
            Err(Error::BadValue)
        ));
    }

    let (producer, consumer) =
        BufferQueue::with_config(allocator, BufferQueueConfig::new().consumer_name("named"))
            .unwrap();
    assert_eq!(producer.consumer_name(), "named");
    consumer.set_consumer_name("renamed").unwrap();
    assert_eq!(producer.consumer_name(), "renamed");
    assert!(consumer.dump_state("").starts_with("[renamed]"));
}

#[test]
fn test_query() {
    let q = TestQueue::connected(
        BufferQueueConfig::new()
            .default_size(32, 24)
            .consumer_usage(Usage::GPU_TEXTURE),
    );
    q.consumer.set_transform_hint(Transform::ROT_270).unwrap();

    let p = &q.producer;
    assert_eq!(p.query(NativeWindowQuery::Width), Ok(32));
    assert_eq!(p.query(NativeWindowQuery::Height), Ok(24));
    assert_eq!(
        p.query(NativeWindowQuery::Format),
        Ok(PixelFormat::RGBA_8888.to_u32() as u64)
    );
    assert_eq!(p.query(NativeWindowQuery::MinUndequeuedBuffers), Ok(1));
    assert_eq!(
        p.query(NativeWindowQuery::TransformHint),
        Ok(Transform::ROT_270.bits() as u64)
    );
    assert_eq!(
        p.query(NativeWindowQuery::ConsumerUsageBits),
        Ok(Usage::GPU_TEXTURE.bits())
    );
    assert_eq!(p.query(NativeWindowQuery::ConsumerRunningBehind), Ok(0));
    assert_eq!(
        NativeWindowQuery::try_from(4).unwrap_err(),
        Error::BadValue
    );

    // Consumer usage bits are added to every allocation.
    let (_, buffer) = q.dequeue_and_request();
    assert_eq!(buffer.unwrap().usage(), USAGE | Usage::GPU_TEXTURE);
}

#[test]
fn test_shared_buffer_mode() {
    let q = TestQueue::connected(BufferQueueConfig::new());
    q.producer.set_shared_buffer_mode(true).unwrap();
    q.producer.set_auto_refresh(true).unwrap();

    let (slot, buffer) = q.dequeue_and_request();
    write_pixel(&buffer.unwrap(), PIXEL);
    assert_eq!(
        q.producer.cancel_buffer(slot, Fence::NO_FENCE),
        Err(Error::BadValue)
    );
    q.queue(slot);

    let item = q.acquire().unwrap();
    assert_eq!(item.slot, slot);
    assert!(item.is_droppable);
    q.release(&item).unwrap();

    // Auto-refresh hands the shared buffer out again without a new frame.
    let item = q.acquire().unwrap();
    assert_eq!(item.slot, slot);
    assert_eq!(item.frame_number, 1);
    assert!(item.graphic_buffer.is_none());

    // The producer can dequeue the shared slot while the consumer holds it.
    let dequeued = q.dequeue().unwrap();
    assert_eq!(dequeued.slot, slot);
    q.queue(slot);
    q.release(&item).unwrap();

    let item = q.acquire().unwrap();
    assert_eq!(item.frame_number, 2);
    q.release(&item).unwrap();

    q.producer.set_shared_buffer_mode(false).unwrap();
    let dequeued = q.dequeue().unwrap();
    assert_eq!(dequeued.slot, slot);
    assert_eq!(dequeued.flags, DequeueFlags::empty());
}

#[test]
fn test_egl_producer_waits_on_previous_fence() {
    let q = TestQueue::new(BufferQueueConfig::new());
    q.connect(ProducerApi::Egl, false).unwrap();

    let (fence, signaler) = Fence::new_pending().unwrap();
    let (slot, _) = q.dequeue_and_request();
    let input = QueueBufferInput::new(fence);
    q.producer.queue_buffer(slot, input).unwrap();
    let item = q.acquire().unwrap();
    assert!(!item.fence.is_no_fence());

    let (slot, _) = q.dequeue_and_request();
    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            signaler.signal().unwrap();
        });

        let start = Instant::now();
        q.queue(slot);
        assert!(start.elapsed() >= Duration::from_millis(40));
    });
}

#[test]
fn test_release_fence_guards_next_dequeue() {
    let q = TestQueue::connected(BufferQueueConfig::new());

    q.produce();
    let item = q.acquire().unwrap();
    let (fence, signaler) = Fence::new_pending().unwrap();
    q.consumer
        .release_buffer(item.slot, item.frame_number, fence)
        .unwrap();

    let dequeued = q.dequeue().unwrap();
    assert_eq!(dequeued.slot, item.slot);
    assert_eq!(dequeued.flags, DequeueFlags::empty());
    assert!(matches!(
        dequeued.fence.wait(Duration::from_millis(10)),
        Err(crate::fence::FenceError::TimedOut)
    ));
    signaler.signal().unwrap();
    dequeued.fence.wait(Duration::from_millis(100)).unwrap();
}

#[test]
fn test_concurrent_producer_and_consumer() {
    const FRAMES: u32 = 100;
    let q = TestQueue::new(BufferQueueConfig::new().max_acquired_buffers(2));
    q.producer.set_max_dequeued_buffer_count(2).unwrap();
    q.connect(ProducerApi::Cpu, false).unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            let mut buffers: [Option<Arc<GraphicBuffer>>; NUM_BUFFER_SLOTS] = Default::default();
            for i in 0..FRAMES {
                let (slot, buffer) = q.dequeue_and_request();
                if let Some(buffer) = buffer {
                    buffers[slot] = Some(buffer);
                }
                let buffer = buffers[slot].as_ref().unwrap();
                write_pixel(buffer, i);
                q.queue(slot);
            }
        });

        let mut buffers: [Option<Arc<GraphicBuffer>>; NUM_BUFFER_SLOTS] = Default::default();
        let mut received = 0;
        while received < FRAMES {
            let item = match q.acquire() {
                Ok(item) => item,
                Err(Error::NoBufferAvailable) => {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
                Err(e) => panic!("unexpected error {}", e),
            };
            if let Some(buffer) = &item.graphic_buffer {
                buffers[item.slot] = Some(Arc::clone(buffer));
            }
            let buffer = buffers[item.slot].as_ref().unwrap();
            assert_eq!(read_pixel(buffer), received);
            assert_eq!(item.frame_number, received as u64 + 1);
            q.release(&item).unwrap();
            received += 1;
        }
    });
}
