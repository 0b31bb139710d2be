//! Notifications sent by the queue to the consumer and producer.
//!
//! Listeners are always called without the queue's internal lock held, so they
//! can call back into the queue. They are one-way notifications: nothing they
//! do can make the operation that triggered them fail.
use std::sync::Weak;

use super::item::BufferItem;

/// Receives the events of interest to the consumer.
pub trait ConsumerListener: Send + Sync {
    /// A new frame has been queued and can be acquired.
    fn on_frame_available(&self, item: &BufferItem);

    /// A new frame has been queued, replacing the droppable frame that was at
    /// the tail of the queue. The number of frames waiting did not change.
    fn on_frame_replaced(&self, _item: &BufferItem) {}

    /// Buffers previously handed to the consumer have been freed, and the
    /// consumer should drop the references it caches. See
    /// [`super::consumer::BufferQueueConsumer::get_released_buffers`].
    fn on_buffers_released(&self) {}

    /// The producer has disconnected from the queue.
    fn on_disconnect(&self) {}
}

/// Receives the events of interest to the producer.
pub trait ProducerListener: Send + Sync {
    /// A buffer has been released by the consumer and may be dequeued.
    fn on_buffer_released(&self);
}

/// Forwards the events it receives to a consumer listener for as long as it is
/// alive.
///
/// The queue keeps its consumer listener through this proxy, so that a
/// consumer holding the queue does not create a reference cycle.
#[derive(Clone)]
pub(crate) struct ProxyConsumerListener {
    listener: Weak<dyn ConsumerListener>,
}

impl ProxyConsumerListener {
    pub fn new(listener: Weak<dyn ConsumerListener>) -> Self {
        ProxyConsumerListener { listener }
    }
}

impl ConsumerListener for ProxyConsumerListener {
    fn on_frame_available(&self, item: &BufferItem) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_frame_available(item);
        }
    }

    fn on_frame_replaced(&self, item: &BufferItem) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_frame_replaced(item);
        }
    }

    fn on_buffers_released(&self) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_buffers_released();
        }
    }

    fn on_disconnect(&self) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_disconnect();
        }
    }
}
