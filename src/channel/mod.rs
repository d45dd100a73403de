/// Wait-free event queues between the process callback and everything else.
///
/// Each direction is a single-producer/single-consumer ring buffer (`rtrb`).
/// Writing never blocks: when the queue is full the event is dropped and
/// counted, so the real-time side never waits on a slow reader.
use rtrb::{Consumer, Producer, RingBuffer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub mod events;

pub use events::{InboundEvent, Notification};

/// Default queue capacity in events.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Create a connected writer/reader pair holding up to `capacity` events.
pub fn event_queue<T>(capacity: usize) -> (EventWriter<T>, EventReader<T>) {
    let (producer, consumer) = RingBuffer::new(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));

    let writer = EventWriter {
        producer,
        dropped: Arc::clone(&dropped),
    };
    let reader = EventReader { consumer, dropped };
    (writer, reader)
}

/// Producer half of an event queue.
pub struct EventWriter<T> {
    producer: Producer<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> EventWriter<T> {
    /// Queue an event. Returns `false` if the queue was full and the event was dropped.
    #[inline]
    pub fn write(&mut self, event: T) -> bool {
        match self.producer.push(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Free slots left in the queue.
    #[inline]
    pub fn available_space(&self) -> usize {
        self.producer.slots()
    }

    /// Events dropped so far because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer half of an event queue.
pub struct EventReader<T> {
    consumer: Consumer<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> EventReader<T> {
    /// Pop every event available right now and hand each to `handler`, oldest first.
    ///
    /// Events written while draining are left for the next call, which keeps
    /// the time spent here bounded by the queue capacity.
    pub fn drain<F: FnMut(T)>(&mut self, mut handler: F) -> usize {
        let available = self.consumer.slots();
        let mut drained = 0;
        for _ in 0..available {
            match self.consumer.pop() {
                Ok(event) => {
                    handler(event);
                    drained += 1;
                }
                Err(_) => break,
            }
        }
        drained
    }

    /// Number of events waiting to be drained.
    #[inline]
    pub fn pending(&self) -> usize {
        self.consumer.slots()
    }

    /// Events dropped so far because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
