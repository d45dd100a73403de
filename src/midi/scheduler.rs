/// Timed MIDI output: the audio callback queues each message with the time
/// it is due, and a sender thread delivers it then
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use midir::MidiOutputConnection;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::engine::LossCounter;

/// Messages in flight between the callback and the sender thread.
pub const OUTPUT_QUEUE_CAPACITY: usize = 4096;

/// Longest the sender sleeps before looking at the queue again.
const MAX_SLEEP: Duration = Duration::from_millis(1);

/// A 3-byte message and the moment it should leave the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledMidi {
    pub due: Instant,
    pub bytes: [u8; 3],
}

/// Where the sender thread delivers messages.
pub trait MidiSink: Send {
    type Error: fmt::Display;

    fn send_message(&mut self, message: &[u8]) -> Result<(), Self::Error>;
}

impl MidiSink for MidiOutputConnection {
    type Error = midir::SendError;

    fn send_message(&mut self, message: &[u8]) -> Result<(), Self::Error> {
        self.send(message)
    }
}

/// Producer end, owned by the audio callback. Never blocks or allocates.
pub struct MidiOutputQueue {
    producer: Producer<ScheduledMidi>,
    dropped: Arc<AtomicU64>,
}

impl MidiOutputQueue {
    /// Queue `bytes` for delivery at `due`. Returns `false` and counts the
    /// message as dropped when the queue is full.
    #[inline]
    pub fn push(&mut self, due: Instant, bytes: [u8; 3]) -> bool {
        match self.producer.push(ScheduledMidi { due, bytes }) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// A queue with no sender thread behind it, for inspecting what the
    /// callback schedules.
    #[cfg(test)]
    pub(crate) fn unsent(capacity: usize) -> (Self, Consumer<ScheduledMidi>) {
        let (producer, consumer) = RingBuffer::new(capacity);
        let queue = Self {
            producer,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (queue, consumer)
    }
}

/// The sender thread. Stopping it delivers whatever is still queued at once,
/// so trailing note-offs are not lost.
pub struct MidiScheduler {
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl MidiScheduler {
    pub fn spawn<S: MidiSink + 'static>(sink: S, capacity: usize) -> io::Result<(Self, MidiOutputQueue)> {
        let (producer, consumer) = RingBuffer::new(capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));

        let handle = {
            let running = Arc::clone(&running);
            let failed = Arc::clone(&failed);
            thread::Builder::new()
                .name("roundabout-midi-out".into())
                .spawn(move || send_loop(sink, consumer, running, failed))?
        };

        let queue = MidiOutputQueue {
            producer,
            dropped: Arc::clone(&dropped),
        };
        Ok((
            Self {
                running,
                dropped,
                failed,
                handle: Some(handle),
            },
            queue,
        ))
    }

    /// Messages lost because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Messages the port refused.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Counters for the notification worker to report.
    pub fn loss_counters(&self) -> Vec<LossCounter> {
        vec![
            LossCounter::new("MIDI output messages dropped (queue full)", Arc::clone(&self.dropped)),
            LossCounter::new("MIDI output messages failed to send", Arc::clone(&self.failed)),
        ]
    }

    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!(target: "roundabout::midi", "MIDI output thread panicked");
            }
        }
    }
}

impl Drop for MidiScheduler {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

fn send_loop<S: MidiSink>(
    mut sink: S,
    mut queue: Consumer<ScheduledMidi>,
    running: Arc<AtomicBool>,
    failed: Arc<AtomicU64>,
) {
    log::debug!(target: "roundabout::midi", "MIDI output thread started");

    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        let due = match queue.peek() {
            Ok(next) => next.due,
            Err(_) => {
                thread::sleep(MAX_SLEEP);
                continue;
            }
        };
        if due > now {
            thread::sleep((due - now).min(MAX_SLEEP));
            continue;
        }
        if let Ok(message) = queue.pop() {
            deliver(&mut sink, &message, &failed);
        }
    }

    while let Ok(message) = queue.pop() {
        deliver(&mut sink, &message, &failed);
    }

    log::debug!(target: "roundabout::midi", "MIDI output thread stopped");
}

fn deliver<S: MidiSink>(sink: &mut S, message: &ScheduledMidi, failed: &AtomicU64) {
    if let Err(e) = sink.send_message(&message.bytes) {
        failed.fetch_add(1, Ordering::Relaxed);
        log::trace!(target: "roundabout::midi", "send failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records every delivery with the moment it happened.
    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<([u8; 3], Instant)>>>,
    }

    impl MidiSink for Recorder {
        type Error = String;

        fn send_message(&mut self, message: &[u8]) -> Result<(), String> {
            let mut bytes = [0u8; 3];
            bytes.copy_from_slice(message);
            self.sent.lock().push((bytes, Instant::now()));
            Ok(())
        }
    }

    struct Refusing;

    impl MidiSink for Refusing {
        type Error = &'static str;

        fn send_message(&mut self, _message: &[u8]) -> Result<(), &'static str> {
            Err("port closed")
        }
    }

    fn wait_for(recorder: &Recorder, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.sent.lock().len() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_messages_leave_in_order_and_not_early() {
        let recorder = Recorder::default();
        let (scheduler, mut queue) = MidiScheduler::spawn(recorder.clone(), 16).unwrap();

        let start = Instant::now();
        let dues: Vec<Instant> = [5u64, 15, 30]
            .iter()
            .map(|ms| start + Duration::from_millis(*ms))
            .collect();
        for (i, due) in dues.iter().enumerate() {
            assert!(queue.push(*due, [0x90, 60 + i as u8, 127]));
        }

        wait_for(&recorder, 3);
        let sent = recorder.sent.lock().clone();
        assert_eq!(sent.len(), 3);
        for (i, (bytes, at)) in sent.iter().enumerate() {
            assert_eq!(bytes[1], 60 + i as u8);
            assert!(*at >= dues[i], "message {} sent early", i);
        }
        assert_eq!(scheduler.failed(), 0);
        scheduler.stop();
    }

    #[test]
    fn test_stop_flushes_pending_messages() {
        let recorder = Recorder::default();
        let (scheduler, mut queue) = MidiScheduler::spawn(recorder.clone(), 16).unwrap();
        let later = Instant::now() + Duration::from_secs(60);
        assert!(queue.push(later, [0x80, 60, 127]));
        scheduler.stop();
        assert_eq!(recorder.sent.lock().len(), 1);
    }

    #[test]
    fn test_failed_sends_are_counted() {
        let (scheduler, mut queue) = MidiScheduler::spawn(Refusing, 16).unwrap();
        let now = Instant::now();
        for _ in 0..3 {
            assert!(queue.push(now, [0x90, 60, 127]));
        }
        let failed = Arc::clone(&scheduler.failed);
        scheduler.stop();
        assert_eq!(failed.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_full_queue_counts_drops() {
        let recorder = Recorder::default();
        let (scheduler, mut queue) = MidiScheduler::spawn(recorder, 2).unwrap();
        let later = Instant::now() + Duration::from_secs(60);
        assert!(queue.push(later, [0x90, 60, 127]));
        assert!(queue.push(later, [0x90, 61, 127]));
        assert!(!queue.push(later, [0x90, 62, 127]));
        assert_eq!(scheduler.dropped(), 1);

        let counters = scheduler.loss_counters();
        assert_eq!(counters.iter().map(LossCounter::get).sum::<u64>(), 1);
    }
}
