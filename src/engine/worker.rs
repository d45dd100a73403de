/// Notification delivery off the real-time thread
/// The process callback queues notifications and wakes a worker thread,
/// which hands them to the registered observers.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::channel::{EventReader, Notification};
use crate::sequencer::SequencerId;

/// Upper bound on how long the worker sleeps without a wake-up.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wake-up signal between the process callback and the worker.
#[derive(Debug, Default)]
pub struct Notifier {
    pending: AtomicBool,
    closed: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that notifications are waiting. Never takes the mutex.
    ///
    /// A wake racing with the worker going to sleep can be missed; the
    /// worker then picks the notifications up after `POLL_INTERVAL`.
    #[inline]
    pub fn wake(&self) {
        self.pending.store(true, Ordering::Release);
        self.condvar.notify_one();
    }

    /// Like [`wake`](Self::wake) but cannot be missed. Not for the real-time thread.
    pub fn wake_blocking(&self) {
        {
            let _guard = self.lock.lock();
            self.pending.store(true, Ordering::Release);
        }
        self.condvar.notify_one();
    }

    /// Tell the worker no more notifications will arrive.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake_blocking();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Block until woken or until `timeout` elapses. Returns `true` when woken.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut guard = self.lock.lock();
        while !self.pending.swap(false, Ordering::AcqRel) {
            if self.condvar.wait_for(&mut guard, timeout).timed_out() {
                return self.pending.swap(false, Ordering::AcqRel);
            }
        }
        true
    }
}

/// Consumer side of the notification queue.
pub struct NotificationReceiver {
    reader: EventReader<Notification>,
    notifier: Arc<Notifier>,
}

impl NotificationReceiver {
    pub(crate) fn new(reader: EventReader<Notification>, notifier: Arc<Notifier>) -> Self {
        Self { reader, notifier }
    }

    /// Hand every queued notification to `handler`, oldest first.
    pub fn drain<F: FnMut(Notification)>(&mut self, handler: F) -> usize {
        self.reader.drain(handler)
    }

    /// Block until the engine signals new notifications or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.notifier.wait(timeout)
    }

    /// The engine has gone away.
    pub fn is_closed(&self) -> bool {
        self.notifier.is_closed()
    }

    pub fn pending(&self) -> usize {
        self.reader.pending()
    }

    /// Notifications lost because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.reader.dropped()
    }
}

/// Receives engine notifications on the worker thread.
///
/// Every method defaults to doing nothing; implement the ones you need, or
/// override [`notify`](Self::notify) to see everything.
pub trait SequencerObserver: Send {
    fn created_sequencer(&mut self, _sequencer: SequencerId) {}

    fn removed_sequencer(&mut self, _sequencer: SequencerId) {}

    fn entered_step(&mut self, _sequencer: SequencerId, _step: usize) {}

    fn left_step(&mut self, _sequencer: SequencerId, _step: usize) {}

    fn changed_branch_counter(&mut self, _sequencer: SequencerId, _step: usize, _counter: u32) {}

    fn shutdown(&mut self) {}

    fn notify(&mut self, notification: Notification) {
        match notification {
            Notification::CreatedSequencer(id) => self.created_sequencer(id),
            Notification::RemovedSequencer(id) => self.removed_sequencer(id),
            Notification::EnteredStep { sequencer, step } => self.entered_step(sequencer, step),
            Notification::LeftStep { sequencer, step } => self.left_step(sequencer, step),
            Notification::ChangedBranchCounter {
                sequencer,
                step,
                counter,
            } => self.changed_branch_counter(sequencer, step, counter),
            Notification::Shutdown => self.shutdown(),
        }
    }
}

/// Forwards every notification into a crossbeam channel, e.g. for a UI thread.
pub struct ChannelObserver {
    sender: Sender<Notification>,
}

impl ChannelObserver {
    /// An observer plus the receiving end of its channel.
    pub fn channel() -> (Self, Receiver<Notification>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender }, receiver)
    }
}

impl SequencerObserver for ChannelObserver {
    fn notify(&mut self, notification: Notification) {
        // Receiver gone means nobody is listening any more
        let _ = self.sender.send(notification);
    }
}

/// Logs every notification at debug level.
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl SequencerObserver for LoggingObserver {
    fn created_sequencer(&mut self, sequencer: SequencerId) {
        log::debug!(target: "roundabout::worker", "created sequencer {}", sequencer);
    }

    fn removed_sequencer(&mut self, sequencer: SequencerId) {
        log::debug!(target: "roundabout::worker", "removed sequencer {}", sequencer);
    }

    fn entered_step(&mut self, sequencer: SequencerId, step: usize) {
        log::trace!(target: "roundabout::worker", "{} entered step {}", sequencer, step);
    }

    fn left_step(&mut self, sequencer: SequencerId, step: usize) {
        log::trace!(target: "roundabout::worker", "{} left step {}", sequencer, step);
    }

    fn changed_branch_counter(&mut self, sequencer: SequencerId, step: usize, counter: u32) {
        log::debug!(
            target: "roundabout::worker",
            "{} step {} branch counter now {}",
            sequencer,
            step,
            counter
        );
    }
}

/// Count of messages lost somewhere else, e.g. at a MIDI port, which the
/// worker reports alongside its own queue drops.
#[derive(Debug, Clone)]
pub struct LossCounter {
    what: &'static str,
    count: Arc<AtomicU64>,
}

impl LossCounter {
    pub fn new(what: &'static str, count: Arc<AtomicU64>) -> Self {
        Self { what, count }
    }

    pub fn what(&self) -> &'static str {
        self.what
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Thread that drains notifications and dispatches them to observers.
pub struct NotificationWorker {
    handle: Option<JoinHandle<()>>,
}

impl NotificationWorker {
    pub fn spawn(
        receiver: NotificationReceiver,
        observers: Vec<Box<dyn SequencerObserver>>,
    ) -> std::io::Result<Self> {
        Self::spawn_with_counters(receiver, observers, Vec::new())
    }

    /// Like [`spawn`](Self::spawn), also logging growth of `counters`.
    pub fn spawn_with_counters(
        receiver: NotificationReceiver,
        observers: Vec<Box<dyn SequencerObserver>>,
        counters: Vec<LossCounter>,
    ) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name("roundabout-notify".into())
            .spawn(move || worker_loop(receiver, observers, counters))?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the worker to exit. It exits once the engine is dropped.
    pub fn join(mut self) {
        self.join_inner();
    }

    fn join_inner(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!(target: "roundabout::worker", "notification worker panicked");
            }
        }
    }
}

impl Drop for NotificationWorker {
    fn drop(&mut self) {
        self.join_inner();
    }
}

fn worker_loop(
    mut receiver: NotificationReceiver,
    mut observers: Vec<Box<dyn SequencerObserver>>,
    counters: Vec<LossCounter>,
) {
    log::debug!(target: "roundabout::worker", "notification worker started");
    let mut reported_drops = 0;
    let mut reported: Vec<u64> = vec![0; counters.len()];

    loop {
        receiver.wait(POLL_INTERVAL);

        let mut shutdown = false;
        receiver.drain(|notification| {
            for observer in observers.iter_mut() {
                observer.notify(notification);
            }
            if notification == Notification::Shutdown {
                shutdown = true;
            }
        });

        let dropped = receiver.dropped();
        if dropped > reported_drops {
            log::warn!(
                target: "roundabout::worker",
                "notification queue full, {} notifications dropped",
                dropped - reported_drops
            );
            reported_drops = dropped;
        }
        report_losses(&counters, &mut reported);

        if shutdown || (receiver.is_closed() && receiver.pending() == 0) {
            break;
        }
    }

    report_losses(&counters, &mut reported);
    log::debug!(target: "roundabout::worker", "notification worker stopped");
}

/// Log each counter that grew since the last call. Returns how many did.
fn report_losses(counters: &[LossCounter], reported: &mut [u64]) -> usize {
    let mut grew = 0;
    for (counter, last) in counters.iter().zip(reported.iter_mut()) {
        let now = counter.get();
        if now > *last {
            log::warn!(target: "roundabout::worker", "{}: {}", counter.what(), now - *last);
            *last = now;
            grew += 1;
        }
    }
    grew
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::event_queue;
    use crate::sequencer::SequencerArena;

    fn ids() -> (SequencerId, SequencerId) {
        let mut arena = SequencerArena::with_capacity(2);
        (arena.insert().unwrap(), arena.insert().unwrap())
    }

    #[test]
    fn test_wait_times_out_without_wake() {
        let notifier = Notifier::new();
        assert!(!notifier.wait(Duration::from_millis(5)));
    }

    #[test]
    fn test_wake_before_wait_is_not_lost() {
        let notifier = Notifier::new();
        notifier.wake();
        assert!(notifier.wait(Duration::from_millis(5)));
        // Consumed
        assert!(!notifier.wait(Duration::from_millis(5)));
    }

    #[test]
    fn test_wake_from_other_thread() {
        let notifier = Arc::new(Notifier::new());
        let waker = Arc::clone(&notifier);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            waker.wake_blocking();
        });
        assert!(notifier.wait(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_default_notify_dispatches_by_kind() {
        #[derive(Default)]
        struct Counts {
            entered: Vec<(SequencerId, usize)>,
            counters: Vec<u32>,
            shutdowns: usize,
        }
        impl SequencerObserver for Counts {
            fn entered_step(&mut self, sequencer: SequencerId, step: usize) {
                self.entered.push((sequencer, step));
            }
            fn changed_branch_counter(&mut self, _: SequencerId, _: usize, counter: u32) {
                self.counters.push(counter);
            }
            fn shutdown(&mut self) {
                self.shutdowns += 1;
            }
        }

        let (a, _) = ids();
        let mut counts = Counts::default();
        counts.notify(Notification::EnteredStep { sequencer: a, step: 3 });
        counts.notify(Notification::LeftStep { sequencer: a, step: 3 });
        counts.notify(Notification::ChangedBranchCounter {
            sequencer: a,
            step: 3,
            counter: 1,
        });
        counts.notify(Notification::Shutdown);
        assert_eq!(counts.entered, vec![(a, 3)]);
        assert_eq!(counts.counters, vec![1]);
        assert_eq!(counts.shutdowns, 1);
    }

    #[test]
    fn test_worker_forwards_in_order_and_exits_on_shutdown() {
        let (a, b) = ids();
        let (mut writer, reader) = event_queue(16);
        let notifier = Arc::new(Notifier::new());
        let receiver = NotificationReceiver::new(reader, Arc::clone(&notifier));
        let (observer, rx) = ChannelObserver::channel();
        let observers: Vec<Box<dyn SequencerObserver>> = vec![Box::new(observer), Box::new(LoggingObserver)];
        let worker = NotificationWorker::spawn(receiver, observers).unwrap();

        let sent = [
            Notification::CreatedSequencer(a),
            Notification::CreatedSequencer(b),
            Notification::EnteredStep { sequencer: a, step: 0 },
            Notification::RemovedSequencer(b),
            Notification::Shutdown,
        ];
        for notification in sent {
            assert!(writer.write(notification));
        }
        notifier.wake();

        let received: Vec<Notification> = (0..sent.len())
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(received, sent.to_vec());

        worker.join();
    }

    #[test]
    fn test_loss_counters_reported_once_per_increase() {
        let count = Arc::new(AtomicU64::new(0));
        let counters = vec![LossCounter::new("lost", Arc::clone(&count))];
        let mut reported = vec![0u64; 1];

        assert_eq!(report_losses(&counters, &mut reported), 0);
        count.fetch_add(3, Ordering::Relaxed);
        assert_eq!(report_losses(&counters, &mut reported), 1);
        assert_eq!(reported, vec![3]);
        assert_eq!(report_losses(&counters, &mut reported), 0);
    }

    #[test]
    fn test_worker_with_counters_exits_when_closed() {
        let (_writer, reader) = event_queue::<Notification>(4);
        let notifier = Arc::new(Notifier::new());
        let receiver = NotificationReceiver::new(reader, Arc::clone(&notifier));
        let count = Arc::new(AtomicU64::new(2));
        let counters = vec![LossCounter::new("lost", count)];
        let worker = NotificationWorker::spawn_with_counters(receiver, Vec::new(), counters).unwrap();
        notifier.close();
        worker.join();
    }

    #[test]
    fn test_worker_exits_when_closed() {
        let (_writer, reader) = event_queue::<Notification>(4);
        let notifier = Arc::new(Notifier::new());
        let receiver = NotificationReceiver::new(reader, Arc::clone(&notifier));
        let worker = NotificationWorker::spawn(receiver, Vec::new()).unwrap();
        notifier.close();
        worker.join();
    }
}
