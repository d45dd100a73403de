/// Real-time driver: turns transport position and queued mutations into MIDI
///
/// `Engine::process` is called once per host buffer on the real-time thread.
/// It never allocates, locks or logs; everything it needs is preallocated
/// from `EngineConfig`.
use std::sync::Arc;

use crate::channel::{event_queue, EventReader, EventWriter, InboundEvent, Notification};
use crate::midi::{sort_by_time, MidiEvent, RawMidi};
use crate::sequencer::{Connection, SequencerArena, SequencerId, StepSink};

pub mod clock;
pub mod handle;
pub mod transport;
pub mod worker;

pub use clock::{StepBoundaries, StepClock, DEFAULT_STEPS_PER_BEAT};
pub use handle::EngineHandle;
pub use transport::{TransportClock, TransportControl, TransportPosition};
pub use worker::{
    ChannelObserver, LoggingObserver, LossCounter, NotificationReceiver, NotificationWorker,
    Notifier, SequencerObserver,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub steps_per_beat: u32,
    /// Slots in each of the inbound and outbound queues.
    pub queue_capacity: usize,
    pub max_sequencers: usize,
    /// MIDI events one buffer can hold; extra events are dropped.
    pub max_events_per_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            steps_per_beat: DEFAULT_STEPS_PER_BEAT,
            queue_capacity: crate::channel::DEFAULT_CAPACITY,
            max_sequencers: 64,
            max_events_per_buffer: 1024,
        }
    }
}

pub struct Engine {
    arena: SequencerArena,
    inbound: EventReader<InboundEvent>,
    outbound: EventWriter<Notification>,
    notifier: Arc<Notifier>,
    clock: StepClock,
    // Consumed at the next boundary
    active: Option<SequencerId>,
    // Entered at the last boundary and not yet left
    sounding: Option<SequencerId>,
    output: Vec<MidiEvent>,
}

impl Engine {
    /// Build an engine with its mutation handle and the notification side.
    pub fn new(config: EngineConfig) -> (Self, EngineHandle, NotificationReceiver) {
        let (inbound_writer, inbound) = event_queue(config.queue_capacity);
        let (outbound, outbound_reader) = event_queue(config.queue_capacity);
        let notifier = Arc::new(Notifier::new());

        let engine = Self {
            arena: SequencerArena::with_capacity(config.max_sequencers),
            inbound,
            outbound,
            notifier: Arc::clone(&notifier),
            clock: StepClock::new(config.steps_per_beat),
            active: None,
            sounding: None,
            output: Vec::with_capacity(config.max_events_per_buffer),
        };
        let receiver = NotificationReceiver::new(outbound_reader, notifier);
        (engine, EngineHandle::new(inbound_writer), receiver)
    }

    pub fn arena(&self) -> &SequencerArena {
        &self.arena
    }

    pub fn active(&self) -> Option<SequencerId> {
        self.active
    }

    pub fn sounding(&self) -> Option<SequencerId> {
        self.sounding
    }

    pub fn steps_per_beat(&self) -> u32 {
        self.clock.steps_per_beat()
    }

    /// Run one buffer of `frames` frames.
    ///
    /// `midi_in` is the MIDI received for this buffer, ordered by time.
    /// Returns the MIDI to send, ordered by time; a note-off and a note-on
    /// on the same frame keep the off first.
    pub fn process(
        &mut self,
        frames: u32,
        position: &TransportPosition,
        midi_in: &[RawMidi],
    ) -> &[MidiEvent] {
        self.output.clear();
        self.apply_inbound();

        let Self {
            arena,
            outbound,
            clock,
            active,
            sounding,
            output,
            ..
        } = self;

        if !position.rolling || !position.is_valid() {
            if let Some(id) = sounding.take() {
                arena.stop(id, &mut BufferSink::new(0, output, outbound));
                *active = Some(id);
            }
            clock.reset();
            if let Some(sequencer) = active.and_then(|id| arena.get_mut(id)) {
                sequencer.process_midi_events(midi_in);
            }
        } else {
            let mut consumed = 0;
            for offset in clock.schedule(position, frames) {
                let Some(current) = active.or_else(|| arena.first()) else {
                    break;
                };

                let due = midi_in[consumed..].partition_point(|event| event.time <= offset);
                if let Some(sequencer) = arena.get_mut(current) {
                    sequencer.process_midi_events(&midi_in[consumed..consumed + due]);
                }
                consumed += due;

                let mut sink = BufferSink::new(offset, output, outbound);
                if let Some(previous) = sounding.take() {
                    arena.process_step_end(previous, &mut sink);
                }
                *active = Some(arena.process_step_begin(current, &mut sink));
                *sounding = Some(current);
            }

            if let Some(sequencer) = active.and_then(|id| arena.get_mut(id)) {
                sequencer.process_midi_events(&midi_in[consumed..]);
            }
        }

        sort_by_time(output);
        self.notifier.wake();
        &self.output
    }

    fn apply_inbound(&mut self) {
        let Self {
            arena,
            inbound,
            outbound,
            clock,
            active,
            sounding,
            output,
            ..
        } = self;

        inbound.drain(|event| match event {
            InboundEvent::CreateSequencer => {
                if let Some(id) = arena.insert() {
                    if active.is_none() {
                        *active = Some(id);
                    }
                    outbound.write(Notification::CreatedSequencer(id));
                }
            }
            InboundEvent::RemoveSequencer(id) => {
                if !arena.contains(id) {
                    return;
                }
                if *sounding == Some(id) {
                    arena.stop(id, &mut BufferSink::new(0, output, outbound));
                    *sounding = None;
                }
                arena.remove(id);
                if *active == Some(id) {
                    *active = arena.first();
                }
                outbound.write(Notification::RemovedSequencer(id));
            }
            InboundEvent::Activate(id) => {
                if arena.contains(id) {
                    *active = Some(id);
                }
            }
            InboundEvent::ToggleStep { sequencer, step } => {
                if let Some(sequencer) = arena.get_mut(sequencer) {
                    sequencer.toggle_step(step);
                }
            }
            InboundEvent::ToggleNote {
                sequencer,
                step,
                note,
            } => {
                if let Some(sequencer) = arena.get_mut(sequencer) {
                    sequencer.toggle_note(step, note);
                }
            }
            InboundEvent::Connect {
                sequencer,
                step,
                target,
                target_step,
            } => {
                if !arena.contains(target) {
                    return;
                }
                if let Some(sequencer) = arena.get_mut(sequencer) {
                    sequencer.connect(
                        step,
                        Connection {
                            target,
                            step: target_step,
                        },
                    );
                }
            }
            InboundEvent::Disconnect { sequencer, step } => {
                if let Some(sequencer) = arena.get_mut(sequencer) {
                    sequencer.disconnect(step);
                }
            }
            InboundEvent::SetBranchFrequency {
                sequencer,
                step,
                branch,
                continue_frequency,
            } => {
                if let Some(sequencer) = arena.get_mut(sequencer) {
                    sequencer.set_branch_frequency(step, branch, continue_frequency);
                }
            }
            InboundEvent::SetInputChannel { sequencer, channel } => {
                if let Some(sequencer) = arena.get_mut(sequencer) {
                    sequencer.set_input_channel(channel);
                }
            }
            InboundEvent::SetOutputChannel { sequencer, channel } => {
                if let Some(sequencer) = arena.get_mut(sequencer) {
                    sequencer.set_output_channel(channel);
                }
            }
            InboundEvent::SetStepsPerBeat(steps_per_beat) => clock.set_steps_per_beat(steps_per_beat),
        });
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.outbound.write(Notification::Shutdown);
        self.notifier.close();
    }
}

/// Stamps traversal output with the boundary's frame offset.
struct BufferSink<'a> {
    time: u32,
    output: &'a mut Vec<MidiEvent>,
    outbound: &'a mut EventWriter<Notification>,
}

impl<'a> BufferSink<'a> {
    fn new(time: u32, output: &'a mut Vec<MidiEvent>, outbound: &'a mut EventWriter<Notification>) -> Self {
        Self {
            time,
            output,
            outbound,
        }
    }

    fn push(&mut self, event: MidiEvent) {
        // Never grow on the real-time thread
        if self.output.len() < self.output.capacity() {
            self.output.push(event);
        }
    }
}

impl StepSink for BufferSink<'_> {
    fn note_on(&mut self, channel: u8, note: u8) {
        self.push(MidiEvent::note_on(self.time, channel, note));
    }

    fn note_off(&mut self, channel: u8, note: u8) {
        self.push(MidiEvent::note_off(self.time, channel, note));
    }

    fn notify(&mut self, notification: Notification) {
        self.outbound.write(notification);
    }
}
