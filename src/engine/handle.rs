/// Non-real-time mutation API
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{EventWriter, InboundEvent};
use crate::sequencer::{SequencerId, MAX_CHANNEL, NOTE_COUNT, STEP_COUNT};

/// Queues mutation requests for the engine.
///
/// Every call is asynchronous: it is applied at the start of the next
/// process callback, and its outcome (if any) arrives as a notification.
/// Requests that arrive when the inbound queue is full are dropped; the
/// methods return `false` in that case.
///
/// Cloning is cheap. Clones share one queue and serialize on a mutex, so
/// the engine still sees a single producer. Only callers of this handle
/// (UI, CLI, network threads) ever take that mutex; the process callback
/// reads the other end of the queue without locking. Do not call these
/// methods from the audio thread.
#[derive(Clone)]
pub struct EngineHandle {
    writer: Arc<Mutex<EventWriter<InboundEvent>>>,
}

impl EngineHandle {
    pub(crate) fn new(writer: EventWriter<InboundEvent>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    fn send(&self, event: InboundEvent) -> bool {
        let queued = self.writer.lock().write(event);
        if !queued {
            log::warn!(target: "roundabout::engine", "inbound queue full, dropped {:?}", event);
        }
        queued
    }

    /// Ask for a new sequencer. Its id arrives in `Notification::CreatedSequencer`.
    pub fn create_sequencer(&self) -> bool {
        self.send(InboundEvent::CreateSequencer)
    }

    pub fn remove_sequencer(&self, sequencer: SequencerId) -> bool {
        self.send(InboundEvent::RemoveSequencer(sequencer))
    }

    /// Make `sequencer` the one whose next step plays at the coming boundary.
    pub fn activate(&self, sequencer: SequencerId) -> bool {
        self.send(InboundEvent::Activate(sequencer))
    }

    pub fn toggle_step(&self, sequencer: SequencerId, step: usize) -> bool {
        assert!(step < STEP_COUNT, "step {} out of range", step);
        self.send(InboundEvent::ToggleStep { sequencer, step })
    }

    pub fn toggle_note(&self, sequencer: SequencerId, step: usize, note: usize) -> bool {
        assert!(step < STEP_COUNT, "step {} out of range", step);
        assert!(note < NOTE_COUNT, "note {} out of range", note);
        self.send(InboundEvent::ToggleNote {
            sequencer,
            step,
            note,
        })
    }

    /// Connect `step` of `sequencer` to `target_step` of `target`.
    pub fn connect(
        &self,
        sequencer: SequencerId,
        step: usize,
        target: SequencerId,
        target_step: usize,
    ) -> bool {
        assert!(step < STEP_COUNT, "step {} out of range", step);
        assert!(target_step < STEP_COUNT, "target step {} out of range", target_step);
        self.send(InboundEvent::Connect {
            sequencer,
            step,
            target,
            target_step,
        })
    }

    pub fn disconnect(&self, sequencer: SequencerId, step: usize) -> bool {
        assert!(step < STEP_COUNT, "step {} out of range", step);
        self.send(InboundEvent::Disconnect { sequencer, step })
    }

    /// Branch `branch` times, then continue `continue_frequency` times, repeating.
    pub fn set_branch_frequency(
        &self,
        sequencer: SequencerId,
        step: usize,
        branch: u32,
        continue_frequency: u32,
    ) -> bool {
        assert!(step < STEP_COUNT, "step {} out of range", step);
        self.send(InboundEvent::SetBranchFrequency {
            sequencer,
            step,
            branch,
            continue_frequency,
        })
    }

    pub fn set_input_channel(&self, sequencer: SequencerId, channel: u8) -> bool {
        assert!(channel <= MAX_CHANNEL, "channel {} out of range", channel);
        self.send(InboundEvent::SetInputChannel { sequencer, channel })
    }

    pub fn set_output_channel(&self, sequencer: SequencerId, channel: u8) -> bool {
        assert!(channel <= MAX_CHANNEL, "channel {} out of range", channel);
        self.send(InboundEvent::SetOutputChannel { sequencer, channel })
    }

    pub fn set_steps_per_beat(&self, steps_per_beat: u32) -> bool {
        assert!(steps_per_beat > 0, "steps per beat must be positive");
        self.send(InboundEvent::SetStepsPerBeat(steps_per_beat))
    }

    /// Requests dropped so far because the inbound queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.writer.lock().dropped()
    }
}
