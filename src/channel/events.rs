/// Domain events carried by the inbound and outbound queues.
use crate::sequencer::SequencerId;

/// A mutation request, applied at the top of the next process callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundEvent {
    CreateSequencer,
    RemoveSequencer(SequencerId),
    Activate(SequencerId),
    ToggleStep {
        sequencer: SequencerId,
        step: usize,
    },
    ToggleNote {
        sequencer: SequencerId,
        step: usize,
        note: usize,
    },
    Connect {
        sequencer: SequencerId,
        step: usize,
        target: SequencerId,
        target_step: usize,
    },
    Disconnect {
        sequencer: SequencerId,
        step: usize,
    },
    SetBranchFrequency {
        sequencer: SequencerId,
        step: usize,
        branch: u32,
        continue_frequency: u32,
    },
    SetInputChannel {
        sequencer: SequencerId,
        channel: u8,
    },
    SetOutputChannel {
        sequencer: SequencerId,
        channel: u8,
    },
    SetStepsPerBeat(u32),
}

/// A notification published by the process callback for non-real-time observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    CreatedSequencer(SequencerId),
    RemovedSequencer(SequencerId),
    EnteredStep {
        sequencer: SequencerId,
        step: usize,
    },
    LeftStep {
        sequencer: SequencerId,
        step: usize,
    },
    ChangedBranchCounter {
        sequencer: SequencerId,
        step: usize,
        counter: u32,
    },
    /// The engine is going away; the notification worker exits when it sees this.
    Shutdown,
}
