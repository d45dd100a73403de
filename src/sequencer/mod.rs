/// Core sequencer logic - a ring of steps with optional branches into other sequencers
/// This runs on the process thread only; other threads reach it through the inbound queue.
use crate::channel::Notification;
use crate::midi::RawMidi;
pub mod arena;

pub use arena::{SequencerArena, SequencerId};

/// Steps per sequencer ring.
pub const STEP_COUNT: usize = 16;
/// Note offsets available per step (one octave inclusive).
pub const NOTE_COUNT: usize = 13;
/// Highest MIDI channel number.
pub const MAX_CHANNEL: u8 = 15;
/// Root note of a fresh sequencer (middle C).
pub const DEFAULT_BASE_NOTE: u8 = 60;

/// Set of note offsets (0..NOTE_COUNT) above the base note.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NoteMask(u16);

impl NoteMask {
    pub const EMPTY: NoteMask = NoteMask(0);

    pub fn from_bits(bits: u16) -> Self {
        Self(bits & ((1 << NOTE_COUNT) - 1))
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, note: usize) -> bool {
        note < NOTE_COUNT && self.0 & (1 << note) != 0
    }

    pub fn toggle(&mut self, note: usize) {
        debug_assert!(note < NOTE_COUNT, "note offset {} out of range", note);
        if note < NOTE_COUNT {
            self.0 ^= 1 << note;
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..NOTE_COUNT).filter(move |&note| self.contains(note))
    }
}

/// Where a step may redirect execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub target: SequencerId,
    pub step: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub active: bool,
    pub notes: NoteMask,
    pub connection: Option<Connection>,
    pub branch_frequency: u32,
    pub continue_frequency: u32,
    branch_counter: u32,
}

impl Default for Step {
    fn default() -> Self {
        Self {
            active: false,
            notes: NoteMask::EMPTY,
            connection: None,
            branch_frequency: 1,
            continue_frequency: 0,
            branch_counter: 0,
        }
    }
}

impl Step {
    pub fn branch_counter(&self) -> u32 {
        self.branch_counter
    }

    /// Length of one branch/continue cycle; never zero.
    pub fn cycle_length(&self) -> u32 {
        self.branch_frequency
            .saturating_add(self.continue_frequency)
            .max(1)
    }

    fn set_frequencies(&mut self, branch: u32, continue_frequency: u32) {
        self.branch_frequency = branch;
        self.continue_frequency = continue_frequency;
        self.branch_counter = 0;
    }
}

/// Outcome of entering a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The ring continues; `next_step` already points at the following index.
    Continue,
    /// Execution moves to the connected sequencer's step.
    Branch(Connection),
}

/// Receives what step traversal produces. The driver stamps each note with
/// the frame offset of the boundary being processed.
pub trait StepSink {
    fn note_on(&mut self, channel: u8, note: u8);
    fn note_off(&mut self, channel: u8, note: u8);
    fn notify(&mut self, notification: Notification);
}

#[derive(Debug, Clone)]
pub struct Sequencer {
    id: SequencerId,
    steps: [Step; STEP_COUNT],
    next_step: usize,
    // What is sounding now, kept so note-offs match the note-ons exactly
    active_step: Option<usize>,
    active_notes: NoteMask,
    active_base_note: u8,
    active_channel: u8,
    input_channel: u8,
    output_channel: u8,
    base_note: u8,
}

impl Sequencer {
    pub fn new(id: SequencerId) -> Self {
        Self {
            id,
            steps: [Step::default(); STEP_COUNT],
            next_step: 0,
            active_step: None,
            active_notes: NoteMask::EMPTY,
            active_base_note: DEFAULT_BASE_NOTE,
            active_channel: 0,
            input_channel: 0,
            output_channel: 0,
            base_note: DEFAULT_BASE_NOTE,
        }
    }

    pub fn id(&self) -> SequencerId {
        self.id
    }

    pub fn step(&self, index: usize) -> &Step {
        &self.steps[index]
    }

    pub fn steps(&self) -> &[Step; STEP_COUNT] {
        &self.steps
    }

    pub fn next_step(&self) -> usize {
        self.next_step
    }

    /// Step entered most recently and not yet left.
    pub fn active_step(&self) -> Option<usize> {
        self.active_step
    }

    pub fn is_sounding(&self) -> bool {
        self.active_step.is_some()
    }

    pub fn base_note(&self) -> u8 {
        self.base_note
    }

    pub fn input_channel(&self) -> u8 {
        self.input_channel
    }

    pub fn output_channel(&self) -> u8 {
        self.output_channel
    }

    pub fn toggle_step(&mut self, step: usize) {
        debug_assert!(step < STEP_COUNT);
        if let Some(step) = self.steps.get_mut(step) {
            step.active = !step.active;
        }
    }

    pub fn toggle_note(&mut self, step: usize, note: usize) {
        debug_assert!(step < STEP_COUNT);
        if let Some(step) = self.steps.get_mut(step) {
            step.notes.toggle(note);
        }
    }

    /// Connect `step` to `connection`. Frequencies are kept, the counter restarts.
    pub fn connect(&mut self, step: usize, connection: Connection) {
        debug_assert!(step < STEP_COUNT && connection.step < STEP_COUNT);
        if connection.step >= STEP_COUNT {
            return;
        }
        if let Some(step) = self.steps.get_mut(step) {
            step.connection = Some(connection);
            step.branch_counter = 0;
        }
    }

    pub fn disconnect(&mut self, step: usize) {
        debug_assert!(step < STEP_COUNT);
        if let Some(step) = self.steps.get_mut(step) {
            step.connection = None;
            step.branch_counter = 0;
        }
    }

    /// Drop every connection that leads into `target`.
    pub fn disconnect_from(&mut self, target: SequencerId) {
        for step in self.steps.iter_mut() {
            if step.connection.map(|c| c.target) == Some(target) {
                step.connection = None;
                step.branch_counter = 0;
            }
        }
    }

    pub fn set_branch_frequency(&mut self, step: usize, branch: u32, continue_frequency: u32) {
        debug_assert!(step < STEP_COUNT);
        if let Some(step) = self.steps.get_mut(step) {
            step.set_frequencies(branch, continue_frequency);
        }
    }

    pub fn set_input_channel(&mut self, channel: u8) {
        debug_assert!(channel <= MAX_CHANNEL);
        self.input_channel = channel.min(MAX_CHANNEL);
    }

    pub fn set_output_channel(&mut self, channel: u8) {
        debug_assert!(channel <= MAX_CHANNEL);
        self.output_channel = channel.min(MAX_CHANNEL);
    }

    /// Make `step` the next one to be entered.
    pub fn jump_to(&mut self, step: usize) {
        debug_assert!(step < STEP_COUNT);
        self.next_step = step % STEP_COUNT;
    }

    /// Move `next_step` one position around the ring.
    pub fn advance(&mut self) {
        self.next_step = (self.next_step + 1) % STEP_COUNT;
    }

    /// Enter `next_step`: sound its notes, then decide where execution goes next.
    ///
    /// On `Transition::Continue` the ring has already advanced. On
    /// `Transition::Branch` `next_step` is left untouched; the caller points
    /// the target sequencer at the connected step.
    pub fn process_step_begin<S: StepSink>(&mut self, sink: &mut S) -> Transition {
        let index = self.next_step;
        let step = self.steps[index];

        self.active_step = Some(index);
        if step.active {
            self.active_notes = step.notes;
            self.active_base_note = self.base_note;
            self.active_channel = self.output_channel;
        } else {
            self.active_notes = NoteMask::EMPTY;
        }

        sink.notify(Notification::EnteredStep {
            sequencer: self.id,
            step: index,
        });
        for offset in self.active_notes.iter() {
            sink.note_on(self.active_channel, transpose(self.active_base_note, offset));
        }

        let transition = match step.connection {
            Some(connection) => {
                let taken = step.branch_counter < step.branch_frequency;
                let cycle = step.cycle_length();
                if cycle != 1 {
                    let counter = (step.branch_counter + 1) % cycle;
                    self.steps[index].branch_counter = counter;
                    sink.notify(Notification::ChangedBranchCounter {
                        sequencer: self.id,
                        step: index,
                        counter,
                    });
                }
                if taken {
                    Transition::Branch(connection)
                } else {
                    Transition::Continue
                }
            }
            None => Transition::Continue,
        };

        if transition == Transition::Continue {
            self.advance();
        }
        transition
    }

    /// Leave the sounding step: note-off for everything that was turned on.
    pub fn process_step_end<S: StepSink>(&mut self, sink: &mut S) {
        let Some(index) = self.active_step.take() else {
            return;
        };
        for offset in self.active_notes.iter() {
            sink.note_off(self.active_channel, transpose(self.active_base_note, offset));
        }
        self.active_notes = NoteMask::EMPTY;
        sink.notify(Notification::LeftStep {
            sequencer: self.id,
            step: index,
        });
    }

    /// Silence the sequencer and rewind it to the first step.
    pub fn stop<S: StepSink>(&mut self, sink: &mut S) {
        self.process_step_end(sink);
        self.next_step = 0;
    }

    /// Note-ons on the input channel set the base note (live transposition).
    pub fn process_midi_events(&mut self, events: &[RawMidi]) {
        for event in events {
            if let Some((channel, note)) = event.note_on() {
                if channel == self.input_channel {
                    self.base_note = note;
                }
            }
        }
    }
}

fn transpose(base_note: u8, offset: usize) -> u8 {
    (base_note as usize + offset).min(127) as u8
}
