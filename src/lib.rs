/// Roundabout - A real-time MIDI step sequencer whose rings branch into each other
///
/// This library provides the sequencing core and a host session:
/// - Sequencers: 16-step rings with per-step note masks and branch connections
/// - Engine: sample-accurate step scheduling inside the audio callback
/// - Wait-free event queues between the callback and everything else
/// - A cpal/midir host session that runs the engine

pub mod audio;
pub mod channel;
pub mod engine;
pub mod error;
pub mod midi;
pub mod sequencer;

// Re-export commonly used types
pub use audio::{HostConfig, Roundabout};
pub use channel::{InboundEvent, Notification};
pub use engine::{
    ChannelObserver, Engine, EngineConfig, EngineHandle, LoggingObserver, LossCounter,
    NotificationReceiver, NotificationWorker, SequencerObserver, TransportClock, TransportControl, TransportPosition,
};
pub use error::{HostError, HostResult};
pub use midi::{
    available_input_ports, available_output_ports, midi_note_name, MidiEvent, MidiEventKind, MidiScheduler,
};
pub use sequencer::{
    Connection, NoteMask, Sequencer, SequencerArena, SequencerId, Step, DEFAULT_BASE_NOTE,
    MAX_CHANNEL, NOTE_COUNT, STEP_COUNT,
};
