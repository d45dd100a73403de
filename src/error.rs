/// Host session error types
use thiserror::Error;

/// Failure to establish the audio/MIDI host session.
///
/// None of these are fatal to the process; the caller decides whether to
/// retry, fall back or exit.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("No audio output device found")]
    NoDevice,

    #[error("Failed to get device config: {0}")]
    Config(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedSampleFormat(String),

    #[error("Failed to build stream: {0}")]
    StreamBuild(String),

    #[error("Failed to start stream: {0}")]
    StreamPlay(String),

    #[error("MIDI error: {0}")]
    Midi(String),

    #[error("MIDI port not found: {0}")]
    MidiPortNotFound(String),

    #[error("Failed to spawn notification worker: {0}")]
    Worker(#[from] std::io::Error),
}

pub type HostResult<T> = Result<T, HostError>;
