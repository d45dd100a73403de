/// MIDI messages produced and consumed by the engine
use std::time::Instant;

pub mod ports;
pub mod scheduler;

pub use ports::{available_input_ports, available_output_ports, MidiPorts};
pub use scheduler::{MidiOutputQueue, MidiScheduler, MidiSink, ScheduledMidi};

/// Velocity used for every generated note.
pub const NOTE_VELOCITY: u8 = 127;

const NOTE_ON: u8 = 0x90;
const NOTE_OFF: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiEventKind {
    NoteOn,
    NoteOff,
}

impl MidiEventKind {
    fn status(self) -> u8 {
        match self {
            MidiEventKind::NoteOn => NOTE_ON,
            MidiEventKind::NoteOff => NOTE_OFF,
        }
    }
}

/// A note event scheduled at a frame offset within the current buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    pub time: u32,
    pub channel: u8,
    pub note: u8,
    pub velocity: u8,
    pub kind: MidiEventKind,
}

impl MidiEvent {
    pub fn note_on(time: u32, channel: u8, note: u8) -> Self {
        Self::new(time, channel, note, MidiEventKind::NoteOn)
    }

    pub fn note_off(time: u32, channel: u8, note: u8) -> Self {
        Self::new(time, channel, note, MidiEventKind::NoteOff)
    }

    fn new(time: u32, channel: u8, note: u8, kind: MidiEventKind) -> Self {
        Self {
            time,
            channel: channel & 0x0F,
            note: note.min(127),
            velocity: NOTE_VELOCITY,
            kind,
        }
    }

    /// Standard 3-byte wire encoding.
    pub fn to_bytes(&self) -> [u8; 3] {
        [self.kind.status() | self.channel, self.note, self.velocity]
    }
}

/// Stable in-place sort by frame offset.
///
/// Insertion sort: the engine produces events almost in order already, and
/// unlike `slice::sort_by_key` this never allocates scratch space.
pub fn sort_by_time(events: &mut [MidiEvent]) {
    for i in 1..events.len() {
        let mut j = i;
        while j > 0 && events[j - 1].time > events[j].time {
            events.swap(j - 1, j);
            j -= 1;
        }
    }
}

/// An incoming short MIDI message, stamped with a frame offset in the current buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMidi {
    pub time: u32,
    pub bytes: [u8; 3],
    pub len: u8,
}

impl RawMidi {
    /// Wrap a message of 1 to 3 bytes. Longer messages (sysex) are ignored.
    pub fn from_bytes(time: u32, message: &[u8]) -> Option<Self> {
        if message.is_empty() || message.len() > 3 {
            return None;
        }
        let mut bytes = [0u8; 3];
        bytes[..message.len()].copy_from_slice(message);
        Some(Self {
            time,
            bytes,
            len: message.len() as u8,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// `(channel, note)` if this is a note-on with non-zero velocity.
    ///
    /// A note-on with velocity 0 is a note-off by convention.
    pub fn note_on(&self) -> Option<(u8, u8)> {
        if self.len < 3 || self.bytes[0] & 0xF0 != NOTE_ON || self.bytes[2] == 0 {
            return None;
        }
        Some((self.bytes[0] & 0x0F, self.bytes[1] & 0x7F))
    }
}

/// A message from the input port and when it arrived. The frame offset is
/// assigned by the audio callback that picks it up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StampedMidi {
    pub received: Instant,
    pub message: RawMidi,
}

pub fn midi_note_name(note: u8) -> String {
    let note_names = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
    let octave = (note / 12) as i32 - 1;
    let note_index = (note % 12) as usize;
    format!("{}{}", note_names[note_index], octave)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        assert_eq!(MidiEvent::note_on(0, 0, 60).to_bytes(), [0x90, 60, 127]);
        assert_eq!(MidiEvent::note_off(0, 9, 64).to_bytes(), [0x89, 64, 127]);
    }

    #[test]
    fn test_note_and_channel_clamped() {
        let event = MidiEvent::note_on(0, 0x13, 200);
        assert_eq!(event.note, 127);
        assert_eq!(event.channel, 3);
    }

    #[test]
    fn test_sort_is_stable() {
        let mut events = vec![
            MidiEvent::note_on(10, 0, 1),
            MidiEvent::note_off(5, 0, 2),
            MidiEvent::note_on(5, 0, 3),
            MidiEvent::note_off(0, 0, 4),
        ];
        sort_by_time(&mut events);
        let notes: Vec<u8> = events.iter().map(|e| e.note).collect();
        assert_eq!(notes, vec![4, 2, 3, 1]);
    }

    #[test]
    fn test_raw_note_on() {
        let msg = RawMidi::from_bytes(3, &[0x92, 62, 100]).unwrap();
        assert_eq!(msg.note_on(), Some((2, 62)));
        assert_eq!(msg.as_slice(), &[0x92, 62, 100]);

        let silent = RawMidi::from_bytes(0, &[0x92, 62, 0]).unwrap();
        assert_eq!(silent.note_on(), None);

        let off = RawMidi::from_bytes(0, &[0x82, 62, 64]).unwrap();
        assert_eq!(off.note_on(), None);

        assert!(RawMidi::from_bytes(0, &[]).is_none());
        assert!(RawMidi::from_bytes(0, &[0xF0, 1, 2, 3, 0xF7]).is_none());
    }

    #[test]
    fn test_note_names() {
        assert_eq!(midi_note_name(60), "C4");
        assert_eq!(midi_note_name(61), "C#4");
        assert_eq!(midi_note_name(0), "C-1");
    }
}
