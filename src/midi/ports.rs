/// MIDI input/output port registration using midir
use midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use rtrb::Producer;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::{RawMidi, StampedMidi};
use crate::engine::LossCounter;
use crate::error::{HostError, HostResult};

/// Live input connection; incoming messages are stamped and queued.
pub type MidiInputHandle = MidiInputConnection<InputQueue>;

/// What the midir input callback writes into.
pub struct InputQueue {
    producer: Producer<StampedMidi>,
    dropped: Arc<AtomicU64>,
}

impl InputQueue {
    pub fn new(producer: Producer<StampedMidi>) -> Self {
        Self {
            producer,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Messages lost because the callback fell behind.
    pub fn loss_counter(&self) -> LossCounter {
        LossCounter::new("MIDI input messages dropped (queue full)", Arc::clone(&self.dropped))
    }

    fn push(&mut self, received: Instant, message: &[u8]) {
        let Some(message) = RawMidi::from_bytes(0, message) else {
            return;
        };
        if self.producer.push(StampedMidi { received, message }).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// The MIDI side of a host session.
pub struct MidiPorts {
    pub input: Option<MidiInputHandle>,
    pub output: Option<MidiOutputConnection>,
}

impl MidiPorts {
    /// Register one input and one output port.
    ///
    /// With a name filter the first system port whose name contains it is
    /// used; without one a virtual port named after the client is created
    /// (Unix only).
    pub fn open(
        client_name: &str,
        input_filter: Option<&str>,
        output_filter: Option<&str>,
        input_queue: InputQueue,
    ) -> HostResult<Self> {
        let input = open_input(client_name, input_filter, input_queue)?;
        let output = open_output(client_name, output_filter)?;
        Ok(Self { input, output })
    }
}

pub fn available_input_ports() -> Vec<String> {
    if let Ok(midi_in) = MidiInput::new("Roundabout MIDI Input") {
        midi_in
            .ports()
            .iter()
            .filter_map(|p| midi_in.port_name(p).ok())
            .collect()
    } else {
        vec![]
    }
}

pub fn available_output_ports() -> Vec<String> {
    if let Ok(midi_out) = MidiOutput::new("Roundabout MIDI Output") {
        midi_out
            .ports()
            .iter()
            .filter_map(|p| midi_out.port_name(p).ok())
            .collect()
    } else {
        vec![]
    }
}

fn forward_message(_stamp: u64, message: &[u8], queue: &mut InputQueue) {
    // midir stamps have a per-backend origin; the callback needs wall time
    queue.push(Instant::now(), message);
}

fn open_input(
    client_name: &str,
    filter: Option<&str>,
    queue: InputQueue,
) -> HostResult<Option<MidiInputHandle>> {
    let midi_in = MidiInput::new(client_name)
        .map_err(|e| HostError::Midi(format!("Failed to create MIDI input: {}", e)))?;

    let Some(filter) = filter else {
        return open_virtual_input(midi_in, client_name, queue);
    };

    let ports = midi_in.ports();
    let port = ports
        .iter()
        .find(|p| {
            midi_in
                .port_name(p)
                .map(|name| name.contains(filter))
                .unwrap_or(false)
        })
        .cloned()
        .ok_or_else(|| HostError::MidiPortNotFound(filter.to_string()))?;

    let name = midi_in.port_name(&port).unwrap_or_default();
    let connection = midi_in
        .connect(&port, "roundabout-in", forward_message, queue)
        .map_err(|e| HostError::Midi(format!("Failed to connect input: {}", e)))?;
    log::info!(target: "roundabout::midi", "MIDI input connected to {}", name);
    Ok(Some(connection))
}

fn open_output(client_name: &str, filter: Option<&str>) -> HostResult<Option<MidiOutputConnection>> {
    let midi_out = MidiOutput::new(client_name)
        .map_err(|e| HostError::Midi(format!("Failed to create MIDI output: {}", e)))?;

    let Some(filter) = filter else {
        return open_virtual_output(midi_out, client_name);
    };

    let ports = midi_out.ports();
    let port = ports
        .iter()
        .find(|p| {
            midi_out
                .port_name(p)
                .map(|name| name.contains(filter))
                .unwrap_or(false)
        })
        .cloned()
        .ok_or_else(|| HostError::MidiPortNotFound(filter.to_string()))?;

    let name = midi_out.port_name(&port).unwrap_or_default();
    let connection = midi_out
        .connect(&port, "roundabout-out")
        .map_err(|e| HostError::Midi(format!("Failed to connect output: {}", e)))?;
    log::info!(target: "roundabout::midi", "MIDI output connected to {}", name);
    Ok(Some(connection))
}

#[cfg(unix)]
fn open_virtual_input(
    midi_in: MidiInput,
    client_name: &str,
    queue: InputQueue,
) -> HostResult<Option<MidiInputHandle>> {
    use midir::os::unix::VirtualInput;

    let connection = midi_in
        .create_virtual(client_name, forward_message, queue)
        .map_err(|e| HostError::Midi(format!("Failed to create virtual input: {}", e)))?;
    log::info!(target: "roundabout::midi", "Created virtual MIDI input '{}'", client_name);
    Ok(Some(connection))
}

#[cfg(not(unix))]
fn open_virtual_input(
    _midi_in: MidiInput,
    _client_name: &str,
    _queue: InputQueue,
) -> HostResult<Option<MidiInputHandle>> {
    log::info!(target: "roundabout::midi", "No MIDI input selected");
    Ok(None)
}

#[cfg(unix)]
fn open_virtual_output(
    midi_out: MidiOutput,
    client_name: &str,
) -> HostResult<Option<MidiOutputConnection>> {
    use midir::os::unix::VirtualOutput;

    let connection = midi_out
        .create_virtual(client_name)
        .map_err(|e| HostError::Midi(format!("Failed to create virtual output: {}", e)))?;
    log::info!(target: "roundabout::midi", "Created virtual MIDI output '{}'", client_name);
    Ok(Some(connection))
}

#[cfg(not(unix))]
fn open_virtual_output(
    _midi_out: MidiOutput,
    _client_name: &str,
) -> HostResult<Option<MidiOutputConnection>> {
    log::info!(target: "roundabout::midi", "No MIDI output selected");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtrb::RingBuffer;

    #[test]
    fn test_input_queue_stamps_and_counts_drops() {
        let (producer, mut consumer) = RingBuffer::new(1);
        let mut queue = InputQueue::new(producer);
        let counter = queue.loss_counter();

        let before = Instant::now();
        forward_message(0, &[0x90, 64, 100], &mut queue);
        forward_message(0, &[0x90, 65, 100], &mut queue);
        // Sysex is not queued and not counted
        forward_message(0, &[0xF0, 1, 2, 3, 0xF7], &mut queue);

        let stamped = consumer.pop().unwrap();
        assert!(stamped.received >= before);
        assert_eq!(stamped.message.note_on(), Some((0, 64)));
        assert!(consumer.pop().is_err());
        assert_eq!(counter.get(), 1);
    }
}
