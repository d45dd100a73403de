/// Host session: cpal output stream as the process callback, midir for MIDI
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rtrb::{Consumer, RingBuffer};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::transport::DEFAULT_BPM;
use crate::engine::{
    Engine, EngineConfig, EngineHandle, NotificationWorker, SequencerObserver, TransportClock,
    TransportControl,
};
use crate::error::{HostError, HostResult};
use crate::midi::ports::{InputQueue, MidiInputHandle};
use crate::midi::scheduler::OUTPUT_QUEUE_CAPACITY;
use crate::midi::{MidiOutputQueue, MidiPorts, MidiScheduler, RawMidi, StampedMidi};

/// Incoming MIDI messages buffered between the MIDI thread and the callback.
const MIDI_INPUT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Name used for the MIDI client and virtual ports.
    pub client_name: String,
    /// Connect MIDI input to the first port whose name contains this.
    pub midi_input: Option<String>,
    pub midi_output: Option<String>,
    pub bpm: f64,
    pub engine: EngineConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            client_name: "roundabout".to_string(),
            midi_input: None,
            midi_output: None,
            bpm: DEFAULT_BPM,
            engine: EngineConfig::default(),
        }
    }
}

/// A running sequencer session.
///
/// Owns the engine (inside the audio callback), the MIDI ports, the MIDI
/// output thread and the notification worker. Dropping it stops the stream
/// first, which drops the engine and lets the worker drain and exit, then
/// flushes MIDI output and joins the worker.
pub struct Roundabout {
    stream: Option<cpal::Stream>,
    scheduler: Option<MidiScheduler>,
    worker: Option<NotificationWorker>,
    _midi_input: Option<MidiInputHandle>,
    handle: EngineHandle,
    transport: Arc<TransportControl>,
    sample_rate: u32,
}

impl Roundabout {
    pub fn new(config: HostConfig, observers: Vec<Box<dyn SequencerObserver>>) -> HostResult<Self> {
        let (engine, handle, receiver) = Engine::new(config.engine.clone());

        let (midi_producer, midi_consumer) = RingBuffer::new(MIDI_INPUT_CAPACITY);
        let input_queue = InputQueue::new(midi_producer);
        let mut loss_counters = vec![input_queue.loss_counter()];
        let ports = MidiPorts::open(
            &config.client_name,
            config.midi_input.as_deref(),
            config.midi_output.as_deref(),
            input_queue,
        )?;

        let (scheduler, output_queue) = match ports.output {
            Some(connection) => {
                let (scheduler, queue) = MidiScheduler::spawn(connection, OUTPUT_QUEUE_CAPACITY)?;
                loss_counters.extend(scheduler.loss_counters());
                (Some(scheduler), Some(queue))
            }
            None => (None, None),
        };

        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(HostError::NoDevice)?;
        let supported = device
            .default_output_config()
            .map_err(|e| HostError::Config(e.to_string()))?;
        if supported.sample_format() != cpal::SampleFormat::F32 {
            return Err(HostError::UnsupportedSampleFormat(format!(
                "{:?}",
                supported.sample_format()
            )));
        }

        let stream_config: cpal::StreamConfig = supported.into();
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;
        log::info!(
            target: "roundabout::audio",
            "opening {} at {} Hz, {} channels",
            device.name().unwrap_or_else(|_| "output device".to_string()),
            sample_rate,
            channels
        );

        let transport = Arc::new(TransportControl::new(config.bpm));
        let mut process = ProcessCallback::new(
            engine,
            TransportClock::new(sample_rate, Arc::clone(&transport)),
            midi_consumer,
            output_queue,
            channels,
        );

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], info: &cpal::OutputCallbackInfo| process.run(data, info),
                |err| log::error!(target: "roundabout::audio", "stream error: {}", err),
                None,
            )
            .map_err(|e| HostError::StreamBuild(e.to_string()))?;
        stream.play().map_err(|e| HostError::StreamPlay(e.to_string()))?;

        // After the stream: the worker only exits once the engine is dropped
        let worker = NotificationWorker::spawn_with_counters(receiver, observers, loss_counters)?;

        Ok(Self {
            stream: Some(stream),
            scheduler,
            worker: Some(worker),
            _midi_input: ports.input,
            handle,
            transport,
            sample_rate,
        })
    }

    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    /// Start, stop, locate and tempo for the session's transport.
    pub fn transport(&self) -> &Arc<TransportControl> {
        &self.transport
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for Roundabout {
    fn drop(&mut self) {
        // The callback must be gone before the worker is told to stop
        self.stream.take();
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
        if let Some(worker) = self.worker.take() {
            worker.join();
        }
        log::debug!(target: "roundabout::audio", "session closed");
    }
}

/// State moved into the audio callback.
struct ProcessCallback {
    engine: Engine,
    clock: TransportClock,
    midi_input: Consumer<StampedMidi>,
    midi_buffer: Vec<RawMidi>,
    midi_output: Option<MidiOutputQueue>,
    channels: usize,
    previous_callback: Option<Instant>,
}

impl ProcessCallback {
    fn new(
        engine: Engine,
        clock: TransportClock,
        midi_input: Consumer<StampedMidi>,
        midi_output: Option<MidiOutputQueue>,
        channels: usize,
    ) -> Self {
        Self {
            engine,
            clock,
            midi_input,
            midi_buffer: Vec::with_capacity(MIDI_INPUT_CAPACITY),
            midi_output,
            channels: channels.max(1),
            previous_callback: None,
        }
    }

    fn run(&mut self, data: &mut [f32], info: &cpal::OutputCallbackInfo) {
        let timestamp = info.timestamp();
        let latency = timestamp
            .playback
            .duration_since(&timestamp.callback)
            .unwrap_or_default();
        self.run_at(data, Instant::now(), latency);
    }

    /// Process one buffer whose callback began at `now` and whose first frame
    /// is heard `latency` later.
    fn run_at(&mut self, data: &mut [f32], now: Instant, latency: Duration) {
        // Audio output is reserved; write silence
        data.fill(0.0);
        let frames = (data.len() / self.channels) as u32;
        let sample_rate = self.clock.frame_rate();

        self.midi_buffer.clear();
        while self.midi_buffer.len() < self.midi_buffer.capacity() {
            match self.midi_input.pop() {
                Ok(stamped) => {
                    let mut message = stamped.message;
                    message.time = input_offset(stamped.received, self.previous_callback, sample_rate, frames);
                    self.midi_buffer.push(message);
                }
                Err(_) => break,
            }
        }
        self.previous_callback = Some(now);

        let position = self.clock.next_buffer(frames);
        let events = self.engine.process(frames, &position, &self.midi_buffer);

        if let Some(output) = self.midi_output.as_mut() {
            let start = now + latency;
            for event in events {
                // A full queue is counted by the queue and reported by the worker
                output.push(output_due(start, event.time, sample_rate), event.to_bytes());
            }
        }
    }
}

/// Frame offset in the coming buffer for a message received at `received`.
///
/// Measured from the start of the previous callback, so messages keep their
/// spacing at the cost of one buffer of latency.
fn input_offset(received: Instant, previous_callback: Option<Instant>, sample_rate: u32, frames: u32) -> u32 {
    let Some(previous) = previous_callback else {
        return 0;
    };
    if frames == 0 {
        return 0;
    }
    let elapsed = received.saturating_duration_since(previous).as_secs_f64();
    ((elapsed * sample_rate as f64) as u64).min(frames as u64 - 1) as u32
}

/// When the event at `offset` should leave the port, given the moment the
/// buffer's first frame is heard.
fn output_due(start: Instant, offset: u32, sample_rate: u32) -> Instant {
    start + Duration::from_secs_f64(offset as f64 / sample_rate.max(1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Notification;
    use crate::midi::scheduler::ScheduledMidi;

    #[test]
    fn test_input_offset_keeps_spacing() {
        let previous = Instant::now();
        let at = |ms: u64| previous + Duration::from_millis(ms);
        assert_eq!(input_offset(at(0), Some(previous), 48000, 512), 0);
        assert_eq!(input_offset(at(5), Some(previous), 48000, 512), 240);
        assert_eq!(input_offset(at(10), Some(previous), 48000, 512), 480);
        // Late arrivals land on the last frame
        assert_eq!(input_offset(at(50), Some(previous), 48000, 512), 511);
    }

    #[test]
    fn test_input_offset_without_reference_is_zero() {
        let now = Instant::now();
        assert_eq!(input_offset(now, None, 48000, 512), 0);
        assert_eq!(input_offset(now, Some(now), 48000, 0), 0);
        // Received before the previous callback started
        assert_eq!(input_offset(now, Some(now + Duration::from_millis(3)), 48000, 512), 0);
    }

    #[test]
    fn test_output_due_follows_frame_offset() {
        let start = Instant::now();
        assert_eq!(output_due(start, 0, 48000), start);
        assert_eq!(output_due(start, 6000, 48000), start + Duration::from_millis(125));
        assert_eq!(output_due(start, 24000, 48000), start + Duration::from_millis(500));
    }

    #[test]
    fn test_callback_schedules_notes_at_their_offsets() {
        let (engine, handle, mut receiver) = Engine::new(EngineConfig::default());
        let transport = Arc::new(TransportControl::new(120.0));
        let (_input, midi_input) = RingBuffer::<StampedMidi>::new(8);
        let (queue, mut sent) = MidiOutputQueue::unsent(64);
        let mut process = ProcessCallback::new(
            engine,
            TransportClock::new(48000, Arc::clone(&transport)),
            midi_input,
            Some(queue),
            2,
        );

        let now = Instant::now();
        handle.create_sequencer();
        process.run_at(&mut [], now, Duration::ZERO);
        let mut id = None;
        receiver.drain(|n| {
            if let Notification::CreatedSequencer(created) = n {
                id = Some(created);
            }
        });
        let id = id.unwrap();
        for step in 0..16 {
            handle.toggle_step(id, step);
            handle.toggle_note(id, step, 0);
        }
        transport.start();

        // 6000 frames per step; one stereo buffer of 20000 frames
        let latency = Duration::from_millis(4);
        let mut data = vec![1.0f32; 40000];
        process.run_at(&mut data, now, latency);
        assert!(data.iter().all(|s| *s == 0.0));

        let mut note_ons = Vec::new();
        while let Ok(ScheduledMidi { due, bytes }) = sent.pop() {
            if bytes[0] & 0xF0 == 0x90 {
                note_ons.push(due);
            }
        }
        let start = now + latency;
        let expected: Vec<Instant> = [0u64, 125, 250, 375]
            .iter()
            .map(|ms| start + Duration::from_millis(*ms))
            .collect();
        assert_eq!(note_ons, expected);
    }
}
