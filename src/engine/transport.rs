/// Musical transport position as seen by the process callback
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub const DEFAULT_BPM: f64 = 120.0;
pub const DEFAULT_BEATS_PER_BAR: f64 = 4.0;
pub const DEFAULT_TICKS_PER_BEAT: f64 = 1920.0;

/// Bars-beats-ticks position at the first frame of a buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportPosition {
    pub rolling: bool,
    /// Whether the BBT fields below carry meaning.
    pub valid: bool,
    pub frame: u64,
    pub frame_rate: u32,
    pub bpm: f64,
    pub beats_per_bar: f64,
    pub ticks_per_beat: f64,
    /// 1-based
    pub bar: u32,
    /// 1-based
    pub beat: u32,
    /// Fractional ticks into the current beat.
    pub tick: f64,
}

impl TransportPosition {
    /// A halted transport with no musical position.
    pub fn stopped(frame_rate: u32) -> Self {
        Self {
            rolling: false,
            valid: false,
            frame: 0,
            frame_rate,
            bpm: DEFAULT_BPM,
            beats_per_bar: DEFAULT_BEATS_PER_BAR,
            ticks_per_beat: DEFAULT_TICKS_PER_BEAT,
            bar: 1,
            beat: 1,
            tick: 0.0,
        }
    }

    /// BBT fields are present and describe a usable tempo.
    pub fn is_valid(&self) -> bool {
        self.valid
            && self.frame_rate > 0
            && self.bpm > 0.0
            && self.ticks_per_beat > 0.0
            && self.beats_per_bar > 0.0
    }

    /// Beats elapsed since the start of the song.
    pub fn beats(&self) -> f64 {
        let whole = (self.bar.saturating_sub(1) as f64) * self.beats_per_bar
            + self.beat.saturating_sub(1) as f64;
        whole + self.tick / self.ticks_per_beat
    }

    pub fn frames_per_beat(&self) -> f64 {
        self.frame_rate as f64 * 60.0 / self.bpm
    }
}

/// Transport controls shared with non-real-time threads.
#[derive(Debug)]
pub struct TransportControl {
    rolling: AtomicBool,
    bpm_bits: AtomicU64,
    locate_request: AtomicU64,
}

const NO_LOCATE: u64 = u64::MAX;

impl TransportControl {
    pub fn new(bpm: f64) -> Self {
        Self {
            rolling: AtomicBool::new(false),
            bpm_bits: AtomicU64::new(bpm.to_bits()),
            locate_request: AtomicU64::new(NO_LOCATE),
        }
    }

    pub fn start(&self) {
        self.rolling.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.rolling.store(false, Ordering::Release);
    }

    pub fn is_rolling(&self) -> bool {
        self.rolling.load(Ordering::Acquire)
    }

    pub fn set_bpm(&self, bpm: f64) {
        if bpm.is_finite() && bpm > 0.0 {
            self.bpm_bits.store(bpm.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn bpm(&self) -> f64 {
        f64::from_bits(self.bpm_bits.load(Ordering::Relaxed))
    }

    /// Move the transport to `frame` at the start of the next buffer.
    pub fn locate(&self, frame: u64) {
        self.locate_request.store(frame.min(NO_LOCATE - 1), Ordering::Release);
    }

    fn take_locate(&self) -> Option<u64> {
        match self.locate_request.swap(NO_LOCATE, Ordering::AcqRel) {
            NO_LOCATE => None,
            frame => Some(frame),
        }
    }
}

impl Default for TransportControl {
    fn default() -> Self {
        Self::new(DEFAULT_BPM)
    }
}

/// Frame-driven transport for hosts without a shared musical clock.
///
/// Produces the BBT position at the start of each buffer from a running
/// frame counter. Tempo changes rebase the beat count so the position stays
/// continuous.
#[derive(Debug)]
pub struct TransportClock {
    control: Arc<TransportControl>,
    frame_rate: u32,
    frame: u64,
    beats_per_bar: f64,
    ticks_per_beat: f64,
    bpm: f64,
    anchor_frame: u64,
    anchor_beats: f64,
}

impl TransportClock {
    pub fn new(frame_rate: u32, control: Arc<TransportControl>) -> Self {
        let bpm = control.bpm();
        Self {
            control,
            frame_rate,
            frame: 0,
            beats_per_bar: DEFAULT_BEATS_PER_BAR,
            ticks_per_beat: DEFAULT_TICKS_PER_BEAT,
            bpm,
            anchor_frame: 0,
            anchor_beats: 0.0,
        }
    }

    pub fn control(&self) -> &Arc<TransportControl> {
        &self.control
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    /// Position at the start of the coming buffer; advances by `frames` while rolling.
    pub fn next_buffer(&mut self, frames: u32) -> TransportPosition {
        if let Some(frame) = self.control.take_locate() {
            self.frame = frame;
            self.anchor_frame = frame;
            self.anchor_beats = frame as f64 / self.frames_per_beat(self.bpm);
        }

        let bpm = self.control.bpm();
        if bpm != self.bpm {
            self.anchor_beats = self.beats_at(self.frame);
            self.anchor_frame = self.frame;
            self.bpm = bpm;
        }

        let rolling = self.control.is_rolling();
        let position = self.position(rolling);
        if rolling {
            self.frame += frames as u64;
        }
        position
    }

    fn frames_per_beat(&self, bpm: f64) -> f64 {
        self.frame_rate as f64 * 60.0 / bpm
    }

    fn beats_at(&self, frame: u64) -> f64 {
        self.anchor_beats + (frame - self.anchor_frame) as f64 / self.frames_per_beat(self.bpm)
    }

    fn position(&self, rolling: bool) -> TransportPosition {
        let beats = self.beats_at(self.frame);
        let whole_beats = beats.floor();
        let bar = (whole_beats / self.beats_per_bar).floor();
        let beat = whole_beats - bar * self.beats_per_bar;

        TransportPosition {
            rolling,
            valid: true,
            frame: self.frame,
            frame_rate: self.frame_rate,
            bpm: self.bpm,
            beats_per_bar: self.beats_per_bar,
            ticks_per_beat: self.ticks_per_beat,
            bar: bar as u32 + 1,
            beat: beat as u32 + 1,
            tick: (beats - whole_beats) * self.ticks_per_beat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn clock(frame_rate: u32, bpm: f64) -> TransportClock {
        TransportClock::new(frame_rate, Arc::new(TransportControl::new(bpm)))
    }

    #[test]
    fn test_stopped_clock_holds_position() {
        let mut clock = clock(48000, 120.0);
        let first = clock.next_buffer(512);
        let second = clock.next_buffer(512);
        assert!(!first.rolling);
        assert_eq!(first.frame, 0);
        assert_eq!(second.frame, 0);
    }

    #[test]
    fn test_bbt_from_frames() {
        let mut clock = clock(48000, 120.0);
        clock.control().start();
        // 24000 frames per beat; skip 5.5 beats
        for _ in 0..(24000 * 11 / 2 / 1000) {
            clock.next_buffer(1000);
        }
        let position = clock.next_buffer(1000);
        assert!(position.rolling);
        assert_eq!(position.frame, 132000);
        assert_eq!(position.bar, 2);
        assert_eq!(position.beat, 2);
        assert_relative_eq!(position.tick, 960.0, epsilon = 1e-6);
        assert_relative_eq!(position.beats(), 5.5, epsilon = 1e-9);
    }

    #[test]
    fn test_tempo_change_keeps_position_continuous() {
        let mut clock = clock(44100, 120.0);
        clock.control().start();
        for _ in 0..10 {
            clock.next_buffer(2205);
        }
        // 22050 frames at 120 bpm = 1 beat
        clock.control().set_bpm(60.0);
        let at_change = clock.next_buffer(44100);
        assert_relative_eq!(at_change.beats(), 1.0, epsilon = 1e-9);
        let after = clock.next_buffer(44100);
        assert_relative_eq!(after.beats(), 2.0, epsilon = 1e-9);
        assert_relative_eq!(after.bpm, 60.0);
    }

    #[test]
    fn test_locate() {
        let mut clock = clock(48000, 120.0);
        clock.control().locate(48000);
        let position = clock.next_buffer(256);
        assert_eq!(position.frame, 48000);
        assert_relative_eq!(position.beats(), 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_invalid_positions() {
        assert!(!TransportPosition::stopped(48000).is_valid());
        let mut position = clock(48000, 120.0).next_buffer(64);
        assert!(position.is_valid());
        position.bpm = 0.0;
        assert!(!position.is_valid());
    }

    #[test]
    fn test_rejects_bad_bpm() {
        let control = TransportControl::new(100.0);
        control.set_bpm(-3.0);
        control.set_bpm(f64::NAN);
        assert_relative_eq!(control.bpm(), 100.0);
    }
}
