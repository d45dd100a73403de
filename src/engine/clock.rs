/// Step boundary scheduling against the host transport
use super::transport::TransportPosition;

/// Default steps per beat (sixteenth notes).
pub const DEFAULT_STEPS_PER_BEAT: u32 = 4;

/// Finds the frame offsets at which step boundaries fall inside a buffer.
///
/// The step position is derived from the transport on every buffer, so
/// rounding never accumulates; each boundary is placed on the nearest frame.
#[derive(Debug, Clone)]
pub struct StepClock {
    steps_per_beat: u32,
    step_position: f64,
    // Set when the last boundary of a buffer fell on (or within a frame of)
    // its end, so the following buffer fires it at offset 0 instead of
    // treating it as already passed.
    step_expected_at_next_buffer_begin: bool,
}

impl StepClock {
    pub fn new(steps_per_beat: u32) -> Self {
        Self {
            steps_per_beat: steps_per_beat.max(1),
            step_position: 0.0,
            step_expected_at_next_buffer_begin: false,
        }
    }

    pub fn steps_per_beat(&self) -> u32 {
        self.steps_per_beat
    }

    pub fn set_steps_per_beat(&mut self, steps_per_beat: u32) {
        self.steps_per_beat = steps_per_beat.max(1);
    }

    /// Steps since song start at the beginning of the last scheduled buffer.
    pub fn step_position(&self) -> f64 {
        self.step_position
    }

    /// Frames between two boundaries at `position`'s tempo.
    pub fn frames_per_step(&self, position: &TransportPosition) -> f64 {
        position.frames_per_beat() / self.steps_per_beat as f64
    }

    /// Forget carried-over state, e.g. when the transport stops.
    pub fn reset(&mut self) {
        self.step_expected_at_next_buffer_begin = false;
    }

    /// Schedule the boundaries falling inside a buffer of `frames` frames.
    pub fn schedule(&mut self, position: &TransportPosition, frames: u32) -> StepBoundaries {
        let frames_per_step = self.frames_per_step(position);
        if !position.is_valid() || !frames_per_step.is_finite() || frames_per_step <= 0.0 {
            self.step_expected_at_next_buffer_begin = false;
            return StepBoundaries::empty();
        }

        self.step_position = position.beats() * self.steps_per_beat as f64;
        if frames == 0 {
            return StepBoundaries::empty();
        }

        let fraction = self.step_position - self.step_position.floor();
        let mut first = if fraction == 0.0 {
            0.0
        } else {
            (1.0 - fraction) * frames_per_step
        };

        // The boundary landed just before this buffer began. Keep its true
        // phase so later boundaries and the next guard are measured from it;
        // only the emitted offset is clamped to 0.
        if self.step_expected_at_next_buffer_begin && first > frames_per_step - 1.0 {
            first -= frames_per_step;
        }

        let mut count = 0u32;
        let mut pending = first;
        while (pending.round() as i64) < frames as i64 {
            count += 1;
            pending = first + count as f64 * frames_per_step;
        }
        self.step_expected_at_next_buffer_begin = pending - (frames as f64) < 1.0;

        StepBoundaries {
            first,
            frames_per_step,
            index: 0,
            count,
        }
    }
}

impl Default for StepClock {
    fn default() -> Self {
        Self::new(DEFAULT_STEPS_PER_BEAT)
    }
}

/// Frame offsets of the step boundaries in one buffer, ascending.
#[derive(Debug, Clone, Copy)]
pub struct StepBoundaries {
    first: f64,
    frames_per_step: f64,
    index: u32,
    count: u32,
}

impl StepBoundaries {
    fn empty() -> Self {
        Self {
            first: 0.0,
            frames_per_step: 0.0,
            index: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        (self.count - self.index) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Iterator for StepBoundaries {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.index >= self.count {
            return None;
        }
        let offset = self.first + self.index as f64 * self.frames_per_step;
        self.index += 1;
        Some(offset.round().max(0.0) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::transport::{TransportClock, TransportControl};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn rolling_clock(frame_rate: u32, bpm: f64) -> TransportClock {
        let control = Arc::new(TransportControl::new(bpm));
        control.start();
        TransportClock::new(frame_rate, control)
    }

    /// Absolute frames of every boundary over `buffers` buffers of `frames`.
    fn boundary_frames(frame_rate: u32, bpm: f64, steps_per_beat: u32, frames: u32, buffers: usize) -> Vec<u64> {
        let mut transport = rolling_clock(frame_rate, bpm);
        let mut clock = StepClock::new(steps_per_beat);
        let mut out = Vec::new();
        for _ in 0..buffers {
            let position = transport.next_buffer(frames);
            for offset in clock.schedule(&position, frames) {
                assert!(offset < frames);
                out.push(position.frame + offset as u64);
            }
        }
        out
    }

    #[test]
    fn test_frames_per_step() {
        let position = rolling_clock(44100, 120.0).next_buffer(0);
        let clock = StepClock::new(4);
        assert_relative_eq!(clock.frames_per_step(&position), 5512.5);
    }

    #[test]
    fn test_first_boundary_at_song_start() {
        let mut transport = rolling_clock(44100, 120.0);
        let mut clock = StepClock::default();
        let position = transport.next_buffer(256);
        let offsets: Vec<u32> = clock.schedule(&position, 256).collect();
        assert_eq!(offsets, vec![0]);
    }

    #[test]
    fn test_no_drift_over_many_steps() {
        let frames = boundary_frames(44100, 120.0, 4, 256, 2000);
        assert!(frames.len() >= 50);
        for (k, frame) in frames.iter().enumerate() {
            let exact = k as f64 * 5512.5;
            assert!((*frame as f64 - exact).abs() <= 1.0, "step {} at {} expected {}", k, frame, exact);
        }
        for pair in frames.windows(2) {
            let gap = (pair[1] - pair[0]) as f64;
            assert!((gap - 5512.5).abs() <= 1.0, "gap {}", gap);
        }
    }

    #[test]
    fn test_no_drift_with_awkward_buffer_sizes() {
        for &(rate, bpm, spb, frames) in &[
            (48000, 133.0, 4, 127),
            (44100, 97.3, 3, 1000),
            (96000, 174.0, 8, 256),
            (22050, 61.0, 2, 4096),
        ] {
            let boundaries = boundary_frames(rate, bpm, spb, frames, 3000);
            assert!(boundaries.len() >= 50);
            let per_step = rate as f64 * 60.0 / bpm / spb as f64;
            for (k, frame) in boundaries.iter().enumerate() {
                let exact = k as f64 * per_step;
                assert!((*frame as f64 - exact).abs() <= 1.0, "rate {} step {} at {} expected {}", rate, k, frame, exact);
            }
        }
    }

    #[test]
    fn test_boundary_on_buffer_edge_fires_once() {
        // 6000 frames per step; buffers of 6000 put every boundary on an edge
        for frames in [6000u32, 3000, 2000, 1500] {
            let boundaries = boundary_frames(48000, 120.0, 4, frames, 200);
            let expected: Vec<u64> = (0..boundaries.len() as u64).map(|k| k * 6000).collect();
            assert_eq!(boundaries, expected);
            assert_eq!(boundaries.len() as u64, (200 * frames as u64).div_ceil(6000));
        }
    }

    fn assert_every_boundary_on_time(rate: u32, bpm: f64, spb: u32, frames: u32, buffers: usize, min_steps: usize) {
        let per_step = rate as f64 * 60.0 / bpm / spb as f64;
        let boundaries = boundary_frames(rate, bpm, spb, frames, buffers);
        assert!(
            boundaries.len() >= min_steps,
            "rate {} bpm {} frames {}: only {} steps",
            rate,
            bpm,
            frames,
            boundaries.len()
        );
        for (k, frame) in boundaries.iter().enumerate() {
            let exact = k as f64 * per_step;
            assert!(
                (*frame as f64 - exact).abs() <= 1.0,
                "rate {} bpm {} frames {}: step {} at {} expected {}",
                rate,
                bpm,
                frames,
                k,
                frame,
                exact
            );
        }
    }

    #[test]
    fn test_buffer_just_longer_than_a_step() {
        // 4095.98 frames per step in 4096-frame buffers
        assert_every_boundary_on_time(44100, 161.5, 4, 4096, 200, 100);
        // 10897.86 frames per step in 10898-frame buffers
        assert_every_boundary_on_time(44100, 60.7, 4, 10898, 200, 100);
    }

    #[test]
    fn test_buffers_near_step_length_never_skip() {
        for &rate in &[44100u32, 48000] {
            let mut bpm = 60.0;
            while bpm < 200.0 {
                let per_step = rate as f64 * 60.0 / bpm / 4.0;
                for frames in [per_step.ceil() as u32, per_step.floor() as u32, per_step.ceil() as u32 + 1] {
                    assert_every_boundary_on_time(rate, bpm, 4, frames, 150, 100);
                }
                bpm += 7.3;
            }
        }
    }

    #[test]
    fn test_several_boundaries_in_one_buffer() {
        let mut transport = rolling_clock(48000, 120.0);
        let mut clock = StepClock::new(4);
        let position = transport.next_buffer(20000);
        let offsets: Vec<u32> = clock.schedule(&position, 20000).collect();
        assert_eq!(offsets, vec![0, 6000, 12000, 18000]);
    }

    #[test]
    fn test_invalid_position_schedules_nothing() {
        let mut clock = StepClock::default();
        let position = TransportPosition::stopped(48000);
        assert!(clock.schedule(&position, 512).is_empty());
    }

    #[test]
    fn test_mid_song_start() {
        let control = Arc::new(TransportControl::new(120.0));
        control.locate(1000);
        control.start();
        let mut transport = TransportClock::new(48000, control);
        let mut clock = StepClock::new(4);
        let position = transport.next_buffer(6000);
        let offsets: Vec<u32> = clock.schedule(&position, 6000).collect();
        assert_eq!(offsets, vec![5000]);
        assert_relative_eq!(clock.step_position(), 1000.0 / 6000.0, epsilon = 1e-12);
    }
}
