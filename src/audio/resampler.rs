//! Drift-compensating resampler
//!
//! Playback runs on a different clock than capture. The resampler nudges
//! the playback rate so the output queue hovers around
//! [`TARGET_QUEUED_MS`]: a PI controller handles small drift and a fixed
//! ratio snaps in when the queue is far off target.
//!
//! Resampling is linear interpolation between consecutive frames. The
//! fractional read position and the last frame of the previous buffer
//! carry over between calls, so interpolation is continuous across
//! buffer boundaries.

use crate::codec::pcm::clamp_i16;
use crate::constants::TARGET_QUEUED_MS;

/// Proportional gain of the ratio controller
const KP: f64 = 0.0002;
/// Integral gain of the ratio controller
const KI: f64 = 0.000002;
/// Anti-windup bound on the accumulated error (ms)
const INTEGRAL_LIMIT: f64 = 10000.0;
/// Largest deviation from unity the controller may request
const MAX_ADJUST: f64 = 0.10;
/// Error beyond which the controller is bypassed (ms)
const SNAP_ERROR_MS: f64 = 100.0;
/// Ratio used when the queue is far too full
const SNAP_FAST_RATIO: f64 = 1.10;
/// Ratio used when the queue is nearly drained
const SNAP_SLOW_RATIO: f64 = 0.95;
/// Ratios this close to 1.0 pass audio through untouched
const BYPASS_EPSILON: f64 = 0.00005;

#[derive(Debug, Clone)]
pub struct Resampler {
    playback_ratio: f64,
    integral: f64,
    /// Read position in frames; 0 is the cached previous frame
    position: f64,
    prev_frame: Vec<i16>,
    /// Output buffer (reused to avoid allocations)
    scratch: Vec<i16>,
}

impl Resampler {
    pub fn new() -> Self {
        Self {
            playback_ratio: 1.0,
            integral: 0.0,
            position: 0.0,
            prev_frame: Vec::new(),
            scratch: Vec::new(),
        }
    }

    /// Input frames consumed per output frame
    pub fn playback_ratio(&self) -> f64 {
        self.playback_ratio
    }

    /// Override the ratio directly
    pub fn set_playback_ratio(&mut self, ratio: f64) {
        self.playback_ratio = ratio;
    }

    /// Accumulated controller error
    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// Recompute the ratio from the sink's queued duration
    pub fn update_playback_ratio(&mut self, queued_ms: u64) -> f64 {
        let error = queued_ms as f64 - TARGET_QUEUED_MS;

        if error > SNAP_ERROR_MS {
            self.playback_ratio = SNAP_FAST_RATIO;
            return self.playback_ratio;
        }
        if error < -SNAP_ERROR_MS {
            self.playback_ratio = SNAP_SLOW_RATIO;
            return self.playback_ratio;
        }

        self.integral = (self.integral + error).clamp(-INTEGRAL_LIMIT, INTEGRAL_LIMIT);
        let adjust = (error * KP + self.integral * KI).clamp(-MAX_ADJUST, MAX_ADJUST);
        self.playback_ratio = (1.0 + adjust).clamp(1.0 - MAX_ADJUST, 1.0 + MAX_ADJUST);
        self.playback_ratio
    }

    /// Resample one interleaved buffer at the current ratio
    pub fn process<'a>(&'a mut self, input: &'a [i16], channels: usize) -> &'a [i16] {
        if channels == 0 {
            return &[];
        }

        if (self.playback_ratio - 1.0).abs() < BYPASS_EPSILON {
            self.remember_last_frame(input, channels);
            return input;
        }

        let input_frames = input.len() / channels;
        if input_frames <= 1 {
            self.scratch.clear();
            self.scratch.extend_from_slice(input);
            return &self.scratch;
        }

        if self.prev_frame.len() != channels {
            self.prev_frame.clear();
            self.prev_frame.extend_from_slice(&input[..channels]);
            self.position = 1.0;
        }

        let ratio = self.playback_ratio;
        let estimated = ((input_frames as f64 / ratio) + 4.0) as usize;
        self.scratch.clear();
        self.scratch.reserve(estimated.max(8) * channels);

        let prev = &self.prev_frame;
        let sample = |frame: usize, channel: usize| -> i32 {
            if frame == 0 {
                prev[channel] as i32
            } else {
                input[(frame - 1) * channels + channel] as i32
            }
        };

        // frame 0 is the cached frame, so there are input_frames + 1 to read
        let effective_frames = input_frames + 1;
        let mut pos = self.position;
        loop {
            let base = pos as usize;
            if base + 1 >= effective_frames {
                break;
            }
            let frac = pos - base as f64;
            for c in 0..channels {
                let s0 = sample(base, c);
                let s1 = sample(base + 1, c);
                let v = (s0 as f64 + (s1 - s0) as f64 * frac) as i32;
                self.scratch.push(clamp_i16(v));
            }
            pos += ratio;
        }

        self.position = pos - input_frames as f64;
        self.remember_last_frame(input, channels);
        &self.scratch
    }

    fn remember_last_frame(&mut self, input: &[i16], channels: usize) {
        let frames = input.len() / channels;
        if frames == 0 {
            return;
        }
        let last = (frames - 1) * channels;
        if self.prev_frame.len() != channels {
            // start interpolating at the next buffer's first frame
            self.position = 1.0;
        }
        self.prev_frame.clear();
        self.prev_frame.extend_from_slice(&input[last..last + channels]);
    }

    pub fn reset(&mut self) {
        self.position = 0.0;
        self.prev_frame.clear();
        self.integral = 0.0;
        self.playback_ratio = 1.0;
    }
}

impl Default for Resampler {
    fn default() -> Self {
        Self::new()
    }
}
