//! Per-track playback voice
//!
//! A voice binds one decoded clip to a looping read head and a smoothed
//! gain. All voices of a session advance in lockstep inside the same
//! render callback, which is what keeps the tracks in phase.

use looplab_clip::{DecodedClip, TrackId};
use looplab_timing::LoopWindow;
use std::sync::Arc;

/// Smoothing coefficient for mute/unmute gain moves (~5ms at 48kHz)
const GAIN_SMOOTH_COEFF: f32 = 0.995;

/// One playing track
pub struct TrackVoice {
    track_id: TrackId,
    /// Interleaved stereo samples, borrowed from the clip store's clip
    samples: Arc<Vec<f32>>,
    /// Loop region length in frames; the read head never crosses it
    loop_frames: usize,
    /// Read position in clip frames (fractional for interpolation)
    position: f64,
    /// Clip frames consumed per device frame
    step: f64,
    /// Smoothed gain, approaching `target_gain` per frame
    gain: f32,
    target_gain: f32,
    stopped: bool,
}

impl TrackVoice {
    /// Create a voice looping `clip` inside `window`
    ///
    /// A clip longer than the window loops over `[0, window.max_secs)` so
    /// the audible loop stays consistent across tracks; a shorter clip
    /// loops over its full natural length. The voice starts at offset 0
    /// with the requested mute state already applied, so there is no
    /// audible ramp at session start.
    pub fn new(
        track_id: TrackId,
        clip: &DecodedClip,
        window: &LoopWindow,
        device_sample_rate: u32,
        muted: bool,
    ) -> Self {
        let region_secs = window.loop_region_secs(clip.duration_secs);
        let region_frames = (region_secs * clip.sample_rate as f64).round() as usize;
        let loop_frames = region_frames.min(clip.frames()).max(1);
        let gain = if muted { 0.0 } else { 1.0 };

        Self {
            track_id,
            samples: Arc::clone(&clip.samples),
            loop_frames,
            position: 0.0,
            step: clip.sample_rate as f64 / device_sample_rate.max(1) as f64,
            gain,
            target_gain: gain,
            stopped: false,
        }
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    pub fn is_muted(&self) -> bool {
        self.target_gain == 0.0
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Current read position in clip frames (for diagnostics and tests)
    pub fn position_frames(&self) -> f64 {
        self.position
    }

    /// Loop region length in frames
    pub fn loop_frames(&self) -> usize {
        self.loop_frames
    }

    /// Silence or restore this voice without touching its read head
    ///
    /// The gain ramps over a few milliseconds to avoid clicks; playback
    /// position keeps advancing, so unmuting rejoins in phase.
    pub fn set_muted(&mut self, muted: bool) {
        self.target_gain = if muted { 0.0 } else { 1.0 };
    }

    /// Halt this voice; idempotent
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Mix this voice into an interleaved stereo buffer
    pub fn render_into(&mut self, output: &mut [f32]) {
        if self.stopped {
            return;
        }

        let loop_len = self.loop_frames as f64;

        for frame in output.chunks_exact_mut(2) {
            self.gain =
                GAIN_SMOOTH_COEFF * self.gain + (1.0 - GAIN_SMOOTH_COEFF) * self.target_gain;

            let i0 = self.position as usize;
            let frac = (self.position - i0 as f64) as f32;
            // Interpolate across the loop seam for a gapless wrap
            let i1 = if i0 + 1 >= self.loop_frames { 0 } else { i0 + 1 };

            let l0 = self.samples[i0 * 2];
            let r0 = self.samples[i0 * 2 + 1];
            let l1 = self.samples[i1 * 2];
            let r1 = self.samples[i1 * 2 + 1];

            frame[0] += (l0 + frac * (l1 - l0)) * self.gain;
            frame[1] += (r0 + frac * (r1 - r0)) * self.gain;

            self.position += self.step;
            while self.position >= loop_len {
                self.position -= loop_len;
            }
        }
    }
}
