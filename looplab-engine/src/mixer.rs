//! Session mixer - the render-side voice set
//!
//! The mixer lives behind one mutex shared by the audio callback and the
//! control side. Installing a whole session under a single lock is what
//! gives the engine its core guarantee: every voice renders its first
//! sample in the same callback buffer.

use crate::voice::TrackVoice;
use looplab_clip::TrackId;

/// Mixes the active voices of one playback session
pub struct SessionMixer {
    voices: Vec<TrackVoice>,
}

impl Default for SessionMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMixer {
    pub fn new() -> Self {
        Self { voices: Vec::new() }
    }

    /// Replace the playing session with a new set of voices
    ///
    /// The previous session's voices are dropped here, so a fresh
    /// `install` never overlaps old audio with new: the swap happens
    /// between two render callbacks. At most one voice per track
    /// survives; a duplicate id keeps its first voice only.
    pub fn install_session(&mut self, voices: Vec<TrackVoice>) {
        self.voices.clear();
        for voice in voices {
            if !self.voices.iter().any(|v| v.track_id() == voice.track_id()) {
                self.voices.push(voice);
            }
        }
    }

    /// Stop and drop every voice
    pub fn stop_all(&mut self) {
        for voice in &mut self.voices {
            voice.stop();
        }
        self.voices.clear();
    }

    /// Retarget one voice's gain; other voices are untouched
    pub fn set_muted(&mut self, track_id: TrackId, muted: bool) {
        if let Some(voice) = self.voices.iter_mut().find(|v| v.track_id() == track_id) {
            voice.set_muted(muted);
        }
    }

    /// Stop and drop the voice for one track, if present
    pub fn remove_voice(&mut self, track_id: TrackId) {
        self.voices.retain_mut(|voice| {
            if voice.track_id() == track_id {
                voice.stop();
                false
            } else {
                true
            }
        });
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    /// Track ids with a live voice
    pub fn active_tracks(&self) -> Vec<TrackId> {
        self.voices.iter().map(|v| v.track_id()).collect()
    }

    /// Whether the voice for a track is currently muted
    pub fn is_muted(&self, track_id: TrackId) -> Option<bool> {
        self.voices
            .iter()
            .find(|v| v.track_id() == track_id)
            .map(|v| v.is_muted())
    }

    /// Render all voices into an interleaved stereo buffer
    pub fn process(&mut self, output: &mut [f32]) {
        output.fill(0.0);

        for voice in &mut self.voices {
            voice.render_into(output);
        }
        self.voices.retain(|v| !v.is_stopped());

        for sample in output.iter_mut() {
            *sample = soft_clip(*sample);
        }
    }
}

/// Soft clip threshold - lower value gives headroom before limiting
const SOFT_CLIP_THRESHOLD: f32 = 0.75;
/// Soft clip ceiling
const SOFT_CLIP_CEILING: f32 = 0.89;

/// Gentle soft clipper for the mix bus
///
/// Transparent below the threshold; above it, an exponential knee
/// approaches the ceiling so stacked unison tracks cannot hard-clip.
#[inline(always)]
fn soft_clip(x: f32) -> f32 {
    let abs_x = x.abs();

    if abs_x <= SOFT_CLIP_THRESHOLD {
        return x;
    }

    let sign = x.signum();
    let knee_width = SOFT_CLIP_CEILING - SOFT_CLIP_THRESHOLD;
    let over = abs_x - SOFT_CLIP_THRESHOLD;
    let ratio = over / knee_width;

    let compressed = SOFT_CLIP_THRESHOLD + knee_width * (1.0 - (-ratio * 3.0).exp());
    sign * compressed.min(SOFT_CLIP_CEILING)
}
