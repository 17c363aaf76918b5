//! Loop window derivation from tempo
//!
//! Generated clips arrive with imprecise durations, so playback conforms
//! every track to a canonical window derived from the session tempo: the
//! smallest whole-measure duration at or above a musical floor.

use thiserror::Error;

/// Lowest tempo the product accepts from the user.
pub const SUPPORTED_BPM_MIN: f32 = 60.0;
/// Highest tempo the product accepts from the user.
pub const SUPPORTED_BPM_MAX: f32 = 200.0;

/// Errors from loop window computation
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum TempoError {
    #[error("invalid tempo: {bpm} bpm")]
    InvalidTempo { bpm: f32 },
}

/// Tuning for loop window derivation
///
/// The defaults mirror the generation service's cost/latency sweet spot:
/// clips are requested in the 8-10 second range, and the window floor sits
/// at the top of that band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowParams {
    /// Minimum musical duration a loop must cover, in seconds
    pub floor_secs: f64,
    /// Lower edge of the acceptable clip-duration band (diagnostics only)
    pub tolerance_min_secs: f64,
    /// Upper edge of the acceptable clip-duration band
    pub tolerance_max_secs: f64,
}

impl Default for WindowParams {
    fn default() -> Self {
        Self {
            floor_secs: 10.0,
            tolerance_min_secs: 8.0,
            tolerance_max_secs: 10.0,
        }
    }
}

/// The canonical loop duration for one playback session
///
/// Invariant: `min_secs <= target_secs <= max_secs`. `target_secs` is a
/// whole number of bars at the session tempo; `max_secs` is the boundary
/// voices clamp their loop region to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopWindow {
    pub min_secs: f64,
    pub max_secs: f64,
    pub target_secs: f64,
}

impl LoopWindow {
    /// Loop region length for a clip of the given natural duration
    ///
    /// Clips longer than the window are clamped so the audible loop stays
    /// musically consistent across tracks; shorter clips loop over their
    /// full natural length.
    pub fn loop_region_secs(&self, clip_duration_secs: f64) -> f64 {
        clip_duration_secs.min(self.max_secs)
    }
}

/// Whether a tempo is inside the range the product supports
///
/// Callers reject out-of-range tempo changes before the window calculator
/// is ever reached; [`compute_loop_window`] itself only refuses tempos
/// that make the math meaningless (non-finite or <= 0).
pub fn supported_bpm(bpm: f32) -> bool {
    bpm.is_finite() && (SUPPORTED_BPM_MIN..=SUPPORTED_BPM_MAX).contains(&bpm)
}

/// Compute the loop window for a tempo
///
/// `target_secs` is the smallest whole-bar duration at or above
/// `params.floor_secs`, rounded to millisecond precision so repeated
/// wrap arithmetic does not accumulate floating-point drift. The
/// tolerance band is widened to contain the target, keeping the window
/// invariant at every tempo.
pub fn compute_loop_window(
    bpm: f32,
    beats_per_bar: u32,
    params: &WindowParams,
) -> Result<LoopWindow, TempoError> {
    if !bpm.is_finite() || bpm <= 0.0 {
        return Err(TempoError::InvalidTempo { bpm });
    }

    let seconds_per_bar = 60.0 / bpm as f64 * beats_per_bar.max(1) as f64;
    let bars = (params.floor_secs / seconds_per_bar).ceil().max(1.0);
    let target_secs = round_ms(bars * seconds_per_bar);

    Ok(LoopWindow {
        min_secs: params.tolerance_min_secs.min(target_secs),
        max_secs: params.tolerance_max_secs.max(target_secs),
        target_secs,
    })
}

/// Round to millisecond precision
fn round_ms(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}
