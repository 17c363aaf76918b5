//! Loop timing for LoopLab
//!
//! Pure, deterministic derivation of the loop window every
//! simultaneously-playing track conforms to. No I/O, no threads.

mod window;

pub use window::{
    compute_loop_window, supported_bpm, LoopWindow, TempoError, WindowParams, SUPPORTED_BPM_MAX,
    SUPPORTED_BPM_MIN,
};
