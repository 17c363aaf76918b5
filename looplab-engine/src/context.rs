//! Shared audio output context
//!
//! One cpal stream for the whole process, created lazily because host
//! audio policy may refuse output until a user-initiated action. Only the
//! playback engine constructs, resumes, or suspends it; everything else
//! sees the mixer handle.

use crate::mixer::SessionMixer;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Lifecycle of the shared output context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextState {
    /// No stream exists yet (or none could be created)
    #[default]
    Uninitialized,
    /// Stream exists but is paused
    Suspended,
    /// Stream is delivering render callbacks
    Running,
}

/// Errors building or driving the output stream
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("no audio output device found")]
    NoDevice,
    #[error("failed to get audio config: {0}")]
    Config(String),
    #[error("failed to create audio stream: {0}")]
    Stream(String),
    #[error("failed to change stream state: {0}")]
    Transition(String),
}

/// Scratch size for channel-count adaptation (4096 stereo frames)
const ADAPT_BUFFER_SIZE: usize = 8192 * 2;

/// The live output stream plus the mixer it renders
pub struct AudioContext {
    // Held for its Drop; all interaction goes through play/pause
    stream: cpal::Stream,
    mixer: Arc<Mutex<SessionMixer>>,
    sample_rate: u32,
    state: ContextState,
}

impl AudioContext {
    /// Build the output stream on the default device, initially suspended
    ///
    /// The stream does not run until [`resume`](Self::resume) is called;
    /// starting output is an explicit transition, never a side effect of
    /// construction.
    pub fn new() -> Result<Self, ContextError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(ContextError::NoDevice)?;
        let config = device
            .default_output_config()
            .map_err(|e| ContextError::Config(e.to_string()))?;

        let sample_rate = config.sample_rate().0;
        let channels = config.channels() as usize;

        let mixer = Arc::new(Mutex::new(SessionMixer::new()));
        let mixer_for_callback = Arc::clone(&mixer);

        // Pre-allocated stereo scratch for non-stereo devices
        let mut adapt_buffer = vec![0.0f32; ADAPT_BUFFER_SIZE];

        let stream = device
            .build_output_stream(
                &config.into(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    // try_lock: on contention (rare) render silence rather
                    // than blocking the real-time thread
                    if let Some(mut mixer) = mixer_for_callback.try_lock() {
                        render_adapted(&mut mixer, data, channels, &mut adapt_buffer);
                    } else {
                        data.fill(0.0);
                    }
                },
                |err| {
                    warn!(%err, "audio stream error");
                },
                None,
            )
            .map_err(|e| ContextError::Stream(e.to_string()))?;

        // Leave it paused until the engine asks for playback
        let _ = stream.pause();

        info!(sample_rate, channels, "audio context created");

        Ok(Self {
            stream,
            mixer,
            sample_rate,
            state: ContextState::Suspended,
        })
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Handle to the mixer shared with the render callback
    pub fn mixer(&self) -> Arc<Mutex<SessionMixer>> {
        Arc::clone(&self.mixer)
    }

    /// Start (or restart) render callbacks
    pub fn resume(&mut self) -> Result<(), ContextError> {
        if self.state != ContextState::Running {
            self.stream
                .play()
                .map_err(|e| ContextError::Transition(e.to_string()))?;
            self.state = ContextState::Running;
        }
        Ok(())
    }

    /// Pause render callbacks, keeping the stream alive
    pub fn suspend(&mut self) -> Result<(), ContextError> {
        if self.state == ContextState::Running {
            self.stream
                .pause()
                .map_err(|e| ContextError::Transition(e.to_string()))?;
            self.state = ContextState::Suspended;
        }
        Ok(())
    }
}

/// Render the stereo mix into a device buffer of any channel count
fn render_adapted(
    mixer: &mut SessionMixer,
    data: &mut [f32],
    channels: usize,
    adapt_buffer: &mut Vec<f32>,
) {
    if channels == 2 {
        mixer.process(data);
        return;
    }

    let frames = data.len() / channels.max(1);
    let stereo_len = frames * 2;
    if adapt_buffer.len() < stereo_len {
        adapt_buffer.resize(stereo_len, 0.0);
    }
    let stereo = &mut adapt_buffer[..stereo_len];
    mixer.process(stereo);

    if channels == 1 {
        for (i, sample) in data.iter_mut().enumerate() {
            *sample = (stereo[i * 2] + stereo[i * 2 + 1]) * 0.5;
        }
    } else {
        // Put the mix on the first two channels, silence the rest
        for (frame_idx, frame) in data.chunks_mut(channels).enumerate() {
            frame[0] = stereo[frame_idx * 2];
            frame[1] = stereo[frame_idx * 2 + 1];
            for extra in frame.iter_mut().skip(2) {
                *extra = 0.0;
            }
        }
    }
}
