//! Coarse streaming playback for hosts without the precise audio graph
//!
//! When the sample-accurate context cannot be created the engine falls
//! back to simple streaming players, modeled by [`MediaElement`]. Such
//! elements only report completion after the fact and cannot promise a
//! zero-gap restart, so seamless looping is emulated: restart immediately
//! on the completion signal, and force an early restart once the polled
//! position crosses the loop clamp boundary. Phase alignment under this
//! strategy is best-effort (sub-100ms jitter), unlike the primary
//! engine's exact alignment.

use looplab_clip::{ClipSource, TrackId};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from fallback playback elements
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FallbackError {
    #[error("playback element failed: {0}")]
    Element(String),
    #[error("element not ready within {0:?}")]
    NotReady(Duration),
}

/// A host-provided coarse streaming player
///
/// The embedder supplies these through a [`MediaElementFactory`]; the
/// engine only drives timing and lifecycle. All methods are called from
/// engine-owned threads, never from a real-time callback.
pub trait MediaElement: Send {
    /// Begin or continue playback from the current position
    fn play(&mut self) -> Result<(), FallbackError>;
    /// Pause playback, keeping the position
    fn pause(&mut self);
    /// Seek back to position zero
    fn rewind(&mut self);
    /// Current playback position in seconds
    fn position_secs(&mut self) -> f64;
    /// Toggle the element's own mute flag
    fn set_muted(&mut self, muted: bool);
    /// Latched completion signal; returns true at most once per playthrough
    fn take_ended(&mut self) -> bool;
    /// Whether enough is buffered to play through without stalling
    fn is_ready(&mut self) -> bool;
}

/// Builds a streaming element for one track's encoded source
pub trait MediaElementFactory: Send + Sync {
    fn create(
        &self,
        track_id: TrackId,
        source: &Arc<dyn ClipSource>,
    ) -> Result<Box<dyn MediaElement>, FallbackError>;
}

/// A fallback voice waiting to be installed into the player
pub struct FallbackPlan {
    pub track_id: TrackId,
    pub element: Box<dyn MediaElement>,
    pub muted: bool,
    /// Position at which a restart is forced for overlong clips
    pub loop_end_secs: f64,
}

/// Restart state of one fallback voice
///
/// Two independent triggers (the completion signal and the position
/// poll) funnel through one `restart()`, so they can never race each
/// other into a doubled restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoiceState {
    Playing,
    RestartPending,
}

struct FallbackVoice {
    track_id: TrackId,
    element: Box<dyn MediaElement>,
    loop_end_secs: f64,
    state: VoiceState,
}

impl FallbackVoice {
    fn poll(&mut self) {
        match self.state {
            VoiceState::Playing => {
                let ended = self.element.take_ended();
                let past_boundary = self.element.position_secs() >= self.loop_end_secs;
                if ended || past_boundary {
                    self.restart();
                }
            }
            // A restart is already in progress; the triggers that fired
            // meanwhile are satisfied by it
            VoiceState::RestartPending => {}
        }
    }

    fn restart(&mut self) {
        self.state = VoiceState::RestartPending;
        self.element.rewind();
        if let Err(e) = self.element.play() {
            warn!(track_id = %self.track_id, %e, "fallback restart failed");
        }
        self.state = VoiceState::Playing;
    }

    fn halt(&mut self) {
        self.element.pause();
        self.element.rewind();
    }
}

struct PlayerShared {
    voices: Vec<FallbackVoice>,
}

/// Drives fallback voices: best-effort synchronized start, loop restart
/// emulation, mute, and cleanup
///
/// Cloneable handle; the poll thread exits once the last handle is gone.
#[derive(Clone)]
pub struct FallbackPlayer {
    shared: Arc<Mutex<PlayerShared>>,
    ready_timeout: Duration,
}

impl FallbackPlayer {
    pub fn new(poll_interval: Duration, ready_timeout: Duration) -> Self {
        let shared = Arc::new(Mutex::new(PlayerShared { voices: Vec::new() }));
        spawn_poll_thread(Arc::downgrade(&shared), poll_interval);
        Self {
            shared,
            ready_timeout,
        }
    }

    /// Block until every plan's element is buffered, or its deadline hits
    ///
    /// Returns the ready plans and a failure per element that never
    /// buffered. Called on a coordinator thread, never the caller's.
    pub fn wait_ready(
        &self,
        plans: Vec<FallbackPlan>,
    ) -> (Vec<FallbackPlan>, Vec<(TrackId, FallbackError)>) {
        let deadline = Instant::now() + self.ready_timeout;
        let mut pending = plans;
        let mut ready = Vec::with_capacity(pending.len());

        loop {
            let mut still_pending = Vec::new();
            for mut plan in pending {
                if plan.element.is_ready() {
                    ready.push(plan);
                } else {
                    still_pending.push(plan);
                }
            }
            pending = still_pending;

            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let failures = pending
            .into_iter()
            .map(|plan| (plan.track_id, FallbackError::NotReady(self.ready_timeout)))
            .collect();
        (ready, failures)
    }

    /// Install the session's voices and issue their play commands
    /// back-to-back
    ///
    /// `wanted` is consulted under the player lock right before starting,
    /// so a track removed while its element was buffering never starts.
    /// Replaces any previous session's voices.
    pub fn install_and_start(
        &self,
        plans: Vec<FallbackPlan>,
        wanted: &dyn Fn(TrackId) -> bool,
    ) -> (Vec<TrackId>, Vec<(TrackId, FallbackError)>) {
        let mut shared = self.shared.lock();
        for voice in &mut shared.voices {
            voice.halt();
        }
        shared.voices.clear();

        let mut started = Vec::new();
        let mut failures = Vec::new();

        let mut voices = Vec::with_capacity(plans.len());
        for mut plan in plans {
            if !wanted(plan.track_id) {
                debug!(track_id = %plan.track_id, "skipping unwanted fallback voice");
                continue;
            }
            plan.element.set_muted(plan.muted);
            voices.push(FallbackVoice {
                track_id: plan.track_id,
                element: plan.element,
                loop_end_secs: plan.loop_end_secs,
                state: VoiceState::Playing,
            });
        }

        // Back-to-back play issuance: as close to simultaneous as this
        // strategy can get
        for voice in &mut voices {
            match voice.element.play() {
                Ok(()) => started.push(voice.track_id),
                Err(e) => failures.push((voice.track_id, e)),
            }
        }
        voices.retain(|v| started.contains(&v.track_id));
        shared.voices = voices;

        (started, failures)
    }

    /// Pause, rewind, and drop every voice; idempotent
    ///
    /// Dropping the voices releases their elements and with them any
    /// restart listeners, so removal and re-creation never leak.
    pub fn stop_all(&self) {
        let mut shared = self.shared.lock();
        for voice in &mut shared.voices {
            voice.halt();
        }
        shared.voices.clear();
    }

    /// Toggle one element's mute flag
    pub fn set_muted(&self, track_id: TrackId, muted: bool) {
        let mut shared = self.shared.lock();
        if let Some(voice) = shared
            .voices
            .iter_mut()
            .find(|v| v.track_id == track_id)
        {
            voice.element.set_muted(muted);
        }
    }

    /// Halt and drop one voice, if present
    pub fn remove(&self, track_id: TrackId) {
        let mut shared = self.shared.lock();
        shared.voices.retain_mut(|voice| {
            if voice.track_id == track_id {
                voice.halt();
                false
            } else {
                true
            }
        });
    }

    /// Track ids with a live fallback voice
    pub fn active_tracks(&self) -> Vec<TrackId> {
        self.shared.lock().voices.iter().map(|v| v.track_id).collect()
    }
}

/// Poll loop driving restart emulation
///
/// Holds only a weak reference: the thread ends on its own once every
/// player handle is dropped.
fn spawn_poll_thread(shared: Weak<Mutex<PlayerShared>>, poll_interval: Duration) {
    thread::spawn(move || loop {
        thread::sleep(poll_interval);
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let mut shared = shared.lock();
        for voice in &mut shared.voices {
            voice.poll();
        }
    });
}
