//! Playback engine - synchronized multi-track sessions
//!
//! The engine turns a registry's track list into one phase-aligned
//! playback session: it waits for every candidate clip to settle before
//! any voice starts (the synchronization barrier), installs all voices
//! under a single mixer lock (one scheduling instant), and keeps the
//! session healthy across mutes, removals, and per-track failures.

use crate::config::EngineConfig;
use crate::context::{AudioContext, ContextState};
use crate::fallback::{FallbackPlan, FallbackPlayer, MediaElementFactory};
use crate::mixer::SessionMixer;
use crate::track::Track;
use crate::voice::TrackVoice;
use crossbeam_channel::{unbounded, Receiver, Sender};
use looplab_clip::{ClipError, ClipSource, ClipStore, TrackId};
use looplab_timing::{compute_loop_window, supported_bpm, LoopWindow, TempoError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors the engine returns to its caller
///
/// Per-track failures never appear here; they surface as events so one
/// bad track cannot abort the rest of the session.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    InvalidTempo(#[from] TempoError),
    /// The precise audio graph cannot be created and no fallback factory
    /// is configured
    #[error("audio context unavailable: {0}")]
    ContextUnavailable(String),
}

/// Where a playback session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    /// Decodes are in flight; nothing is audible yet
    Preparing,
    Playing,
}

/// Snapshot of engine-wide state for the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    pub context: ContextState,
    pub phase: SessionPhase,
    /// Once true, the session stays on the coarse strategy for good
    pub fallback_engaged: bool,
}

/// Structured events sent to the registry/UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A session's voices are live. `approximate_sync` is true under the
    /// fallback strategy, where start alignment is best-effort.
    SessionStarted {
        started: Vec<TrackId>,
        approximate_sync: bool,
    },
    /// One track failed to fetch, decode, or start; the rest of the
    /// session is unaffected
    TrackFailed { track_id: TrackId, reason: String },
    /// A play request had nothing playable; informational, not an error
    NoPlayableTracks,
    /// The precise graph is unavailable; coarse playback takes over for
    /// the rest of the session
    FallbackEngaged { reason: String },
    /// All playback halted
    Stopped,
    /// A track was removed and its resources released
    TrackRemoved { track_id: TrackId },
}

/// One candidate track of a session being prepared
struct Candidate {
    track_id: TrackId,
    source: Arc<dyn ClipSource>,
    muted: bool,
}

/// Control-side state shared with session coordinators
struct ControlShared {
    /// Bumped by every `play_all` and `stop_all`; a coordinator whose
    /// session id no longer matches must not touch playback
    session_counter: u64,
    phase: SessionPhase,
    removed: HashSet<TrackId>,
    /// Mute intents recorded while a track has no live voice
    mute_overrides: HashMap<TrackId, bool>,
}

/// The active output strategy
enum Output {
    /// Nothing created yet; decided on first play
    Unstarted,
    Precise(AudioContext),
    Fallback(FallbackPlayer),
}

/// Resolved launch plan for one session, captured before the session
/// counter is bumped
enum SessionLaunch {
    Precise {
        device_sample_rate: u32,
        mixer: Arc<Mutex<SessionMixer>>,
    },
    Fallback {
        player: FallbackPlayer,
        factory: Arc<dyn MediaElementFactory>,
    },
}

/// Orchestrates synchronized playback of all tracks
pub struct PlaybackEngine {
    config: EngineConfig,
    store: Arc<ClipStore>,
    shared: Arc<Mutex<ControlShared>>,
    output: Output,
    fallback_factory: Option<Arc<dyn MediaElementFactory>>,
    event_tx: Sender<EngineEvent>,
    event_rx: Receiver<EngineEvent>,
}

impl PlaybackEngine {
    pub fn new(config: EngineConfig) -> Self {
        let store = Arc::new(ClipStore::new(
            config.target_sample_rate,
            config.fetch_timeout,
        ));
        let (event_tx, event_rx) = unbounded();
        Self {
            config,
            store,
            shared: Arc::new(Mutex::new(ControlShared {
                session_counter: 0,
                phase: SessionPhase::Idle,
                removed: HashSet::new(),
                mute_overrides: HashMap::new(),
            })),
            output: Output::Unstarted,
            fallback_factory: None,
            event_tx,
            event_rx,
        }
    }

    /// Engine that skips the precise graph entirely
    ///
    /// For hosts known to lack sample-accurate scheduling; every session
    /// runs on the coarse strategy from the start.
    pub fn with_fallback(config: EngineConfig, factory: Arc<dyn MediaElementFactory>) -> Self {
        let player = FallbackPlayer::new(config.fallback_poll_interval, config.fallback_ready_timeout);
        let mut engine = Self::new(config);
        engine.fallback_factory = Some(factory);
        engine.output = Output::Fallback(player);
        engine
    }

    /// Register the factory used if the precise graph turns out to be
    /// unavailable
    pub fn set_fallback_factory(&mut self, factory: Arc<dyn MediaElementFactory>) {
        self.fallback_factory = Some(factory);
    }

    /// Receiver for structured status and failure events
    pub fn events(&self) -> Receiver<EngineEvent> {
        self.event_rx.clone()
    }

    /// The clip store owning all decoded audio
    pub fn clip_store(&self) -> &Arc<ClipStore> {
        &self.store
    }

    pub fn status(&self) -> EngineStatus {
        let (context, fallback_engaged) = match &self.output {
            Output::Unstarted => (ContextState::Uninitialized, false),
            Output::Precise(ctx) => (ctx.state(), false),
            Output::Fallback(_) => (ContextState::Uninitialized, true),
        };
        EngineStatus {
            context,
            phase: self.shared.lock().phase,
            fallback_engaged,
        }
    }

    /// Start a synchronized session over every ready track
    ///
    /// Waits (off-thread) for all candidate decodes to settle before any
    /// voice starts, then starts them within one scheduling instant.
    /// Returns once the session is being prepared; progress and failures
    /// arrive as [`EngineEvent`]s. Because host audio policy may gate
    /// output on a user action, call this (or [`resume`](Self::resume))
    /// from a direct user gesture the first time.
    pub fn play_all(&mut self, tracks: &[Track], bpm: f32) -> Result<(), EngineError> {
        if !supported_bpm(bpm) {
            return Err(TempoError::InvalidTempo { bpm }.into());
        }
        // One window per session; tempo changes apply from the next play
        let window = compute_loop_window(bpm, self.config.beats_per_bar, &self.config.window)?;

        let candidates: Vec<Candidate> = {
            let shared = self.shared.lock();
            tracks
                .iter()
                .filter(|t| t.is_playable() && !shared.removed.contains(&t.id))
                .filter_map(|t| {
                    let source = t.source.as_ref()?;
                    Some(Candidate {
                        track_id: t.id,
                        source: Arc::clone(source),
                        muted: shared.mute_overrides.get(&t.id).copied().unwrap_or(t.muted),
                    })
                })
                .collect()
        };

        if candidates.is_empty() {
            debug!("play requested with no playable tracks");
            let _ = self.event_tx.send(EngineEvent::NoPlayableTracks);
            return Ok(());
        }

        self.ensure_output()?;

        // Resolve everything fallible before committing to a new session,
        // so an early error never leaves the phase stuck in Preparing
        let launch = match &mut self.output {
            Output::Precise(ctx) => {
                ctx.resume()
                    .map_err(|e| EngineError::ContextUnavailable(e.to_string()))?;
                SessionLaunch::Precise {
                    device_sample_rate: ctx.sample_rate(),
                    mixer: ctx.mixer(),
                }
            }
            Output::Fallback(player) => {
                let factory = match &self.fallback_factory {
                    Some(f) => Arc::clone(f),
                    None => {
                        return Err(EngineError::ContextUnavailable(
                            "no fallback playback factory configured".into(),
                        ))
                    }
                };
                SessionLaunch::Fallback {
                    player: player.clone(),
                    factory,
                }
            }
            Output::Unstarted => {
                return Err(EngineError::ContextUnavailable(
                    "output strategy not initialized".into(),
                ))
            }
        };

        let session = {
            let mut shared = self.shared.lock();
            shared.session_counter += 1;
            shared.phase = SessionPhase::Preparing;
            shared.session_counter
        };
        info!(session, tracks = candidates.len(), bpm, "preparing session");

        match launch {
            SessionLaunch::Precise {
                device_sample_rate,
                mixer,
            } => {
                let args = PreciseSessionArgs {
                    session,
                    window,
                    device_sample_rate,
                    mixer,
                    store: Arc::clone(&self.store),
                    shared: Arc::clone(&self.shared),
                    event_tx: self.event_tx.clone(),
                    candidates,
                };
                thread::spawn(move || run_precise_session(args));
            }
            SessionLaunch::Fallback { player, factory } => {
                let args = FallbackSessionArgs {
                    session,
                    window,
                    player,
                    factory,
                    shared: Arc::clone(&self.shared),
                    event_tx: self.event_tx.clone(),
                    candidates,
                };
                thread::spawn(move || run_fallback_session(args));
            }
        }

        Ok(())
    }

    /// Stop every active voice; idempotent and safe while idle
    ///
    /// Also invalidates any session still being prepared, so decodes
    /// that settle later are discarded instead of started.
    pub fn stop_all(&mut self) {
        {
            let mut shared = self.shared.lock();
            shared.session_counter += 1;
            shared.phase = SessionPhase::Idle;
        }
        match &mut self.output {
            Output::Precise(ctx) => ctx.mixer().lock().stop_all(),
            Output::Fallback(player) => player.stop_all(),
            Output::Unstarted => {}
        }
        let _ = self.event_tx.send(EngineEvent::Stopped);
    }

    /// Mute or unmute one track
    ///
    /// A live voice is retargeted immediately (audible by the next render
    /// callback) without disturbing its phase; either way the intent is
    /// recorded for the next session.
    pub fn set_track_muted(&mut self, track_id: TrackId, muted: bool) {
        self.shared.lock().mute_overrides.insert(track_id, muted);
        match &mut self.output {
            Output::Precise(ctx) => ctx.mixer().lock().set_muted(track_id, muted),
            Output::Fallback(player) => player.set_muted(track_id, muted),
            Output::Unstarted => {}
        }
    }

    /// Remove a track from playback and release its resources
    ///
    /// The track stops if playing, its decoded data is evicted, and no
    /// future or in-flight session will start it again.
    pub fn remove_track(&mut self, track_id: TrackId) {
        {
            let mut shared = self.shared.lock();
            shared.removed.insert(track_id);
            shared.mute_overrides.remove(&track_id);
        }
        match &mut self.output {
            Output::Precise(ctx) => ctx.mixer().lock().remove_voice(track_id),
            Output::Fallback(player) => player.remove(track_id),
            Output::Unstarted => {}
        }
        self.store.evict(track_id);
        let _ = self.event_tx.send(EngineEvent::TrackRemoved { track_id });
    }

    /// Resume the output context, creating it if needed
    ///
    /// Host audio policy may require this to happen inside a direct user
    /// action.
    pub fn resume(&mut self) -> Result<(), EngineError> {
        self.ensure_output()?;
        if let Output::Precise(ctx) = &mut self.output {
            ctx.resume()
                .map_err(|e| EngineError::ContextUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    /// Suspend the output context, keeping all state
    pub fn suspend(&mut self) -> Result<(), EngineError> {
        if let Output::Precise(ctx) = &mut self.output {
            ctx.suspend()
                .map_err(|e| EngineError::ContextUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    /// Resolve the output strategy, lazily and once
    fn ensure_output(&mut self) -> Result<(), EngineError> {
        if !matches!(self.output, Output::Unstarted) {
            return Ok(());
        }
        match AudioContext::new() {
            Ok(ctx) => {
                self.output = Output::Precise(ctx);
                Ok(())
            }
            Err(e) => {
                if self.fallback_factory.is_some() {
                    warn!(%e, "precise audio graph unavailable, engaging fallback");
                    let player = FallbackPlayer::new(
                        self.config.fallback_poll_interval,
                        self.config.fallback_ready_timeout,
                    );
                    self.output = Output::Fallback(player);
                    let _ = self.event_tx.send(EngineEvent::FallbackEngaged {
                        reason: e.to_string(),
                    });
                    Ok(())
                } else {
                    Err(EngineError::ContextUnavailable(e.to_string()))
                }
            }
        }
    }
}

struct PreciseSessionArgs {
    session: u64,
    window: LoopWindow,
    device_sample_rate: u32,
    mixer: Arc<Mutex<SessionMixer>>,
    store: Arc<ClipStore>,
    shared: Arc<Mutex<ControlShared>>,
    event_tx: Sender<EngineEvent>,
    candidates: Vec<Candidate>,
}

/// Decode fan-out, barrier, and synchronized start for one session
fn run_precise_session(args: PreciseSessionArgs) {
    let PreciseSessionArgs {
        session,
        window,
        device_sample_rate,
        mixer,
        store,
        shared,
        event_tx,
        candidates,
    } = args;

    // Fan out one decode worker per candidate
    let (tx, rx) = unbounded();
    for (index, candidate) in candidates.into_iter().enumerate() {
        let tx = tx.clone();
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let outcome = store.ensure_decoded(candidate.track_id, &candidate.source);
            let _ = tx.send((index, candidate.track_id, candidate.muted, outcome));
        });
    }
    drop(tx);

    // The barrier: every decode has settled (success, failure, or
    // timeout) before anything below runs
    let mut outcomes: Vec<_> = rx.iter().collect();
    // Workers settle in decode order; restore the registry's track order
    outcomes.sort_by_key(|(index, ..)| *index);

    let mut shared = shared.lock();
    if shared.session_counter != session {
        debug!(session, "session superseded before start");
        return;
    }

    let mut voices = Vec::new();
    let mut started = Vec::new();
    for (_, track_id, default_muted, outcome) in outcomes {
        if shared.removed.contains(&track_id) {
            // Removal already reported by remove_track
            continue;
        }
        match outcome {
            Ok(clip) => {
                let muted = shared
                    .mute_overrides
                    .get(&track_id)
                    .copied()
                    .unwrap_or(default_muted);
                voices.push(TrackVoice::new(
                    track_id,
                    &clip,
                    &window,
                    device_sample_rate,
                    muted,
                ));
                started.push(track_id);
            }
            Err(ClipError::Evicted) => {
                debug!(%track_id, "decode disowned by removal");
            }
            Err(e) => {
                let _ = event_tx.send(EngineEvent::TrackFailed {
                    track_id,
                    reason: e.to_string(),
                });
            }
        }
    }

    if voices.is_empty() {
        shared.phase = SessionPhase::Idle;
        let _ = event_tx.send(EngineEvent::NoPlayableTracks);
        return;
    }

    // Single lock, single instant: every voice renders its first sample
    // in the same callback buffer
    mixer.lock().install_session(voices);
    shared.phase = SessionPhase::Playing;
    info!(session, started = started.len(), "session playing");
    let _ = event_tx.send(EngineEvent::SessionStarted {
        started,
        approximate_sync: false,
    });
}

struct FallbackSessionArgs {
    session: u64,
    window: LoopWindow,
    player: FallbackPlayer,
    factory: Arc<dyn MediaElementFactory>,
    shared: Arc<Mutex<ControlShared>>,
    event_tx: Sender<EngineEvent>,
    candidates: Vec<Candidate>,
}

/// Element creation, buffered-wait, and best-effort start for one session
fn run_fallback_session(args: FallbackSessionArgs) {
    let FallbackSessionArgs {
        session,
        window,
        player,
        factory,
        shared,
        event_tx,
        candidates,
    } = args;

    let mut plans = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match factory.create(candidate.track_id, &candidate.source) {
            Ok(element) => plans.push(FallbackPlan {
                track_id: candidate.track_id,
                element,
                muted: candidate.muted,
                loop_end_secs: window.max_secs,
            }),
            Err(e) => {
                let _ = event_tx.send(EngineEvent::TrackFailed {
                    track_id: candidate.track_id,
                    reason: e.to_string(),
                });
            }
        }
    }

    // Best-effort barrier: wait until every element is buffered enough
    // to play through, bounded by the ready timeout
    let (ready, not_ready) = player.wait_ready(plans);
    for (track_id, e) in not_ready {
        let _ = event_tx.send(EngineEvent::TrackFailed {
            track_id,
            reason: e.to_string(),
        });
    }

    let mut shared = shared.lock();
    if shared.session_counter != session {
        debug!(session, "fallback session superseded before start");
        return;
    }

    // Apply mute intents recorded while we were buffering
    let overrides = shared.mute_overrides.clone();
    let removed = shared.removed.clone();
    let ready: Vec<FallbackPlan> = ready
        .into_iter()
        .map(|mut plan| {
            if let Some(muted) = overrides.get(&plan.track_id) {
                plan.muted = *muted;
            }
            plan
        })
        .collect();

    let (started, failures) = player.install_and_start(ready, &|id| !removed.contains(&id));
    for (track_id, e) in failures {
        let _ = event_tx.send(EngineEvent::TrackFailed {
            track_id,
            reason: e.to_string(),
        });
    }

    if started.is_empty() {
        shared.phase = SessionPhase::Idle;
        let _ = event_tx.send(EngineEvent::NoPlayableTracks);
        return;
    }

    shared.phase = SessionPhase::Playing;
    info!(session, started = started.len(), "fallback session playing");
    let _ = event_tx.send(EngineEvent::SessionStarted {
        started,
        approximate_sync: true,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::mock::{MockElement, MockElementState};
    use crate::fallback::MediaElement;
    use looplab_clip::BytesClipSource;
    use std::time::Duration;

    /// Build a PCM16 mono WAV byte stream for decode-path tests
    fn wav_bytes(frames: usize, sample_rate: u32) -> Vec<u8> {
        let data_len = (frames * 2) as u32;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let s = ((t * 220.0 * std::f32::consts::TAU).sin() * 0.4 * i16::MAX as f32) as i16;
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            target_sample_rate: 44100,
            fetch_timeout: Duration::from_secs(2),
            fallback_ready_timeout: Duration::from_millis(400),
            fallback_poll_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn ready_track(id: u64) -> Track {
        let source = BytesClipSource::new(format!("gen-{id}"), wav_bytes(4410, 44100))
            .with_ext("wav");
        Track::new(TrackId(id), format!("instrument-{id}")).with_source(Arc::new(source))
    }

    fn pending_track(id: u64) -> Track {
        Track::new(TrackId(id), format!("instrument-{id}"))
    }

    fn wait_for_event(
        rx: &Receiver<EngineEvent>,
        mut pred: impl FnMut(&EngineEvent) -> bool,
    ) -> EngineEvent {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let remaining = deadline
                .checked_duration_since(std::time::Instant::now())
                .expect("timed out waiting for event");
            let event = rx.recv_timeout(remaining).expect("event channel");
            if pred(&event) {
                return event;
            }
        }
    }

    /// Scriptable element factory backing the fallback strategy in tests
    #[derive(Default)]
    struct MockFactory {
        states: Mutex<HashMap<TrackId, Arc<Mutex<MockElementState>>>>,
        fail_create: Mutex<HashSet<TrackId>>,
        start_unready: Mutex<HashSet<TrackId>>,
    }

    impl MockFactory {
        fn state(&self, id: TrackId) -> Arc<Mutex<MockElementState>> {
            self.states
                .lock()
                .get(&id)
                .cloned()
                .expect("element was created")
        }
    }

    impl MediaElementFactory for MockFactory {
        fn create(
            &self,
            track_id: TrackId,
            _source: &Arc<dyn ClipSource>,
        ) -> Result<Box<dyn MediaElement>, crate::fallback::FallbackError> {
            if self.fail_create.lock().contains(&track_id) {
                return Err(crate::fallback::FallbackError::Element(
                    "element creation refused".into(),
                ));
            }
            let (element, state) = if self.start_unready.lock().contains(&track_id) {
                MockElement::unready()
            } else {
                MockElement::ready()
            };
            self.states.lock().insert(track_id, state);
            Ok(Box::new(element))
        }
    }

    fn fallback_engine() -> (PlaybackEngine, Arc<MockFactory>) {
        let factory = Arc::new(MockFactory::default());
        let engine = PlaybackEngine::with_fallback(test_config(), factory.clone());
        (engine, factory)
    }

    #[test]
    fn test_invalid_tempo_rejected_before_anything_runs() {
        let (mut engine, _factory) = fallback_engine();
        let tracks = vec![ready_track(1)];
        assert!(matches!(
            engine.play_all(&tracks, 30.0),
            Err(EngineError::InvalidTempo(_))
        ));
        assert!(matches!(
            engine.play_all(&tracks, 250.0),
            Err(EngineError::InvalidTempo(_))
        ));
        assert_eq!(engine.status().phase, SessionPhase::Idle);
    }

    #[test]
    fn test_no_playable_tracks_is_reported() {
        let (mut engine, _factory) = fallback_engine();
        let events = engine.events();
        engine.play_all(&[pending_track(1)], 120.0).unwrap();
        wait_for_event(&events, |e| *e == EngineEvent::NoPlayableTracks);
        assert_eq!(engine.status().phase, SessionPhase::Idle);
    }

    #[test]
    fn test_session_starts_all_ready_tracks() {
        let (mut engine, factory) = fallback_engine();
        let events = engine.events();
        let tracks = vec![ready_track(1), ready_track(2)];

        engine.play_all(&tracks, 120.0).unwrap();
        let event =
            wait_for_event(&events, |e| matches!(e, EngineEvent::SessionStarted { .. }));
        assert_eq!(
            event,
            EngineEvent::SessionStarted {
                started: vec![TrackId(1), TrackId(2)],
                approximate_sync: true,
            }
        );
        assert!(factory.state(TrackId(1)).lock().playing);
        assert!(factory.state(TrackId(2)).lock().playing);
        assert_eq!(engine.status().phase, SessionPhase::Playing);
        assert!(engine.status().fallback_engaged);
    }

    #[test]
    fn test_failed_track_degrades_alone() {
        let (mut engine, factory) = fallback_engine();
        factory.fail_create.lock().insert(TrackId(2));
        let events = engine.events();
        let tracks = vec![ready_track(1), ready_track(2), ready_track(3)];

        engine.play_all(&tracks, 120.0).unwrap();
        let failed =
            wait_for_event(&events, |e| matches!(e, EngineEvent::TrackFailed { .. }));
        assert!(matches!(
            failed,
            EngineEvent::TrackFailed { track_id: TrackId(2), .. }
        ));
        let started =
            wait_for_event(&events, |e| matches!(e, EngineEvent::SessionStarted { .. }));
        assert_eq!(
            started,
            EngineEvent::SessionStarted {
                started: vec![TrackId(1), TrackId(3)],
                approximate_sync: true,
            }
        );
    }

    #[test]
    fn test_mute_while_playing_targets_one_track() {
        let (mut engine, factory) = fallback_engine();
        let events = engine.events();
        engine
            .play_all(&[ready_track(1), ready_track(2)], 120.0)
            .unwrap();
        wait_for_event(&events, |e| matches!(e, EngineEvent::SessionStarted { .. }));

        engine.set_track_muted(TrackId(1), true);
        assert!(factory.state(TrackId(1)).lock().muted);
        assert!(!factory.state(TrackId(2)).lock().muted);
        assert!(factory.state(TrackId(1)).lock().playing);
    }

    #[test]
    fn test_mute_intent_recorded_while_idle() {
        let (mut engine, factory) = fallback_engine();
        let events = engine.events();

        // No session yet: the intent is stored for the next play
        engine.set_track_muted(TrackId(1), true);

        engine
            .play_all(&[ready_track(1), ready_track(2)], 120.0)
            .unwrap();
        wait_for_event(&events, |e| matches!(e, EngineEvent::SessionStarted { .. }));
        assert!(factory.state(TrackId(1)).lock().muted);
        assert!(!factory.state(TrackId(2)).lock().muted);
    }

    #[test]
    fn test_remove_track_stops_and_excludes_it() {
        let (mut engine, factory) = fallback_engine();
        let events = engine.events();
        let tracks = vec![ready_track(1), ready_track(2)];
        engine.play_all(&tracks, 120.0).unwrap();
        wait_for_event(&events, |e| matches!(e, EngineEvent::SessionStarted { .. }));

        engine.remove_track(TrackId(2));
        wait_for_event(&events, |e| {
            *e == EngineEvent::TrackRemoved { track_id: TrackId(2) }
        });
        assert!(!factory.state(TrackId(2)).lock().playing);

        // The registry still lists it, but it is never started again
        engine.play_all(&tracks, 120.0).unwrap();
        let started =
            wait_for_event(&events, |e| matches!(e, EngineEvent::SessionStarted { .. }));
        assert_eq!(
            started,
            EngineEvent::SessionStarted {
                started: vec![TrackId(1)],
                approximate_sync: true,
            }
        );
    }

    #[test]
    fn test_removal_during_preparation_prevents_start() {
        let (mut engine, factory) = fallback_engine();
        factory.start_unready.lock().insert(TrackId(1));
        let events = engine.events();

        engine
            .play_all(&[ready_track(1), ready_track(2)], 120.0)
            .unwrap();

        // The session is stuck buffering track 1; remove it mid-flight
        thread::sleep(Duration::from_millis(50));
        engine.remove_track(TrackId(1));
        factory.state(TrackId(1)).lock().ready = true;

        let started =
            wait_for_event(&events, |e| matches!(e, EngineEvent::SessionStarted { .. }));
        assert_eq!(
            started,
            EngineEvent::SessionStarted {
                started: vec![TrackId(2)],
                approximate_sync: true,
            }
        );
        // Removed while preparing: its element must never have played
        assert_eq!(factory.state(TrackId(1)).lock().play_calls, 0);
    }

    #[test]
    fn test_stop_all_then_play_all_starts_fresh() {
        let (mut engine, factory) = fallback_engine();
        let events = engine.events();
        engine.play_all(&[ready_track(1)], 120.0).unwrap();
        wait_for_event(&events, |e| matches!(e, EngineEvent::SessionStarted { .. }));
        let first_state = factory.state(TrackId(1));

        engine.stop_all();
        wait_for_event(&events, |e| *e == EngineEvent::Stopped);
        {
            let s = first_state.lock();
            assert!(!s.playing);
            assert_eq!(s.position_secs, 0.0);
        }
        assert_eq!(engine.status().phase, SessionPhase::Idle);

        // Stop again while idle: no error, no residual effect
        engine.stop_all();

        engine.play_all(&[ready_track(1)], 120.0).unwrap();
        wait_for_event(&events, |e| matches!(e, EngineEvent::SessionStarted { .. }));
        // A fresh element is playing; the old one stayed stopped
        assert!(factory.state(TrackId(1)).lock().playing);
        assert!(!first_state.lock().playing);
    }

    #[test]
    fn test_stop_all_invalidates_inflight_session() {
        let (mut engine, factory) = fallback_engine();
        factory.start_unready.lock().insert(TrackId(1));
        let events = engine.events();

        engine.play_all(&[ready_track(1)], 120.0).unwrap();
        thread::sleep(Duration::from_millis(50));
        engine.stop_all();
        factory.state(TrackId(1)).lock().ready = true;

        wait_for_event(&events, |e| *e == EngineEvent::Stopped);
        // The superseded session must not start anything
        thread::sleep(Duration::from_millis(100));
        assert_eq!(factory.state(TrackId(1)).lock().play_calls, 0);
        assert_eq!(engine.status().phase, SessionPhase::Idle);
    }

    // Precise-path coordinator, driven directly so no audio device is
    // needed

    fn control_shared() -> Arc<Mutex<ControlShared>> {
        Arc::new(Mutex::new(ControlShared {
            session_counter: 1,
            phase: SessionPhase::Preparing,
            removed: HashSet::new(),
            mute_overrides: HashMap::new(),
        }))
    }

    fn candidate(id: u64, bytes: Vec<u8>) -> Candidate {
        Candidate {
            track_id: TrackId(id),
            source: Arc::new(BytesClipSource::new(format!("gen-{id}"), bytes).with_ext("wav")),
            muted: false,
        }
    }

    fn precise_args(
        candidates: Vec<Candidate>,
        shared: Arc<Mutex<ControlShared>>,
        mixer: Arc<Mutex<SessionMixer>>,
        event_tx: Sender<EngineEvent>,
    ) -> PreciseSessionArgs {
        PreciseSessionArgs {
            session: 1,
            window: compute_loop_window(120.0, 4, &looplab_timing::WindowParams::default())
                .unwrap(),
            device_sample_rate: 44100,
            mixer,
            store: Arc::new(ClipStore::new(44100, Duration::from_secs(2))),
            shared,
            event_tx,
            candidates,
        }
    }

    #[test]
    fn test_precise_session_starts_all_voices_together() {
        let shared = control_shared();
        let mixer = Arc::new(Mutex::new(SessionMixer::new()));
        let (tx, rx) = unbounded();
        let candidates = vec![
            candidate(1, wav_bytes(4410, 44100)),
            candidate(2, wav_bytes(8820, 44100)),
        ];

        run_precise_session(precise_args(candidates, shared.clone(), mixer.clone(), tx));

        let event = wait_for_event(&rx, |e| matches!(e, EngineEvent::SessionStarted { .. }));
        assert_eq!(
            event,
            EngineEvent::SessionStarted {
                started: vec![TrackId(1), TrackId(2)],
                approximate_sync: false,
            }
        );
        assert_eq!(shared.lock().phase, SessionPhase::Playing);
        assert_eq!(mixer.lock().active_tracks(), vec![TrackId(1), TrackId(2)]);
    }

    #[test]
    fn test_precise_session_isolates_decode_failure() {
        let shared = control_shared();
        let mixer = Arc::new(Mutex::new(SessionMixer::new()));
        let (tx, rx) = unbounded();
        let candidates = vec![
            candidate(1, wav_bytes(4410, 44100)),
            candidate(2, vec![0u8; 32]), // undecodable
        ];

        run_precise_session(precise_args(candidates, shared.clone(), mixer.clone(), tx));

        let failed = wait_for_event(&rx, |e| matches!(e, EngineEvent::TrackFailed { .. }));
        assert!(matches!(
            failed,
            EngineEvent::TrackFailed { track_id: TrackId(2), .. }
        ));
        let started = wait_for_event(&rx, |e| matches!(e, EngineEvent::SessionStarted { .. }));
        assert_eq!(
            started,
            EngineEvent::SessionStarted {
                started: vec![TrackId(1)],
                approximate_sync: false,
            }
        );
    }

    #[test]
    fn test_precise_session_with_all_failures_goes_idle() {
        let shared = control_shared();
        let mixer = Arc::new(Mutex::new(SessionMixer::new()));
        let (tx, rx) = unbounded();
        let candidates = vec![candidate(1, vec![1u8; 16])];

        run_precise_session(precise_args(candidates, shared.clone(), mixer.clone(), tx));

        wait_for_event(&rx, |e| matches!(e, EngineEvent::TrackFailed { .. }));
        wait_for_event(&rx, |e| *e == EngineEvent::NoPlayableTracks);
        assert_eq!(shared.lock().phase, SessionPhase::Idle);
        assert!(mixer.lock().is_empty());
    }

    #[test]
    fn test_superseded_precise_session_installs_nothing() {
        let shared = control_shared();
        shared.lock().session_counter = 2; // a newer session exists
        let mixer = Arc::new(Mutex::new(SessionMixer::new()));
        let (tx, rx) = unbounded();
        let candidates = vec![candidate(1, wav_bytes(4410, 44100))];

        run_precise_session(precise_args(candidates, shared.clone(), mixer.clone(), tx));

        assert!(mixer.lock().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_precise_session_skips_track_removed_midflight() {
        let shared = control_shared();
        shared.lock().removed.insert(TrackId(2));
        let mixer = Arc::new(Mutex::new(SessionMixer::new()));
        let (tx, rx) = unbounded();
        let candidates = vec![
            candidate(1, wav_bytes(4410, 44100)),
            candidate(2, wav_bytes(4410, 44100)),
        ];

        run_precise_session(precise_args(candidates, shared.clone(), mixer.clone(), tx));

        let started = wait_for_event(&rx, |e| matches!(e, EngineEvent::SessionStarted { .. }));
        assert_eq!(
            started,
            EngineEvent::SessionStarted {
                started: vec![TrackId(1)],
                approximate_sync: false,
            }
        );
        assert_eq!(mixer.lock().active_tracks(), vec![TrackId(1)]);
    }

    #[test]
    fn test_precise_session_applies_late_mute_intent() {
        let shared = control_shared();
        shared.lock().mute_overrides.insert(TrackId(1), true);
        let mixer = Arc::new(Mutex::new(SessionMixer::new()));
        let (tx, rx) = unbounded();
        let candidates = vec![candidate(1, wav_bytes(4410, 44100))];

        run_precise_session(precise_args(candidates, shared.clone(), mixer.clone(), tx));

        wait_for_event(&rx, |e| matches!(e, EngineEvent::SessionStarted { .. }));
        assert_eq!(mixer.lock().is_muted(TrackId(1)), Some(true));
    }
}
