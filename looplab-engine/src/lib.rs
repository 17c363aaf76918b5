//! Playback engine for LoopLab
//!
//! This crate provides the synchronized multi-track loop playback core:
//! - Track: registry-supplied track records
//! - TrackVoice / SessionMixer: sample-accurate looped voices
//! - AudioContext: the shared cpal output stream and its lifecycle
//! - PlaybackEngine: synchronized start-all, stop-all, mute, removal
//! - FallbackPlayer: coarse streaming strategy for hosts without the
//!   precise audio graph

mod config;
mod context;
mod engine;
mod fallback;
mod mixer;
mod track;
mod voice;

pub use config::EngineConfig;
pub use context::{AudioContext, ContextError, ContextState};
pub use engine::{EngineError, EngineEvent, EngineStatus, PlaybackEngine, SessionPhase};
pub use fallback::{
    FallbackError, FallbackPlan, FallbackPlayer, MediaElement, MediaElementFactory,
};
pub use mixer::SessionMixer;
pub use track::{GenerationStatus, Track, TrackId};
pub use voice::TrackVoice;
