//! Track model as handed over by the registry layer
//!
//! The registry owns the track list; the engine only reads the records it
//! is given per call and keeps its own per-track intent (mute overrides,
//! removals) keyed by [`TrackId`].

use looplab_clip::ClipSource;
use std::fmt;
use std::sync::Arc;

pub use looplab_clip::TrackId;

/// Where a track is in its generation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationStatus {
    #[default]
    Pending,
    Ready,
    Failed,
}

/// One track of the loop being assembled
#[derive(Clone)]
pub struct Track {
    pub id: TrackId,
    /// Display name, e.g. the instrument the user asked for
    pub name: String,
    pub status: GenerationStatus,
    pub muted: bool,
    /// Encoded clip origin, present once generation completed
    pub source: Option<Arc<dyn ClipSource>>,
}

impl Track {
    pub fn new(id: TrackId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: GenerationStatus::Pending,
            muted: false,
            source: None,
        }
    }

    /// Attach the generated clip and mark the track ready
    pub fn with_source(mut self, source: Arc<dyn ClipSource>) -> Self {
        self.source = Some(source);
        self.status = GenerationStatus::Ready;
        self
    }

    pub fn is_playable(&self) -> bool {
        self.status == GenerationStatus::Ready && self.source.is_some()
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("muted", &self.muted)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}
