//! Decoded clip cache with in-flight coalescing and eviction epochs
//!
//! The store is the sole owner of decoded sample data. Voices borrow it
//! through the clip's inner `Arc` for the duration of playback; nothing
//! else may hold or mutate it.

use crate::decoder::{ClipDecoder, DecodeError, DecodedClip};
use crate::source::{fetch_with_timeout, ClipSource, FetchError};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Stable identifier for a track, the join key across the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track-{}", self.0)
    }
}

/// Per-track outcome of ensuring a decoded clip
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClipError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("track was removed while its clip was being prepared")]
    Evicted,
}

/// Cache slot for one track
enum Entry {
    /// A fetch+decode is running; `op` identifies it so waiters can tell
    /// a shared failure from a stale one.
    InFlight { fingerprint: String, op: u64 },
    Ready {
        fingerprint: String,
        clip: Arc<DecodedClip>,
    },
    /// Terminal state of one operation. Kept only so coalesced waiters
    /// receive the shared failure; the next fresh call retries.
    Failed {
        fingerprint: String,
        op: u64,
        error: ClipError,
    },
}

struct StoreInner {
    entries: HashMap<TrackId, Entry>,
    /// Bumped on every eviction; a decode that resolves under a stale
    /// epoch is discarded instead of cached.
    epochs: HashMap<TrackId, u64>,
    next_op: u64,
}

impl StoreInner {
    fn epoch(&self, id: TrackId) -> u64 {
        self.epochs.get(&id).copied().unwrap_or(0)
    }
}

/// Cache of decoded clips, keyed by track id
pub struct ClipStore {
    decoder: ClipDecoder,
    fetch_timeout: Duration,
    inner: Mutex<StoreInner>,
    settled: Condvar,
}

impl ClipStore {
    pub fn new(target_sample_rate: u32, fetch_timeout: Duration) -> Self {
        Self {
            decoder: ClipDecoder::new(target_sample_rate),
            fetch_timeout,
            inner: Mutex::new(StoreInner {
                entries: HashMap::new(),
                epochs: HashMap::new(),
                next_op: 0,
            }),
            settled: Condvar::new(),
        }
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.decoder.target_sample_rate()
    }

    /// Ensure the track's clip is decoded, fetching and decoding on demand
    ///
    /// Idempotent for an unchanged source: a cache hit returns the stored
    /// clip without re-fetching. Concurrent callers for the same track
    /// join the single in-flight operation instead of duplicating work. A
    /// changed fingerprint invalidates the old decode. Blocks the calling
    /// thread; the engine runs it on per-track workers.
    pub fn ensure_decoded(
        &self,
        id: TrackId,
        source: &Arc<dyn ClipSource>,
    ) -> Result<Arc<DecodedClip>, ClipError> {
        let fingerprint = source.fingerprint();
        let (epoch, op) = {
            let mut inner = self.inner.lock();
            let epoch = inner.epoch(id);
            let mut joined_op = None;
            loop {
                if inner.epoch(id) != epoch {
                    // Evicted while we were waiting on someone else's decode
                    return Err(ClipError::Evicted);
                }
                match inner.entries.get(&id) {
                    Some(Entry::Ready { fingerprint: f, clip }) if *f == fingerprint => {
                        return Ok(Arc::clone(clip));
                    }
                    Some(Entry::InFlight { fingerprint: f, op }) if *f == fingerprint => {
                        joined_op = Some(*op);
                        self.settled.wait(&mut inner);
                    }
                    Some(Entry::Failed { fingerprint: f, op, error })
                        if *f == fingerprint && joined_op == Some(*op) =>
                    {
                        // The operation we joined failed; share its outcome
                        return Err(error.clone());
                    }
                    // Absent, a different source's entry, or a failure we
                    // did not witness: start a fresh operation
                    _ => break,
                }
            }
            let op = inner.next_op;
            inner.next_op += 1;
            inner.entries.insert(
                id,
                Entry::InFlight {
                    fingerprint: fingerprint.clone(),
                    op,
                },
            );
            (epoch, op)
        };

        // Fetch and decode without holding the lock
        let result = fetch_with_timeout(source, self.fetch_timeout)
            .map_err(ClipError::from)
            .and_then(|bytes| {
                self.decoder
                    .decode(bytes, source.ext_hint())
                    .map_err(ClipError::from)
            });

        let mut inner = self.inner.lock();
        let still_ours = inner.epoch(id) == epoch
            && matches!(inner.entries.get(&id), Some(Entry::InFlight { op: o, .. }) if *o == op);
        if !still_ours {
            // Evicted (or superseded by a new source) mid-flight: the
            // resolved result must not be cached or acted on.
            debug!(%id, "discarding decode that resolved after eviction");
            self.settled.notify_all();
            return Err(ClipError::Evicted);
        }

        match result {
            Ok(clip) => {
                let clip = Arc::new(clip);
                inner.entries.insert(
                    id,
                    Entry::Ready {
                        fingerprint,
                        clip: Arc::clone(&clip),
                    },
                );
                self.settled.notify_all();
                Ok(clip)
            }
            Err(error) => {
                warn!(%id, %error, "clip preparation failed");
                inner.entries.insert(
                    id,
                    Entry::Failed {
                        fingerprint,
                        op,
                        error: error.clone(),
                    },
                );
                self.settled.notify_all();
                Err(error)
            }
        }
    }

    /// Release the track's decoded data and disown any in-flight decode
    ///
    /// Safe to call when nothing is cached.
    pub fn evict(&self, id: TrackId) {
        let mut inner = self.inner.lock();
        *inner.epochs.entry(id).or_insert(0) += 1;
        if inner.entries.remove(&id).is_some() {
            debug!(%id, "evicted clip");
        }
        self.settled.notify_all();
    }

    /// Whether a decoded clip is cached for this track
    pub fn has(&self, id: TrackId) -> bool {
        matches!(self.inner.lock().entries.get(&id), Some(Entry::Ready { .. }))
    }
}
