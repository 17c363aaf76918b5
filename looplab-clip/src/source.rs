//! Clip origins - where a track's encoded audio comes from
//!
//! The generation glue hands the engine either raw bytes it already holds
//! or a path it spooled them to. Both are modeled behind [`ClipSource`] so
//! the store can cache and invalidate without knowing the transport.

use crossbeam_channel::{bounded, RecvTimeoutError};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while fetching encoded clip bytes
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("io error: {0}")]
    Io(String),
    #[error("fetch timed out after {0:?}")]
    TimedOut(Duration),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        FetchError::Io(e.to_string())
    }
}

/// Origin of one track's encoded audio
///
/// `fingerprint` identifies the exact bytes: it must change whenever the
/// underlying audio changes (a regenerated clip), and stay stable while
/// it does not. The store keys its cache on it.
pub trait ClipSource: Send + Sync {
    /// Identity of the encoded bytes behind this source
    fn fingerprint(&self) -> String;

    /// Fetch the encoded bytes
    fn fetch(&self) -> Result<Vec<u8>, FetchError>;

    /// File-extension hint for the container format, if known
    fn ext_hint(&self) -> Option<&str> {
        None
    }
}

/// Encoded clip spooled to a file on disk
#[derive(Debug, Clone)]
pub struct FileClipSource {
    path: PathBuf,
}

impl FileClipSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ClipSource for FileClipSource {
    fn fingerprint(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn fetch(&self) -> Result<Vec<u8>, FetchError> {
        Ok(std::fs::read(&self.path)?)
    }

    fn ext_hint(&self) -> Option<&str> {
        self.path.extension().and_then(|e| e.to_str())
    }
}

/// Encoded clip already held in memory
///
/// The tag distinguishes generations of the same track: hand a fresh tag
/// to invalidate whatever the store decoded from the previous bytes.
#[derive(Debug, Clone)]
pub struct BytesClipSource {
    tag: String,
    bytes: Arc<Vec<u8>>,
    ext: Option<String>,
}

impl BytesClipSource {
    pub fn new(tag: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            tag: tag.into(),
            bytes: Arc::new(bytes),
            ext: None,
        }
    }

    pub fn with_ext(mut self, ext: impl Into<String>) -> Self {
        self.ext = Some(ext.into());
        self
    }
}

impl ClipSource for BytesClipSource {
    fn fingerprint(&self) -> String {
        format!("bytes:{}:{}", self.tag, self.bytes.len())
    }

    fn fetch(&self) -> Result<Vec<u8>, FetchError> {
        Ok(self.bytes.as_ref().clone())
    }

    fn ext_hint(&self) -> Option<&str> {
        self.ext.as_deref()
    }
}

/// Fetch with a deadline
///
/// The fetch runs on its own thread; if the deadline passes the caller
/// gets `TimedOut` and the straggler's eventual result is dropped with
/// the channel. A hung origin therefore costs one parked thread, never
/// an indefinitely pending track.
pub fn fetch_with_timeout(
    source: &Arc<dyn ClipSource>,
    timeout: Duration,
) -> Result<Vec<u8>, FetchError> {
    let (tx, rx) = bounded(1);
    let source = Arc::clone(source);
    thread::spawn(move || {
        let _ = tx.send(source.fetch());
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(FetchError::TimedOut(timeout)),
        Err(RecvTimeoutError::Disconnected) => {
            // Fetch thread panicked; treat like an unreachable origin
            Err(FetchError::Unavailable("fetch worker died".into()))
        }
    }
}
