//! Clip handling for LoopLab - fetching, decoding, and caching
//!
//! A track's audio arrives as encoded bytes from an origin the engine
//! does not control. This crate turns those bytes into sample-accurate
//! decoded clips and owns their lifetime: one decoded clip per track,
//! decoded lazily, shared while playing, evicted with the track.

mod decoder;
mod source;
mod store;

#[cfg(test)]
mod test_fixtures;

pub use decoder::{ClipDecoder, DecodeError, DecodedClip};
pub use source::{fetch_with_timeout, BytesClipSource, ClipSource, FetchError, FileClipSource};
pub use store::{ClipError, ClipStore, TrackId};
