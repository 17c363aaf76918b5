//! Encoded-byte decoding into sample buffers
//!
//! The generation service controls the container and codec, so decoding
//! goes through Symphonia's probe rather than assuming a format. Output
//! is always interleaved stereo f32 at the decoder's target rate; loop
//! points are taken on that buffer, so the conversion happens once here
//! and never on the render path.

use std::io::Cursor;
use std::sync::Arc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while decoding an encoded clip
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("no audio track found in clip")]
    NoAudioTrack,
    #[error("decode error: {0}")]
    Decode(String),
    #[error("resample error: {0}")]
    Resample(String),
    #[error("clip decoded to zero samples")]
    EmptyClip,
}

/// Sample-accurate audio data for one track
///
/// Interleaved stereo f32 normalized to -1.0..1.0. Samples sit behind an
/// `Arc` so a playing voice borrows the data without copying it out of
/// the store.
#[derive(Debug, Clone)]
pub struct DecodedClip {
    pub samples: Arc<Vec<f32>>,
    pub sample_rate: u32,
    pub duration_secs: f64,
}

impl DecodedClip {
    /// Number of stereo frames
    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }
}

/// Clip decoder built on Symphonia
pub struct ClipDecoder {
    target_sample_rate: u32,
}

impl ClipDecoder {
    pub fn new(target_sample_rate: u32) -> Self {
        Self { target_sample_rate }
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    /// Decode encoded bytes into a clip
    pub fn decode(&self, encoded: Vec<u8>, ext_hint: Option<&str>) -> Result<DecodedClip, DecodeError> {
        let mss = MediaSourceStream::new(Box::new(Cursor::new(encoded)), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = ext_hint {
            hint.with_extension(ext);
        }

        // Probe the container format
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| DecodeError::Decode(e.to_string()))?;

        let mut format = probed.format;

        // Find first audio track
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let source_sample_rate = codec_params.sample_rate.unwrap_or(44100);
        let channels = codec_params
            .channels
            .map(|c| c.count() as u16)
            .unwrap_or(2);

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::Decode(e.to_string()))?;

        // Decode all packets into one interleaved buffer
        let mut samples: Vec<f32> = Vec::new();

        loop {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(symphonia::core::errors::Error::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(_) => break,
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(d) => d,
                Err(_) => continue,
            };

            let spec = *decoded.spec();
            let duration = decoded.capacity() as u64;

            let mut sample_buf = SampleBuffer::<f32>::new(duration, spec);
            sample_buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(sample_buf.samples());
        }

        if samples.is_empty() {
            return Err(DecodeError::EmptyClip);
        }

        let samples = to_stereo(samples, channels);

        let samples = if source_sample_rate != self.target_sample_rate {
            resample_stereo(&samples, source_sample_rate, self.target_sample_rate)?
        } else {
            samples
        };

        let frames = samples.len() / 2;
        let duration_secs = frames as f64 / self.target_sample_rate as f64;
        debug!(
            source_rate = source_sample_rate,
            channels,
            frames,
            duration_secs,
            "decoded clip"
        );

        Ok(DecodedClip {
            samples: Arc::new(samples),
            sample_rate: self.target_sample_rate,
            duration_secs,
        })
    }
}

/// Normalize an interleaved buffer to stereo
///
/// Mono is spread to both channels; anything wider keeps its first two.
fn to_stereo(samples: Vec<f32>, channels: u16) -> Vec<f32> {
    match channels {
        2 => samples,
        1 => {
            let mut out = Vec::with_capacity(samples.len() * 2);
            for s in samples {
                out.push(s);
                out.push(s);
            }
            out
        }
        n => {
            let n = n as usize;
            let frames = samples.len() / n;
            let mut out = Vec::with_capacity(frames * 2);
            for f in 0..frames {
                out.push(samples[f * n]);
                out.push(samples[f * n + 1]);
            }
            out
        }
    }
}

/// Resample interleaved stereo audio to the target rate
fn resample_stereo(
    samples: &[f32],
    source_rate: u32,
    target_rate: u32,
) -> Result<Vec<f32>, DecodeError> {
    use rubato::{FftFixedInOut, Resampler};

    let frames = samples.len() / 2;

    let mut resampler =
        FftFixedInOut::<f32>::new(source_rate as usize, target_rate as usize, 1024, 2)
            .map_err(|e| DecodeError::Resample(e.to_string()))?;

    // Deinterleave
    let deinterleaved: Vec<Vec<f32>> = (0..2)
        .map(|ch| (0..frames).map(|f| samples[f * 2 + ch]).collect())
        .collect();

    // Process in chunks
    let chunk_size = resampler.input_frames_next();
    let mut output: Vec<Vec<f32>> = vec![Vec::new(); 2];

    let mut pos = 0;
    while pos + chunk_size <= frames {
        let input_refs: Vec<&[f32]> = deinterleaved
            .iter()
            .map(|ch| &ch[pos..pos + chunk_size])
            .collect();

        let resampled = resampler
            .process(&input_refs, None)
            .map_err(|e| DecodeError::Resample(e.to_string()))?;

        for (ch, data) in resampled.into_iter().enumerate() {
            output[ch].extend(data);
        }

        pos += chunk_size;
    }

    // Handle remaining samples (pad with zeros)
    if pos < frames {
        let remaining = frames - pos;
        let padded: Vec<Vec<f32>> = deinterleaved
            .iter()
            .map(|ch| {
                let mut v = ch[pos..].to_vec();
                v.resize(chunk_size, 0.0);
                v
            })
            .collect();

        let input_refs: Vec<&[f32]> = padded.iter().map(|v| v.as_slice()).collect();

        if let Ok(resampled) = resampler.process(&input_refs, None) {
            for (ch, data) in resampled.into_iter().enumerate() {
                // Only take the proportional amount of output
                let output_frames = (remaining * target_rate as usize) / source_rate as usize;
                output[ch].extend(&data[..output_frames.min(data.len())]);
            }
        }
    }

    // Reinterleave
    let output_frames = output[0].len();
    let mut interleaved = Vec::with_capacity(output_frames * 2);
    for frame_idx in 0..output_frames {
        interleaved.push(output[0][frame_idx]);
        interleaved.push(output[1][frame_idx]);
    }

    Ok(interleaved)
}
