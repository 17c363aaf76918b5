//! Shared fixtures for clip tests

/// Build a PCM16 WAV byte stream carrying a 220 Hz sine
pub fn wav_bytes(frames: usize, sample_rate: u32, channels: u16) -> Vec<u8> {
    let data_len = (frames * channels as usize * 2) as u32;
    let byte_rate = sample_rate * channels as u32 * 2;
    let block_align = channels * 2;

    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());

    for frame in 0..frames {
        let t = frame as f32 / sample_rate as f32;
        let sample = (t * 220.0 * std::f32::consts::TAU).sin();
        let quantized = (sample * 0.5 * i16::MAX as f32) as i16;
        for _ in 0..channels {
            out.extend_from_slice(&quantized.to_le_bytes());
        }
    }

    out
}
