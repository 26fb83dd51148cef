//! Audio codec: little-endian PCM16 ⟷ normalized f32, bytes ⟷ base64.
//!
//! Pure functions with no I/O, kept apart from the transport.

use crate::error::{LiveError, LiveResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Decode raw little-endian 16-bit PCM into samples in `[-1.0, 1.0)`.
///
/// An odd byte count means a torn frame and is rejected rather than guessed at.
pub fn pcm16_to_f32(bytes: &[u8]) -> LiveResult<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(LiveError::Codec(format!(
            "PCM16 frame has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect())
}

/// Encode samples as little-endian PCM16. Out-of-range samples are clamped.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let s = if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) };
        let v = (s * 32767.0).round() as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_base64(text: &str) -> LiveResult<Vec<u8>> {
    Ok(BASE64.decode(text.trim())?)
}

/// Inline base64 PCM16 straight to samples.
pub fn decode_inline_pcm16(text: &str) -> LiveResult<Vec<f32>> {
    pcm16_to_f32(&decode_base64(text)?)
}
