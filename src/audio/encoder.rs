//! f32 → PCM16 conversion with an energy figure for voice activity.

use base64::Engine;

use super::AudioFrame;

/// Result of encoding one frame.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// little-endian PCM16
    pub pcm: Vec<u8>,
    /// RMS of the encoded samples, normalized to [0, 1]
    pub rms: f32,
}

impl EncodedFrame {
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.pcm)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    vad_threshold: f32,
}

impl FrameEncoder {
    pub fn new(vad_threshold: f32) -> Self {
        Self { vad_threshold }
    }

    pub fn encode(&self, frame: &AudioFrame) -> EncodedFrame {
        let mut pcm = Vec::with_capacity(frame.len() * 2);
        let mut sum_sq = 0f64;
        for &s in frame.samples() {
            let v = f32_to_i16(s);
            sum_sq += (v as f64) * (v as f64);
            pcm.extend_from_slice(&v.to_le_bytes());
        }
        let rms = if frame.is_empty() {
            0.0
        } else {
            ((sum_sq / frame.len() as f64).sqrt() / 32768.0) as f32
        };
        EncodedFrame { pcm, rms }
    }

    /// Whether a frame with this energy counts as the user speaking.
    pub fn is_voice(&self, rms: f32) -> bool {
        rms > self.vad_threshold
    }
}

/// Asymmetric scaling: positive samples by 32767, negative by 32768.
pub fn f32_to_i16(s: f32) -> i16 {
    let s = if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) };
    let scaled = if s >= 0.0 {
        (s * 32767.0).round()
    } else {
        (s * 32768.0).round()
    };
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}
