//! Decoding of inbound synthesized speech into playable buffers.

use base64::Engine;

use crate::error::DecodeError;

/// Decoded mono audio at the rate the synthesis engine produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlayableBuffer {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// A trait for decoders that turn one wire payload into a playable buffer.
///
/// The output device is responsible for resampling to its own rate.
pub trait StreamDecoder: Send {
    fn decode(&mut self, payload: &str, sample_rate: u32) -> Result<PlayableBuffer, DecodeError>;
}

/// base64 little-endian PCM16, the only format the backend sends.
#[derive(Debug, Default, Clone, Copy)]
pub struct Pcm16Decoder;

impl StreamDecoder for Pcm16Decoder {
    fn decode(&mut self, payload: &str, sample_rate: u32) -> Result<PlayableBuffer, DecodeError> {
        if sample_rate == 0 {
            return Err(DecodeError::SampleRate(sample_rate));
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| DecodeError::Base64(e.to_string()))?;
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        if bytes.len() % 2 != 0 {
            return Err(DecodeError::OddLength(bytes.len()));
        }
        let samples = bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
            .collect();
        Ok(PlayableBuffer {
            samples,
            sample_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn test_decode_pcm16() {
        let payload = b64(&[0x00, 0x40, 0x00, 0xc0, 0xff, 0x7f]);
        let buf = Pcm16Decoder.decode(&payload, 8000).unwrap();
        assert_eq!(buf.sample_rate, 8000);
        assert_eq!(buf.samples, vec![0.5, -0.5, 32767.0 / 32768.0]);
        assert!((buf.duration_secs() - 3.0 / 8000.0).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_bad_payloads() {
        assert!(matches!(Pcm16Decoder.decode("@@@", 8000), Err(DecodeError::Base64(_))));
        assert_eq!(Pcm16Decoder.decode(&b64(&[1, 2, 3]), 8000), Err(DecodeError::OddLength(3)));
        assert_eq!(Pcm16Decoder.decode("", 8000), Err(DecodeError::Empty));
        assert_eq!(Pcm16Decoder.decode(&b64(&[0, 0]), 0), Err(DecodeError::SampleRate(0)));
    }
}
