//! audio - microphone capture, PCM16 encoding and response playback
//!
//! The call pipeline only sees the `CaptureDevice` / `OutputDevice` traits.
//! With the `device` feature, ALSA implementations backed by SpeexDSP
//! (echo cancellation, denoise, AGC, resampling) are available.

pub mod capture;
pub mod encoder;
pub mod player;
pub mod stream_decoder;

#[cfg(feature = "device")]
mod alsa_device;
#[cfg(feature = "device")]
mod record;
#[cfg(feature = "device")]
mod speex;
#[cfg(feature = "device")]
pub use alsa_device::AlsaAudio;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AudioError;

pub use capture::CaptureUnit;
pub use encoder::{EncodedFrame, FrameEncoder};
pub use player::{InboundAudioPlayer, PlayerEvent};
pub use stream_decoder::{Pcm16Decoder, PlayableBuffer, StreamDecoder};

/// One fixed-length block of mono f32 samples in [-1, 1] at the capture rate.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
}

/// Capture-time processing requested from the device backend.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub frame_samples: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            frame_samples: 4096,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Capture-side DSP tuning for device backends.
#[derive(Debug, Clone)]
pub struct DspSettings {
    pub block_ms: u32,
    pub noise_suppress_db: i32,
    pub agc_level: f32,
    pub echo_tail_ms: u32,
}

impl DspSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            block_ms: config.dsp_block_ms,
            noise_suppress_db: config.noise_suppress_db,
            agc_level: config.agc_level,
            echo_tail_ms: config.echo_tail_ms,
        }
    }

    /// Samples per DSP block at the negotiated device rate. Never zero.
    pub fn block_samples(&self, sample_rate: u32) -> usize {
        (sample_rate as u64 * self.block_ms as u64 / 1000).max(1) as usize
    }
}

/// Receives frames from a running capture. Called from the device thread.
pub trait FrameSink: Send + Sync + 'static {
    fn on_frame(&self, frame: AudioFrame);
    /// The device failed and capture has stopped.
    fn on_error(&self, error: AudioError);
}

/// A running capture. Dropping it stops the device.
pub trait ActiveCapture: Send {
    /// Release the device. Returns once no further frames will be delivered.
    fn stop(&mut self);
}

#[async_trait]
pub trait CaptureDevice: Send + Sync + 'static {
    async fn request_permission(&self) -> Result<Permission, AudioError>;

    fn open(
        &self,
        options: &CaptureOptions,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Box<dyn ActiveCapture>, AudioError>;
}

/// An opened output device. Writes block until the device has room, so
/// consecutive writes play back to back on the device clock.
pub trait PlaybackSink: Send + 'static {
    fn write(&mut self, buffer: &PlayableBuffer) -> Result<(), AudioError>;
    /// Drop whatever the device still holds without playing it.
    fn discard(&mut self);
    /// Frames written but not yet played. Must not block.
    fn queued(&mut self) -> Result<usize, AudioError>;
}

pub trait OutputDevice: Send + Sync + 'static {
    fn open(&self) -> Result<Box<dyn PlaybackSink>, AudioError>;
}
