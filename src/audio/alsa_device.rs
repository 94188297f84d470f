//! ALSA capture and playback for the call pipeline.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use alsa::pcm::{Access, Format, HwParams, State, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};
use async_trait::async_trait;

use super::encoder::f32_to_i16;
use super::record::{self, EchoSlot};
use super::speex::Resampler;
use super::{
    ActiveCapture, CaptureDevice, CaptureOptions, DspSettings, FrameSink, OutputDevice,
    Permission, PlayableBuffer, PlaybackSink,
};
use crate::config::Config;
use crate::error::AudioError;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Period size in frames
    pub period_size: usize,
    /// Ring buffer size in frames
    pub buffer_size: usize,
}

/// * `buffer_ms` - ring buffer length to ask for; `None` keeps the driver default
fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    buffer_ms: Option<u32>,
) -> Result<(PCM, AlsaParams)> {
    let dir_name = match direction {
        Direction::Capture => "Capture",
        Direction::Playback => "Playback",
    };
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(1)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ms) = buffer_ms {
            hwp.set_buffer_time_near(ms * 1000, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            period_size: hwp.get_period_size()? as usize,
            buffer_size: hwp.get_buffer_size()? as usize,
        }
    };

    log::info!(
        "ALSA {}: device={}, rate={}, period_size={}, buffer_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.period_size,
        params.buffer_size,
    );

    Ok((pcm, params))
}

/// The ALSA microphone and speaker. Both sides share one echo canceller so
/// the capture path can subtract what the speaker plays.
pub struct AlsaAudio {
    capture_device: String,
    playback_device: String,
    sample_rate: u32,
    playback_buffer_ms: u32,
    dsp: DspSettings,
    echo: EchoSlot,
}

impl AlsaAudio {
    pub fn new(config: &Config) -> Self {
        Self {
            capture_device: config.capture_device.clone(),
            playback_device: config.playback_device.clone(),
            sample_rate: config.sample_rate,
            playback_buffer_ms: config.playback_buffer_ms,
            dsp: DspSettings::from_config(config),
            echo: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl CaptureDevice for AlsaAudio {
    /// Try to open the capture device. Access errors mean no permission; anything
    /// else is a device problem.
    async fn request_permission(&self) -> Result<Permission, AudioError> {
        let device = self.capture_device.clone();
        let opened = tokio::task::spawn_blocking(move || PCM::new(&device, Direction::Capture, false))
            .await
            .map_err(|e| AudioError::Device(e.to_string()))?;
        match opened {
            Ok(_) => Ok(Permission::Granted),
            Err(e) if is_access_error(&e) => {
                log::warn!("No access to capture device {}: {}", self.capture_device, e);
                Ok(Permission::Denied)
            }
            Err(e) => Err(AudioError::Device(format!("{}: {}", self.capture_device, e))),
        }
    }

    fn open(
        &self,
        options: &CaptureOptions,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Box<dyn ActiveCapture>, AudioError> {
        let (pcm, params) =
            open_pcm(&self.capture_device, Direction::Capture, self.sample_rate, None)?;
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = running.clone();
            let dsp = self.dsp.clone();
            let options = options.clone();
            let echo = self.echo.clone();
            thread::Builder::new()
                .name("audio-record".into())
                .spawn(move || {
                    let result =
                        record::record_thread(pcm, params, &dsp, &options, &echo, &*sink, &running);
                    if let Err(e) = result {
                        log::error!("Record thread error: {:#}", e);
                        if running.load(Ordering::SeqCst) {
                            sink.on_error(e.into());
                        }
                    }
                })
                .map_err(|e| AudioError::Device(format!("failed to spawn record thread: {}", e)))?
        };

        Ok(Box::new(AlsaCapture {
            running,
            handle: Some(handle),
        }))
    }
}

fn is_access_error(e: &alsa::Error) -> bool {
    std::io::Error::from_raw_os_error(e.errno()).kind() == ErrorKind::PermissionDenied
}

fn is_underrun(e: &alsa::Error) -> bool {
    std::io::Error::from_raw_os_error(e.errno()).kind() == ErrorKind::BrokenPipe
}

struct AlsaCapture {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ActiveCapture for AlsaCapture {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            // readi returns every period, so this waits at most one period
            if handle.join().is_err() {
                log::error!("Record thread panicked");
            }
        }
    }
}

impl Drop for AlsaCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

impl OutputDevice for AlsaAudio {
    fn open(&self) -> Result<Box<dyn PlaybackSink>, AudioError> {
        // a short ring keeps the echo reference close to what the speaker plays
        let (pcm, params) = open_pcm(
            &self.playback_device,
            Direction::Playback,
            self.sample_rate,
            Some(self.playback_buffer_ms),
        )?;
        Ok(Box::new(AlsaSpeaker {
            pcm,
            rate: params.sample_rate,
            buffer_size: params.buffer_size,
            resampler: None,
            echo: self.echo.clone(),
            echo_pending: Vec::new(),
        }))
    }
}

struct AlsaSpeaker {
    pcm: PCM,
    rate: u32,
    buffer_size: usize,
    resampler: Option<Resampler>,
    echo: EchoSlot,
    echo_pending: Vec<i16>,
}

impl AlsaSpeaker {
    fn to_device_rate(&mut self, buffer: &PlayableBuffer) -> Result<Vec<i16>> {
        let pcm16: Vec<i16> = buffer.samples.iter().map(|&s| f32_to_i16(s)).collect();
        if buffer.sample_rate == self.rate {
            return Ok(pcm16);
        }
        if self.resampler.as_ref().map(|r| r.in_rate()) != Some(buffer.sample_rate) {
            log::debug!("Resampling playback {} -> {}", buffer.sample_rate, self.rate);
            self.resampler = Some(Resampler::new(buffer.sample_rate, self.rate)?);
        }
        match self.resampler.as_mut() {
            Some(resampler) => resampler.process(&pcm16),
            None => Ok(pcm16),
        }
    }

    /// Write with XRUN recovery; gives up on a block after repeated failures.
    fn write_frames(&self, data: &[i16]) -> Result<()> {
        let io = self.pcm.io_i16()?;
        let mut frames_written = 0;
        let mut retry_count = 0u32;

        while frames_written < data.len() {
            match io.writei(&data[frames_written..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    // 触发 ALSA 硬件恢复状态机
                    self.pcm
                        .prepare()
                        .with_context(|| format!("Failed to recover PCM playback after {}", e))?;
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            data.len() - frames_written
                        );
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Hand what was played to the echo canceller as its far-end reference.
    fn feed_echo(&mut self, played: &[i16]) {
        let mut echo = self.echo.lock().unwrap_or_else(|e| e.into_inner());
        let Some(aec) = echo.as_mut() else {
            self.echo_pending.clear();
            return;
        };
        if aec.sample_rate() != self.rate {
            return;
        }
        self.echo_pending.extend_from_slice(played);
        let block = aec.frame_size();
        let mut offset = 0;
        while self.echo_pending.len() - offset >= block {
            aec.playback(&self.echo_pending[offset..offset + block]);
            offset += block;
        }
        self.echo_pending.drain(..offset);
    }
}

impl PlaybackSink for AlsaSpeaker {
    fn write(&mut self, buffer: &PlayableBuffer) -> Result<(), AudioError> {
        let data = self.to_device_rate(buffer)?;
        self.write_frames(&data)?;
        self.feed_echo(&data);
        Ok(())
    }

    fn discard(&mut self) {
        if let Err(e) = self.pcm.drop() {
            log::warn!("Failed to drop playback buffer: {}", e);
        }
        if let Err(e) = self.pcm.prepare() {
            log::warn!("Failed to re-prepare playback: {}", e);
        }
        self.echo_pending.clear();
        if let Some(aec) = self.echo.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
            aec.reset();
        }
    }

    fn queued(&mut self) -> Result<usize, AudioError> {
        // a tail shorter than the start threshold never starts on its own
        if self.pcm.state() == State::Prepared {
            if let Err(e) = self.pcm.start() {
                log::debug!("Playback start on drain: {}", e);
            }
        }
        match self.pcm.avail_update() {
            Ok(avail) => Ok(self.buffer_size.saturating_sub(avail.max(0) as usize)),
            // underrun: everything written has played
            Err(e) if is_underrun(&e) => {
                self.pcm
                    .prepare()
                    .map_err(|e| AudioError::Device(format!("playback recover failed: {}", e)))?;
                Ok(0)
            }
            Err(e) => Err(AudioError::Device(format!("playback status failed: {}", e))),
        }
    }
}
