use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use alsa::pcm::PCM;
use anyhow::Result;

use super::alsa_device::AlsaParams;
use super::speex::{EchoCanceller, Preprocessor};
use super::{AudioFrame, CaptureOptions, DspSettings, FrameSink};

/// Echo canceller shared by the capture thread and the playback sink.
pub type EchoSlot = Arc<Mutex<Option<EchoCanceller>>>;

const I16_SCALE: f32 = 32768.0;

pub fn record_thread(
    pcm: PCM,
    params: AlsaParams,
    dsp: &DspSettings,
    options: &CaptureOptions,
    echo: &EchoSlot,
    sink: &dyn FrameSink,
    running: &AtomicBool,
) -> Result<()> {
    let rate = params.sample_rate;
    let block = dsp.block_samples(rate);

    // 1. Speex DSP 初始化
    let mut preprocessor = Preprocessor::new(
        block,
        rate,
        options.noise_suppression.then_some(dsp.noise_suppress_db),
        options.auto_gain_control.then_some(dsp.agc_level),
    )?;
    if options.echo_cancellation {
        let aec = EchoCanceller::new(block, rate, dsp.echo_tail_ms)?;
        *echo.lock().unwrap_or_else(|e| e.into_inner()) = Some(aec);
    }

    let mut read_buf = vec![0i16; params.period_size.max(block)];
    let mut pending: Vec<i16> = Vec::with_capacity(read_buf.len() + block);
    let mut cleaned = vec![0i16; block];
    let mut frame: Vec<f32> = Vec::with_capacity(options.frame_samples);

    let io = pcm.io_i16()?;

    log::info!(
        "Recording started: rate={}, period={}, dsp_block={}, frame_samples={}",
        rate,
        params.period_size,
        block,
        options.frame_samples,
    );

    let result = loop {
        if !running.load(Ordering::Relaxed) {
            break Ok(());
        }
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                pending.extend_from_slice(&read_buf[..frames]);

                // 2. 按 DSP 块处理：回声消除 → 降噪/AGC
                let mut offset = 0;
                while pending.len() - offset >= block {
                    let raw = &pending[offset..offset + block];
                    match echo.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
                        Some(aec) => aec.capture(raw, &mut cleaned),
                        None => cleaned.copy_from_slice(raw),
                    }
                    preprocessor.process(&mut cleaned);
                    offset += block;

                    // 3. 攒满一帧后交给上层
                    for &s in &cleaned {
                        frame.push(s as f32 / I16_SCALE);
                        if frame.len() == options.frame_samples {
                            let samples = std::mem::replace(
                                &mut frame,
                                Vec::with_capacity(options.frame_samples),
                            );
                            sink.on_frame(AudioFrame::new(samples, rate));
                        }
                    }
                }
                pending.drain(..offset);
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break Err(anyhow::anyhow!("capture device lost: {}", e2));
                }
            }
        }
    };

    echo.lock().unwrap_or_else(|e| e.into_inner()).take();
    log::info!("Recording stopped");
    result
}
