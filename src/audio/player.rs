//! Plays synthesized speech in arrival order on a dedicated thread.
//!
//! Buffers are written to the output device one after another; the device
//! blocks each write until it has room, so playback is paced by the device
//! clock and consecutive responses play gaplessly. A flush bumps an epoch
//! counter: queued buffers from an older epoch are skipped and audio already
//! handed to the device is discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use super::stream_decoder::{Pcm16Decoder, PlayableBuffer, StreamDecoder};
use super::{OutputDevice, PlaybackSink};
use crate::error::{AudioError, DecodeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    /// Audio started playing (`true`) or the queue fully drained (`false`).
    Speaking(bool),
    /// The output device failed; playback has stopped.
    DeviceError(String),
}

/// How often the device is polled while the tail of a reply plays out.
const DRAIN_POLL: Duration = Duration::from_millis(5);

struct Queued {
    epoch: u64,
    buffer: PlayableBuffer,
}

pub struct InboundAudioPlayer {
    tx: Option<mpsc::UnboundedSender<Queued>>,
    epoch: Arc<AtomicU64>,
    decoder: Box<dyn StreamDecoder>,
    default_sample_rate: u32,
    handle: Option<JoinHandle<()>>,
}

impl InboundAudioPlayer {
    /// Open the output device and start the playback thread.
    ///
    /// * `default_sample_rate` - used when a message does not declare one
    /// * `events`              - speaking transitions and device failures
    pub fn start(
        device: &dyn OutputDevice,
        default_sample_rate: u32,
        events: mpsc::UnboundedSender<PlayerEvent>,
    ) -> Result<Self, AudioError> {
        let sink = device.open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));

        let handle = {
            let epoch = epoch.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || play_thread(sink, rx, &epoch, events))
                .map_err(|e| AudioError::Device(format!("failed to spawn playback thread: {}", e)))?
        };

        Ok(Self {
            tx: Some(tx),
            epoch,
            decoder: Box::new(Pcm16Decoder),
            default_sample_rate,
            handle: Some(handle),
        })
    }

    /// Decode one `audio-response` payload and queue it behind everything
    /// already queued. A payload that fails to decode is dropped; the queue
    /// is unaffected.
    pub fn enqueue(&mut self, audio: &str, sample_rate: Option<u32>) -> Result<(), DecodeError> {
        let rate = sample_rate.unwrap_or(self.default_sample_rate);
        let buffer = self.decoder.decode(audio, rate)?;
        let queued = Queued {
            epoch: self.epoch.load(Ordering::SeqCst),
            buffer,
        };
        match &self.tx {
            Some(tx) if tx.send(queued).is_ok() => {}
            _ => log::warn!("Playback thread gone, dropping audio response"),
        }
        Ok(())
    }

    /// Discard all queued and in-device audio without waiting for it.
    pub fn flush(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Flush and let the playback thread release the output device.
    pub fn close(&mut self) {
        self.flush();
        self.tx.take();
        // The thread exits on its own once it sees the closed channel;
        // detach it so teardown never waits on a device drain.
        self.handle.take();
    }
}

impl Drop for InboundAudioPlayer {
    fn drop(&mut self) {
        self.close();
    }
}

fn play_thread(
    mut sink: Box<dyn PlaybackSink>,
    mut rx: mpsc::UnboundedReceiver<Queued>,
    epoch: &AtomicU64,
    events: mpsc::UnboundedSender<PlayerEvent>,
) {
    let mut speaking = false;
    let mut seen_epoch = epoch.load(Ordering::SeqCst);

    log::info!("Playback started");

    loop {
        let current = epoch.load(Ordering::SeqCst);
        if current != seen_epoch {
            sink.discard();
            seen_epoch = current;
        }

        let item = match rx.try_recv() {
            Ok(item) => item,
            Err(TryRecvError::Empty) => {
                if speaking {
                    if let Err(e) = drain(sink.as_mut(), &rx, epoch, &mut seen_epoch) {
                        log::error!("Playback drain failed: {}", e);
                        let _ = events.send(PlayerEvent::DeviceError(e.to_string()));
                        return;
                    }
                    // more audio arrived while the device played out
                    if !rx.is_empty() {
                        continue;
                    }
                    speaking = false;
                    let _ = events.send(PlayerEvent::Speaking(false));
                }
                // Block until we receive an audio buffer (or channel closes)
                match rx.blocking_recv() {
                    Some(item) => item,
                    None => break,
                }
            }
            Err(TryRecvError::Disconnected) => break,
        };

        if item.epoch != epoch.load(Ordering::SeqCst) {
            continue;
        }

        if !speaking {
            speaking = true;
            let _ = events.send(PlayerEvent::Speaking(true));
        }

        // Write in 20ms chunks so a flush takes effect between chunks
        let rate = item.buffer.sample_rate;
        let chunk_len = (rate as usize / 50).max(1);
        for chunk in item.buffer.samples.chunks(chunk_len) {
            if item.epoch != epoch.load(Ordering::SeqCst) {
                break;
            }
            let part = PlayableBuffer {
                samples: chunk.to_vec(),
                sample_rate: rate,
            };
            if let Err(e) = sink.write(&part) {
                log::error!("Playback write failed: {}", e);
                let _ = events.send(PlayerEvent::DeviceError(e.to_string()));
                return;
            }
        }
    }

    if speaking {
        let _ = events.send(PlayerEvent::Speaking(false));
    }
    log::info!("Playback stopped");
}

/// Wait for the device to play out what it holds. Returns early when new
/// audio is queued, and discards the device buffer as soon as a flush lands.
fn drain(
    sink: &mut dyn PlaybackSink,
    rx: &mpsc::UnboundedReceiver<Queued>,
    epoch: &AtomicU64,
    seen_epoch: &mut u64,
) -> Result<(), AudioError> {
    loop {
        let current = epoch.load(Ordering::SeqCst);
        if current != *seen_epoch {
            sink.discard();
            *seen_epoch = current;
            return Ok(());
        }
        if !rx.is_empty() || sink.queued()? == 0 {
            return Ok(());
        }
        thread::sleep(DRAIN_POLL);
    }
}
