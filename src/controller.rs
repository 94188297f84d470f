//! The call session state machine.
//!
//! `CallController` is the only thing the UI layer talks to. It owns the
//! capture unit, the session transport and the inbound player of the live
//! call, and publishes a `CallSnapshot` through a watch channel. Every way a
//! call can end (user hang-up, server `call-ended`, dropped connection,
//! device failure) goes through `Core::finish`, which runs the one teardown
//! routine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{
    AudioFrame, CaptureDevice, CaptureOptions, CaptureUnit, FrameEncoder, FrameSink,
    InboundAudioPlayer, OutputDevice, Permission, PlayerEvent,
};
use crate::config::Config;
use crate::error::{AudioError, CallError, FailureReason};
use crate::protocol::{Role, ServerMessage};
use crate::state_machine::{CallSnapshot, CallStatus, Initiator, TranscriptEntry};
use crate::transport::{CloseReason, Connector, SessionTransport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ended(Initiator),
    Failed(FailureReason),
}

/// Flags shared with the capture thread. Only atomics, so the hot path
/// never touches the controller lock.
struct PipelineShared {
    live: AtomicBool,
    muted: AtomicBool,
}

/// Resources of the call that is connecting or active.
struct Session {
    id: String,
    cancel: CancellationToken,
    shared: Arc<PipelineShared>,
    transport: Option<Arc<SessionTransport>>,
    capture: Option<CaptureUnit>,
    player: Option<InboundAudioPlayer>,
}

struct Core {
    config: Config,
    encoder: FrameEncoder,
    mic: Arc<dyn CaptureDevice>,
    speaker: Arc<dyn OutputDevice>,
    connector: Arc<dyn Connector>,
    session: Mutex<Option<Session>>,
    state: Arc<watch::Sender<CallSnapshot>>,
}

pub struct CallController {
    core: Arc<Core>,
}

impl CallController {
    pub fn new(
        config: Config,
        mic: Arc<dyn CaptureDevice>,
        speaker: Arc<dyn OutputDevice>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (state, _) = watch::channel(CallSnapshot::default());
        Self {
            core: Arc::new(Core {
                encoder: FrameEncoder::new(config.vad_threshold),
                config,
                mic,
                speaker,
                connector,
                session: Mutex::new(None),
                state: Arc::new(state),
            }),
        }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.core.state.borrow().clone()
    }

    pub fn status(&self) -> CallStatus {
        self.core.status()
    }

    /// Observe state changes. The receiver is the UI's only view of the call.
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.core.state.subscribe()
    }

    /// Start a new call: microphone permission, then the transport, then
    /// capture and playback. Resolves to the status the attempt ended in;
    /// failures are reported as `Failed(reason)`, not as errors.
    pub async fn start_call(&self) -> Result<CallStatus, CallError> {
        let core = &self.core;
        let (id, cancel) = {
            let mut session = core.lock();
            let live = core.status().is_live();
            debug_assert_eq!(live, session.is_some());
            if live {
                return Err(CallError::Busy);
            }
            let id = format!("web_{}", Uuid::new_v4().simple());
            let cancel = CancellationToken::new();
            *session = Some(Session {
                id: id.clone(),
                cancel: cancel.clone(),
                shared: Arc::new(PipelineShared {
                    live: AtomicBool::new(true),
                    muted: AtomicBool::new(false),
                }),
                transport: None,
                capture: None,
                player: None,
            });
            core.state.send_modify(|s| {
                *s = CallSnapshot {
                    session_id: Some(id.clone()),
                    status: CallStatus::Connecting,
                    ..CallSnapshot::default()
                }
            });
            (id, cancel)
        };
        log::info!("Starting call {}", id);

        // 1. 麦克风权限
        let mut capture = CaptureUnit::new(
            core.mic.clone(),
            CaptureOptions {
                frame_samples: core.config.frame_samples,
                ..CaptureOptions::default()
            },
        );
        let permission = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(core.status()),
            p = capture.request_permission() => p,
        };
        match permission {
            Ok(Permission::Granted) => {}
            Ok(Permission::Denied) => {
                log::warn!("Microphone permission denied");
                core.finish(Some(&id), Outcome::Failed(FailureReason::PermissionDenied));
                return Ok(core.status());
            }
            Err(e) => {
                log::error!("Microphone unavailable: {}", e);
                core.finish(Some(&id), Outcome::Failed(FailureReason::DeviceError));
                return Ok(core.status());
            }
        }

        // 2. 建立连接
        let url = match core.config.voice_url() {
            Ok(url) => url,
            Err(e) => {
                log::error!("Invalid voice endpoint: {}", e);
                core.finish(Some(&id), Outcome::Failed(FailureReason::ConnectionFailed));
                return Ok(core.status());
            }
        };
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(core.status()),
            r = SessionTransport::open(
                core.connector.as_ref(),
                &url,
                &id,
                core.config.outbound_queue,
                transport_tx,
            ) => r,
        };
        let transport = match opened {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                log::error!("Connection to {} failed: {}", url, e);
                core.finish(Some(&id), Outcome::Failed(FailureReason::ConnectionFailed));
                return Ok(core.status());
            }
        };

        // 3. 打开音频设备并进入通话
        let mut guard = core.lock();
        let session = match guard.as_mut() {
            Some(session) if session.id == id && !cancel.is_cancelled() => session,
            _ => {
                // ended while the connection was being set up
                transport.close(CloseReason::User);
                return Ok(core.status());
            }
        };
        session.transport = Some(transport.clone());

        let (player_tx, player_rx) = mpsc::unbounded_channel();
        match InboundAudioPlayer::start(
            core.speaker.as_ref(),
            core.config.response_sample_rate,
            player_tx,
        ) {
            Ok(player) => session.player = Some(player),
            Err(e) => {
                log::error!("Failed to open output device: {}", e);
                core.teardown(guard.take(), Outcome::Failed(FailureReason::DeviceError));
                return Ok(core.status());
            }
        }

        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(CapturePipeline {
            shared: session.shared.clone(),
            encoder: core.encoder,
            transport,
            state: core.state.clone(),
            errors: capture_tx,
        });
        if let Err(e) = capture.start(pipeline) {
            log::error!("Failed to start capture: {}", e);
            core.teardown(guard.take(), Outcome::Failed(FailureReason::DeviceError));
            return Ok(core.status());
        }
        session.capture = Some(capture);

        core.state.send_modify(|s| s.status = CallStatus::Active);
        drop(guard);
        log::info!("Call {} active", id);

        tokio::spawn(pump(
            self.core.clone(),
            id,
            cancel,
            transport_rx,
            player_rx,
            capture_rx,
        ));
        Ok(CallStatus::Active)
    }

    /// Flip mute. Only meaningful while the call is active.
    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        let session = self.core.lock();
        let session = match session.as_ref() {
            Some(session) if self.core.status() == CallStatus::Active => session,
            _ => return Err(CallError::NotActive),
        };
        let muted = !session.shared.muted.load(Ordering::SeqCst);
        session.shared.muted.store(muted, Ordering::SeqCst);
        self.core.state.send_modify(|s| s.muted = muted);
        log::info!("Microphone {}", if muted { "muted" } else { "unmuted" });
        Ok(muted)
    }

    /// End the call from either side. A no-op unless a call is connecting
    /// or active; the state is `Ended` when this returns.
    pub fn end_call(&self, initiator: Initiator) {
        self.core.finish(None, Outcome::Ended(initiator));
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        self.core.finish(None, Outcome::Ended(Initiator::User));
    }
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self) -> CallStatus {
        self.state.borrow().status
    }

    /// End the live session if it is `id` (or whatever is live when `id` is
    /// `None`). Returns whether anything was torn down.
    fn finish(&self, id: Option<&str>, outcome: Outcome) -> bool {
        let mut guard = self.lock();
        let matches = match (guard.as_ref(), id) {
            (Some(session), Some(id)) => session.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return false;
        }
        self.teardown(guard.take(), outcome);
        true
    }

    /// The single teardown routine. Called with the session lock held.
    fn teardown(&self, session: Option<Session>, outcome: Outcome) {
        let Some(mut session) = session else {
            return;
        };
        log::info!("Ending call {}: {:?}", session.id, outcome);

        session.cancel.cancel();
        // gate first: a frame still in flight on the capture thread must not
        // reach the socket
        session.shared.live.store(false, Ordering::SeqCst);
        if let Some(transport) = session.transport.take() {
            let reason = match outcome {
                Outcome::Ended(Initiator::User) => CloseReason::User,
                Outcome::Ended(Initiator::Remote) => CloseReason::Remote,
                Outcome::Failed(_) => CloseReason::Failure,
            };
            transport.close(reason);
        }
        if let Some(mut capture) = session.capture.take() {
            capture.stop();
        }
        if let Some(mut player) = session.player.take() {
            player.flush();
            player.close();
        }

        let status = match outcome {
            Outcome::Ended(_) => CallStatus::Ended,
            Outcome::Failed(reason) => CallStatus::Failed(reason),
        };
        self.state.send_modify(|s| {
            s.status = status;
            s.muted = false;
            s.listening = false;
            s.speaking = false;
            s.transcript.clear();
        });
    }

    /// Run `f` on the session if `id` is still the active call.
    fn with_active<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(session) if session.id == id && self.status() == CallStatus::Active => {
                Some(f(session))
            }
            _ => None,
        }
    }

    fn push_transcript(&self, id: &str, entry: TranscriptEntry) {
        self.with_active(id, |_| {
            self.state.send_modify(|s| s.transcript.push(entry));
        });
    }

    fn handle_transport_event(&self, id: &str, event: TransportEvent) {
        match event {
            TransportEvent::Message(msg) => self.handle_server_message(id, msg),
            TransportEvent::Closed { abnormal, detail } => {
                if abnormal {
                    log::error!("Connection lost: {}", detail);
                    self.finish(Some(id), Outcome::Failed(FailureReason::ConnectionLost));
                } else {
                    log::info!("Server closed the call: {}", detail);
                    self.finish(Some(id), Outcome::Ended(Initiator::Remote));
                }
            }
        }
    }

    fn handle_server_message(&self, id: &str, msg: ServerMessage) {
        match msg {
            ServerMessage::SessionReady { session_id } => {
                log::info!("Session ready: {}", session_id.as_deref().unwrap_or(id));
                if let Some(greeting) = &self.config.greeting {
                    self.push_transcript(
                        id,
                        TranscriptEntry {
                            role: Role::Agent,
                            text: greeting.clone(),
                            timestamp: None,
                        },
                    );
                }
            }
            ServerMessage::Transcript {
                role,
                text,
                timestamp,
            } => {
                log::debug!("Transcript {:?}: {}", role, text);
                self.push_transcript(
                    id,
                    TranscriptEntry {
                        role,
                        text,
                        timestamp,
                    },
                );
            }
            ServerMessage::AudioResponse { audio, sample_rate } => {
                self.with_active(id, |session| {
                    if let Some(player) = session.player.as_mut() {
                        if let Err(e) = player.enqueue(&audio, sample_rate) {
                            log::warn!("Dropping undecodable audio response: {}", e);
                        }
                    }
                });
            }
            ServerMessage::CallEnded { duration } => {
                match duration {
                    Some(secs) => log::info!("Call ended by server after {}s", secs),
                    None => log::info!("Call ended by server"),
                }
                self.finish(Some(id), Outcome::Ended(Initiator::Remote));
            }
            ServerMessage::Unknown => {}
        }
    }

    fn handle_player_event(&self, id: &str, event: PlayerEvent) {
        match event {
            PlayerEvent::Speaking(speaking) => {
                self.with_active(id, |_| {
                    self.state.send_if_modified(|s| {
                        let changed = s.speaking != speaking;
                        s.speaking = speaking;
                        changed
                    });
                });
            }
            PlayerEvent::DeviceError(detail) => {
                log::error!("Output device failed: {}", detail);
                self.finish(Some(id), Outcome::Failed(FailureReason::DeviceError));
            }
        }
    }
}

/// Per-call event loop: everything the components report lands here.
async fn pump(
    core: Arc<Core>,
    id: String,
    cancel: CancellationToken,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    mut player_rx: mpsc::UnboundedReceiver<PlayerEvent>,
    mut capture_rx: mpsc::UnboundedReceiver<AudioError>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(event) = transport_rx.recv() => core.handle_transport_event(&id, event),
            Some(event) = player_rx.recv() => core.handle_player_event(&id, event),
            Some(e) = capture_rx.recv() => {
                log::error!("Capture device failed: {}", e);
                core.finish(Some(&id), Outcome::Failed(FailureReason::DeviceError));
            }
            else => break,
        }
    }
    log::debug!("Event pump for {} finished", id);
}

/// Capture callback: encode, update the voice-activity flag, and hand the
/// frame to the transport unless muted or the call is over.
struct CapturePipeline {
    shared: Arc<PipelineShared>,
    encoder: FrameEncoder,
    transport: Arc<SessionTransport>,
    state: Arc<watch::Sender<CallSnapshot>>,
    errors: mpsc::UnboundedSender<AudioError>,
}

impl FrameSink for CapturePipeline {
    fn on_frame(&self, frame: AudioFrame) {
        if !self.shared.live.load(Ordering::SeqCst) {
            return;
        }
        let encoded = self.encoder.encode(&frame);
        let voice = self.encoder.is_voice(encoded.rms);
        self.state.send_if_modified(|s| {
            let changed = s.listening != voice;
            s.listening = voice;
            changed
        });

        if self.shared.muted.load(Ordering::SeqCst) || !self.shared.live.load(Ordering::SeqCst) {
            return;
        }
        self.transport.send_audio(&encoded);
    }

    fn on_error(&self, error: AudioError) {
        let _ = self.errors.send(error);
    }
}
