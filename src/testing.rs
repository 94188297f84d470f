//! In-process stand-ins for the microphone, the speaker and the voice
//! backend, used by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, Role};
use url::Url;

use crate::audio::{
    ActiveCapture, AudioFrame, CaptureDevice, CaptureOptions, FrameSink, OutputDevice,
    Permission, PlayableBuffer, PlaybackSink,
};
use crate::error::{AudioError, TransportError};
use crate::transport::{BoxSocket, Connector, WsError};

const TIMEOUT: Duration = Duration::from_secs(5);

pub async fn recv_timeout<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

pub fn pcm16_base64(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

// ---------------------------------------------------------------------------
// microphone

#[derive(Default)]
struct MicState {
    sink: Option<Arc<dyn FrameSink>>,
    opens: usize,
    options: Option<CaptureOptions>,
}

pub struct FakeMicrophone {
    permission: Result<Permission, String>,
    fail_open: bool,
    state: Arc<Mutex<MicState>>,
}

impl FakeMicrophone {
    fn build(permission: Result<Permission, String>, fail_open: bool) -> Arc<Self> {
        Arc::new(Self {
            permission,
            fail_open,
            state: Arc::default(),
        })
    }

    pub fn granted() -> Arc<Self> {
        Self::build(Ok(Permission::Granted), false)
    }

    pub fn denied() -> Arc<Self> {
        Self::build(Ok(Permission::Denied), false)
    }

    /// Permission is granted but the device refuses to open.
    pub fn broken() -> Arc<Self> {
        Self::build(Ok(Permission::Granted), true)
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().unwrap().sink.is_some()
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn last_options(&self) -> Option<CaptureOptions> {
        self.state.lock().unwrap().options.clone()
    }

    /// Deliver one frame, synchronously, if the device is open.
    pub fn emit(&self, samples: &[f32]) {
        let sink = self.state.lock().unwrap().sink.clone();
        if let Some(sink) = sink {
            sink.on_frame(AudioFrame::new(samples.to_vec(), 16000));
        }
    }

    /// Simulate the device disappearing mid-capture.
    pub fn unplug(&self) {
        let sink = self.state.lock().unwrap().sink.take();
        if let Some(sink) = sink {
            sink.on_error(AudioError::Device("microphone unplugged".into()));
        }
    }
}

struct FakeCapture {
    state: Arc<Mutex<MicState>>,
}

impl ActiveCapture for FakeCapture {
    fn stop(&mut self) {
        self.state.lock().unwrap().sink = None;
    }
}

impl Drop for FakeCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl CaptureDevice for FakeMicrophone {
    async fn request_permission(&self) -> Result<Permission, AudioError> {
        self.permission.clone().map_err(AudioError::Device)
    }

    fn open(
        &self,
        options: &CaptureOptions,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Box<dyn ActiveCapture>, AudioError> {
        if self.fail_open {
            return Err(AudioError::Device("no capture device".into()));
        }
        let mut state = self.state.lock().unwrap();
        state.opens += 1;
        state.options = Some(options.clone());
        state.sink = Some(sink);
        Ok(Box::new(FakeCapture {
            state: self.state.clone(),
        }))
    }
}

#[derive(Default)]
pub struct RecordingSink {
    frames: AtomicUsize,
    errors: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }
}

impl FrameSink for RecordingSink {
    fn on_frame(&self, _frame: AudioFrame) {
        self.frames.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, _error: AudioError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// speaker

/// A run of identical samples as it landed on the device timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub value: i16,
    pub sample_rate: u32,
    pub samples: usize,
    pub start_secs: f64,
}

impl Span {
    pub fn end_secs(&self) -> f64 {
        self.start_secs + self.samples as f64 / self.sample_rate as f64
    }
}

#[derive(Default)]
struct SpeakerLog {
    spans: Vec<Span>,
    cursor_secs: f64,
    discards: usize,
    opens: usize,
    held: usize,
    /// Samples written but not yet played out.
    in_device: usize,
}

struct SpeakerState {
    log: Mutex<SpeakerLog>,
    gate: Mutex<bool>,
    gate_cv: Condvar,
    fail_writes: bool,
    fail_open: bool,
    holds_audio: bool,
}

pub struct FakeSpeaker {
    state: Arc<SpeakerState>,
}

impl FakeSpeaker {
    fn build(gate_open: bool, fail_writes: bool, fail_open: bool, holds_audio: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(SpeakerState {
                log: Mutex::default(),
                gate: Mutex::new(gate_open),
                gate_cv: Condvar::new(),
                fail_writes,
                fail_open,
                holds_audio,
            }),
        })
    }

    pub fn new() -> Arc<Self> {
        Self::build(true, false, false, false)
    }

    /// Every write blocks until `open_gate` is called.
    pub fn gated() -> Arc<Self> {
        Self::build(false, false, false, false)
    }

    /// Accepts writes at once but keeps the audio queued in the device
    /// until `play_out` is called.
    pub fn holding() -> Arc<Self> {
        Self::build(true, false, false, true)
    }

    /// Opens fine, fails on the first write.
    pub fn failing() -> Arc<Self> {
        Self::build(true, true, false, false)
    }

    /// Refuses to open at all.
    pub fn missing() -> Arc<Self> {
        Self::build(true, false, true, false)
    }

    pub fn open_gate(&self) {
        *self.state.gate.lock().unwrap() = true;
        self.state.gate_cv.notify_all();
    }

    /// Let the device finish playing whatever it holds.
    pub fn play_out(&self) {
        self.state.log.lock().unwrap().in_device = 0;
    }

    pub fn queued(&self) -> usize {
        self.state.log.lock().unwrap().in_device
    }

    pub fn spans(&self) -> Vec<Span> {
        self.state.log.lock().unwrap().spans.clone()
    }

    pub fn discards(&self) -> usize {
        self.state.log.lock().unwrap().discards
    }

    pub fn open_count(&self) -> usize {
        self.state.log.lock().unwrap().opens
    }

    pub fn is_held(&self) -> bool {
        self.state.log.lock().unwrap().held > 0
    }
}

impl OutputDevice for FakeSpeaker {
    fn open(&self) -> Result<Box<dyn PlaybackSink>, AudioError> {
        if self.state.fail_open {
            return Err(AudioError::Device("no playback device".into()));
        }
        let mut log = self.state.log.lock().unwrap();
        log.opens += 1;
        log.held += 1;
        Ok(Box::new(FakeSink {
            state: self.state.clone(),
        }))
    }
}

struct FakeSink {
    state: Arc<SpeakerState>,
}

impl PlaybackSink for FakeSink {
    fn write(&mut self, buffer: &PlayableBuffer) -> Result<(), AudioError> {
        let mut open = self.state.gate.lock().unwrap();
        while !*open {
            open = self.state.gate_cv.wait(open).unwrap();
        }
        drop(open);

        if self.state.fail_writes {
            return Err(AudioError::Device("speaker unplugged".into()));
        }
        let Some(first) = buffer.samples.first() else {
            return Ok(());
        };
        let value = (first * 32768.0).round() as i16;

        let mut log = self.state.log.lock().unwrap();
        if self.state.holds_audio {
            log.in_device += buffer.samples.len();
        }
        let start_secs = log.cursor_secs;
        log.cursor_secs += buffer.duration_secs();
        match log.spans.last_mut() {
            Some(last)
                if last.value == value
                    && last.sample_rate == buffer.sample_rate
                    && (last.end_secs() - start_secs).abs() < 1e-9 =>
            {
                last.samples += buffer.samples.len();
            }
            _ => log.spans.push(Span {
                value,
                sample_rate: buffer.sample_rate,
                samples: buffer.samples.len(),
                start_secs,
            }),
        }
        Ok(())
    }

    fn discard(&mut self) {
        let mut log = self.state.log.lock().unwrap();
        log.discards += 1;
        log.in_device = 0;
    }

    fn queued(&mut self) -> Result<usize, AudioError> {
        Ok(self.state.log.lock().unwrap().in_device)
    }
}

impl Drop for FakeSink {
    fn drop(&mut self) {
        self.state.log.lock().unwrap().held -= 1;
    }
}

// ---------------------------------------------------------------------------
// voice backend

enum Mode {
    Accept,
    Refuse,
    Hang,
}

/// Hands out in-memory websocket pairs; the server halves are picked up
/// with `accept`.
pub struct MemoryConnector {
    mode: Mode,
    servers_tx: mpsc::UnboundedSender<WebSocketStream<DuplexStream>>,
    servers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WebSocketStream<DuplexStream>>>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    fn build(mode: Mode) -> Self {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        Self {
            mode,
            servers_tx,
            servers_rx: tokio::sync::Mutex::new(servers_rx),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn new() -> Self {
        Self::build(Mode::Accept)
    }

    pub fn refusing() -> Self {
        Self::build(Mode::Refuse)
    }

    /// Never completes the handshake.
    pub fn hanging() -> Self {
        Self::build(Mode::Hang)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub async fn accept(&self) -> FakeServer {
        let ws = tokio::time::timeout(TIMEOUT, self.servers_rx.lock().await.recv())
            .await
            .expect("no client connected")
            .expect("connector dropped");
        FakeServer { ws }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _url: &Url) -> Result<BoxSocket, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            Mode::Accept => {}
            Mode::Refuse => {
                return Err(TransportError::WebSocket(WsError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ))));
            }
            Mode::Hang => std::future::pending::<()>().await,
        }
        let (client, server) = tokio::io::duplex(1 << 16);
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let _ = self.servers_tx.send(server);
        Ok(Box::new(client))
    }
}

/// The backend's end of one in-memory connection.
pub struct FakeServer {
    ws: WebSocketStream<DuplexStream>,
}

impl FakeServer {
    /// Next text message, or `None` once the client has closed.
    async fn next_text(&mut self) -> Option<String> {
        loop {
            let msg = tokio::time::timeout(TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for the client");
            match msg {
                Some(Ok(Message::Text(text))) => return Some(text.as_str().to_string()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => {}
            }
        }
    }

    /// Next text message as JSON. Panics if the client closed instead.
    pub async fn recv_json(&mut self) -> serde_json::Value {
        let text = self
            .next_text()
            .await
            .expect("client closed before sending");
        serde_json::from_str(&text).expect("client sent invalid json")
    }

    /// Every text message until the client closes.
    pub async fn recv_until_closed(&mut self) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Some(text) = self.next_text().await {
            out.push(serde_json::from_str(&text).expect("invalid json"));
        }
        out
    }

    /// Wait for the client to close. `false` if it sent an `end-call` first.
    pub async fn expect_closed(&mut self) -> bool {
        !self
            .recv_until_closed()
            .await
            .iter()
            .any(|m| m["type"] == "end-call")
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("client went away");
    }

    pub async fn close_normal(&mut self) {
        let _ = self
            .ws
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "call over".into(),
            }))
            .await;
    }

    /// Close without a status code.
    pub async fn close_bare(&mut self) {
        let _ = self.ws.close(None).await;
    }

    pub async fn close_with(&mut self, code: CloseCode) {
        let _ = self
            .ws
            .close(Some(CloseFrame {
                code,
                reason: "".into(),
            }))
            .await;
    }
}
