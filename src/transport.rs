use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::audio::EncodedFrame;
use crate::error::TransportError;
use crate::protocol::{ClientMessage, ServerMessage};

pub type WsError = tokio_tungstenite::tungstenite::Error;

/// Any message-oriented socket carrying websocket messages.
pub trait WireSocket:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin
{
}

impl<T> WireSocket for T where
    T: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin
{
}

pub type BoxSocket = Box<dyn WireSocket>;

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<BoxSocket, TransportError>;
}

/// Connects over TCP/TLS with tokio-tungstenite.
pub struct WsConnector {
    token: Option<String>,
    timeout: Duration,
}

impl WsConnector {
    pub fn new(token: Option<String>, timeout: Duration) -> Self {
        Self { token, timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<BoxSocket, TransportError> {
        let mut request = url.as_str().into_client_request()?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::Endpoint(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }
        request
            .headers_mut()
            .insert("Protocol-Version", HeaderValue::from_static("1"));

        log::info!("Connecting to {}...", url);
        let (ws_stream, _) = tokio::time::timeout(self.timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout.as_secs()))??;
        log::info!("Connected!");
        Ok(Box::new(ws_stream))
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    Message(ServerMessage),
    /// The connection went away without us closing it.
    Closed { abnormal: bool, detail: String },
}

/// Why the client is closing the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The user hung up: tell the server with `end-call` first.
    User,
    /// The server ended the call; it needs no notice.
    Remote,
    /// A local failure is tearing the call down.
    Failure,
}

enum Control {
    Send(ClientMessage),
    Close,
}

/// The single persistent connection of one call.
///
/// Audio goes through a bounded queue and is dropped, never retried, when
/// the queue is full or the transport is not open. Control messages take
/// priority over queued audio.
pub struct SessionTransport {
    audio_tx: mpsc::Sender<String>,
    control_tx: mpsc::UnboundedSender<Control>,
    open: Arc<AtomicBool>,
}

impl SessionTransport {
    /// Connect, announce the session with `start-call` and start the I/O loop.
    pub async fn open(
        connector: &dyn Connector,
        url: &Url,
        session_id: &str,
        audio_queue: usize,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let mut socket = connector.connect(url).await?;

        let start = ClientMessage::StartCall {
            session_id: session_id.to_string(),
        }
        .to_json()?;
        log::info!("Sending start-call for session {}", session_id);
        socket.send(Message::Text(start.into())).await?;

        let (audio_tx, audio_rx) = mpsc::channel(audio_queue.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let (write, read) = socket.split();
        tokio::spawn(run(write, read, audio_rx, control_rx, open.clone(), events));

        Ok(Self {
            audio_tx,
            control_tx,
            open,
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Queue one encoded frame. Never blocks; returns whether it was queued.
    pub fn send_audio(&self, frame: &EncodedFrame) -> bool {
        if !self.is_open() {
            return false;
        }
        let msg = match (ClientMessage::AudioData {
            audio: frame.to_base64(),
        })
        .to_json()
        {
            Ok(msg) => msg,
            Err(e) => {
                log::error!("Failed to serialize audio frame: {}", e);
                return false;
            }
        };
        match self.audio_tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Outbound audio queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Close the connection. Safe from any state; only the first call has
    /// an effect, so at most one `end-call` is ever sent.
    pub fn close(&self, reason: CloseReason) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("Closing session transport: {:?}", reason);
        if reason == CloseReason::User {
            let _ = self.control_tx.send(Control::Send(ClientMessage::EndCall));
        }
        let _ = self.control_tx.send(Control::Close);
    }
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        self.close(CloseReason::Failure);
    }
}

async fn run<W, R>(
    mut write: W,
    mut read: R,
    mut audio_rx: mpsc::Receiver<String>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    open: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
) where
    W: Sink<Message, Error = WsError> + Unpin,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    // Report a drop we did not ask for, exactly once.
    let lost = |abnormal: bool, detail: String| {
        if open.swap(false, Ordering::SeqCst) {
            log::warn!("Connection closed by peer (abnormal={}): {}", abnormal, detail);
            let _ = events.send(TransportEvent::Closed { abnormal, detail });
        }
    };

    loop {
        tokio::select! {
            biased;

            ctrl = control_rx.recv() => {
                match ctrl {
                    Some(Control::Send(msg)) => {
                        let text = match msg.to_json() {
                            Ok(text) => text,
                            Err(e) => {
                                log::error!("Failed to serialize control message: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            log::warn!("Failed to send control message: {}", e);
                        }
                    }
                    Some(Control::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        let _ = write.close().await;
                        break;
                    }
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match ServerMessage::parse(text.as_str()) {
                            Ok(ServerMessage::Unknown) => {
                                log::debug!("Ignoring unknown message: {}", text.as_str());
                            }
                            Ok(msg) => {
                                if events.send(TransportEvent::Message(msg)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                log::warn!("Ignoring malformed message ({}): {}", e, text.as_str());
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let abnormal = frame
                            .as_ref()
                            .is_some_and(|f| f.code != CloseCode::Normal);
                        lost(abnormal, format!("close frame: {:?}", frame));
                        break;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        log::debug!("Ignoring {} byte binary message", data.len());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        lost(true, e.to_string());
                        break;
                    }
                    None => {
                        lost(true, "connection closed".to_string());
                        break;
                    }
                }
            }

            Some(audio) = audio_rx.recv() => {
                if let Err(e) = write.send(Message::Text(audio.into())).await {
                    lost(true, e.to_string());
                    break;
                }
            }
        }
    }
    log::debug!("Session transport loop finished");
}
