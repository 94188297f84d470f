use serde::Serialize;
use thiserror::Error;

/// Why a call ended in `Failed`. Every variant is terminal for the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// Microphone access refused; the user has to retry explicitly.
    PermissionDenied,
    /// The transport could not be established.
    ConnectionFailed,
    /// The transport dropped mid-call.
    ConnectionLost,
    /// Capture or playback device became unavailable.
    DeviceError,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::PermissionDenied => "microphone access denied",
            FailureReason::ConnectionFailed => "connection failed",
            FailureReason::ConnectionLost => "connection lost",
            FailureReason::DeviceError => "audio device error",
        };
        f.write_str(s)
    }
}

/// Misuse of the call API. Runtime failures are reported as state, not here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("a call is already connecting or active")]
    Busy,

    #[error("no active call")]
    NotActive,
}

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("audio device unavailable: {0}")]
    Device(String),
}

impl From<anyhow::Error> for AudioError {
    fn from(e: anyhow::Error) -> Self {
        AudioError::Device(format!("{:#}", e))
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("connect timed out after {0}s")]
    Timeout(u64),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single inbound audio message that could not be turned into samples.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(String),

    #[error("PCM16 payload has odd length {0}")]
    OddLength(usize),

    #[error("empty audio payload")]
    Empty,

    #[error("invalid sample rate {0}")]
    SampleRate(u32),
}
