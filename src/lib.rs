//! Real-time voice call client.
//!
//! Captures the microphone, streams PCM16 frames to the voice backend over
//! a single websocket, plays the synthesized replies back in order and
//! keeps a transcript. `CallController` is the entry point.

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod state_machine;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use controller::CallController;
pub use error::{CallError, FailureReason};
pub use state_machine::{CallSnapshot, CallStatus, Initiator, TranscriptEntry};
pub use transport::{Connector, WsConnector};
