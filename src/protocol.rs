//! JSON messages exchanged with the voice backend over the call socket.

use serde::{Deserialize, Serialize};

/// Messages the client sends.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    StartCall {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    AudioData {
        /// base64 of little-endian PCM16
        audio: String,
    },
    EndCall,
}

/// Who said a transcript line.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(rename = "assistant", alias = "agent")]
    Agent,
}

/// Messages the server pushes. Types this client does not know about
/// deserialize to `Unknown` and are ignored.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(alias = "ready")]
    SessionReady {
        #[serde(rename = "sessionId", default)]
        session_id: Option<String>,
    },
    Transcript {
        role: Role,
        text: String,
        #[serde(default)]
        timestamp: Option<u64>,
    },
    AudioResponse {
        audio: String,
        #[serde(rename = "sampleRate", default)]
        sample_rate: Option<u32>,
    },
    CallEnded {
        #[serde(default)]
        duration: Option<u64>,
    },
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages_match_wire_format() {
        let start = ClientMessage::StartCall { session_id: "web_1".into() };
        assert_eq!(start.to_json().unwrap(), r#"{"type":"start-call","sessionId":"web_1"}"#);
        assert_eq!(ClientMessage::EndCall.to_json().unwrap(), r#"{"type":"end-call"}"#);
        let audio = ClientMessage::AudioData { audio: "AAA=".into() };
        assert_eq!(audio.to_json().unwrap(), r#"{"type":"audio-data","audio":"AAA="}"#);
    }

    #[test]
    fn test_parse_server_messages() {
        assert_eq!(
            ServerMessage::parse(r#"{"type":"session-ready","sessionId":"abc"}"#).unwrap(),
            ServerMessage::SessionReady { session_id: Some("abc".into()) }
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"transcript","role":"assistant","text":"hi","timestamp":12}"#).unwrap(),
            ServerMessage::Transcript { role: Role::Agent, text: "hi".into(), timestamp: Some(12) }
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"transcript","role":"user","text":"yo"}"#).unwrap(),
            ServerMessage::Transcript { role: Role::User, text: "yo".into(), timestamp: None }
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"audio-response","audio":"AAA=","sampleRate":8000}"#).unwrap(),
            ServerMessage::AudioResponse { audio: "AAA=".into(), sample_rate: Some(8000) }
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"call-ended","duration":42}"#).unwrap(),
            ServerMessage::CallEnded { duration: Some(42) }
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"call-ended"}"#).unwrap(),
            ServerMessage::CallEnded { duration: None }
        );
    }

    #[test]
    fn test_legacy_ready_alias() {
        assert_eq!(
            ServerMessage::parse(r#"{"type":"ready"}"#).unwrap(),
            ServerMessage::SessionReady { session_id: None }
        );
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        assert_eq!(
            ServerMessage::parse(r#"{"type":"signal","payload":{"sdp":"x"}}"#).unwrap(),
            ServerMessage::Unknown
        );
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(ServerMessage::parse("not json").is_err());
        assert!(ServerMessage::parse(r#"{"no_type":1}"#).is_err());
    }
}
