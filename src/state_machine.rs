//! Observable call state. The controller is the only writer; the UI reads
//! snapshots through a watch subscription.

use serde::Serialize;

use crate::error::FailureReason;
use crate::protocol::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallStatus {
    Idle,
    Connecting,
    Active,
    Ended,
    Failed(FailureReason),
}

impl CallStatus {
    /// Connecting or Active: the session holds (or is acquiring) devices
    /// and the connection.
    pub fn is_live(&self) -> bool {
        matches!(self, CallStatus::Connecting | CallStatus::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Failed(_))
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            CallStatus::Failed(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Which side ended the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Initiator {
    User,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
    /// Server timestamp in ms, when the backend sent one.
    pub timestamp: Option<u64>,
}

/// Everything the UI layer is allowed to see about the current call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub session_id: Option<String>,
    pub status: CallStatus,
    pub muted: bool,
    pub listening: bool,
    pub speaking: bool,
    pub transcript: Vec<TranscriptEntry>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            session_id: None,
            status: CallStatus::Idle,
            muted: false,
            listening: false,
            speaking: false,
            transcript: Vec::new(),
        }
    }
}

impl CallSnapshot {
    pub fn failure(&self) -> Option<FailureReason> {
        self.status.failure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(!CallStatus::Idle.is_live());
        assert!(CallStatus::Connecting.is_live());
        assert!(CallStatus::Active.is_live());
        assert!(CallStatus::Ended.is_terminal());
        assert!(CallStatus::Failed(FailureReason::ConnectionLost).is_terminal());
        assert!(!CallStatus::Idle.is_terminal());
        assert_eq!(
            CallStatus::Failed(FailureReason::PermissionDenied).failure(),
            Some(FailureReason::PermissionDenied)
        );
        assert_eq!(CallStatus::Ended.failure(), None);
    }
}
