//! Core types shared across the protocol

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while decoding wire payloads
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty packet")]
    EmptyPacket,

    #[error("unknown engine.io packet type '{0}'")]
    UnknownEnginePacket(char),

    #[error("unknown socket.io packet type '{0}'")]
    UnknownSocketPacket(char),

    #[error("binary socket.io packets are not supported")]
    BinaryUnsupported,

    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("invalid ack id: {0}")]
    InvalidAckId(#[from] std::num::ParseIntError),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64 image: {0}")]
    Image(#[from] base64::DecodeError),
}

/// Task lifecycle events the room server emits under their own names.
///
/// Clients fold these into the system-message shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    TaskProgress,
    TaskStatus,
    TaskFinished,
}

impl TaskEventKind {
    pub const ALL: [TaskEventKind; 3] = [
        TaskEventKind::TaskProgress,
        TaskEventKind::TaskStatus,
        TaskEventKind::TaskFinished,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskEventKind::TaskProgress => "task_progress",
            TaskEventKind::TaskStatus => "task_status",
            TaskEventKind::TaskFinished => "task_finished",
        }
    }

    pub fn from_wire(event: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == event)
    }
}

impl std::fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::TaskEventKind;

    #[test]
    fn task_event_names_match_wire() {
        assert_eq!(
            TaskEventKind::from_wire("task_progress"),
            Some(TaskEventKind::TaskProgress)
        );
        assert_eq!(
            TaskEventKind::from_wire("task_finished"),
            Some(TaskEventKind::TaskFinished)
        );
        assert_eq!(TaskEventKind::from_wire("sysMsg"), None);

        let json = serde_json::to_string(&TaskEventKind::TaskStatus).expect("serialize");
        assert_eq!(json, "\"task_status\"");
    }
}
