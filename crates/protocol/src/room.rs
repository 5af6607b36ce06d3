//! Replay room messages
//!
//! Clients join a room named after a task execution and receive screen
//! replay frames, step progress and system messages for it. The server
//! also emits bare task lifecycle events which are normalised into the
//! system-message shape here so consumers handle one callback type.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{ProtocolError, TaskEventKind};

// Client → server
pub const JOIN: &str = "join";
pub const LEAVE: &str = "leave";

// Server → client
pub const REPLAY: &str = "replay";
pub const SYS_MSG: &str = "sysMsg";
pub const REPLAY_STEP: &str = "replay_step";

/// Every server event a room connection listens for.
pub const WIRE_EVENTS: [&str; 6] = [
    REPLAY,
    SYS_MSG,
    REPLAY_STEP,
    "task_progress",
    "task_status",
    "task_finished",
];

/// Payload of `join` / `leave`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRequest {
    pub room: String,
}

impl RoomRequest {
    pub fn new(room: impl Into<String>) -> Self {
        Self { room: room.into() }
    }

    pub fn to_value(&self) -> Value {
        json!({ "room": self.room })
    }
}

/// One screen replay frame, usually a base64 image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayFrame {
    pub data: String,
}

impl ReplayFrame {
    /// MIME type from a `data:` URL prefix, if the frame carries one.
    pub fn mime_type(&self) -> Option<&str> {
        let rest = self.data.strip_prefix("data:")?;
        let end = rest.find(&[';', ','][..])?;
        Some(&rest[..end])
    }

    /// Decode the frame image bytes, tolerating a `data:` URL prefix.
    pub fn decode_image(&self) -> Result<Vec<u8>, ProtocolError> {
        let encoded = match self.data.split_once(";base64,") {
            Some((prefix, body)) if prefix.starts_with("data:") => body,
            _ => self.data.as_str(),
        };
        Ok(base64::engine::general_purpose::STANDARD.decode(encoded.trim())?)
    }
}

/// System message delivered to `sysMsg` handlers
#[derive(Debug, Clone, PartialEq)]
pub enum SysMsg {
    /// Server-sent `sysMsg`: `{ msg, ...payload }`
    Server { msg: Option<String>, payload: Value },
    /// Bare task lifecycle event, wrapped as `{ event, data }`
    Task { event: TaskEventKind, data: Value },
}

impl SysMsg {
    pub fn message(&self) -> Option<&str> {
        match self {
            SysMsg::Server { msg, .. } => msg.as_deref(),
            SysMsg::Task { .. } => None,
        }
    }

    pub fn task_event(&self) -> Option<TaskEventKind> {
        match self {
            SysMsg::Server { .. } => None,
            SysMsg::Task { event, .. } => Some(*event),
        }
    }

    /// The shape handlers historically received.
    pub fn to_value(&self) -> Value {
        match self {
            SysMsg::Server { payload, .. } => payload.clone(),
            SysMsg::Task { event, data } => json!({ "event": event.as_str(), "data": data }),
        }
    }
}

/// Step progress for a replayed run
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
    pub data: Value,
}

/// A room event after wire-name normalisation
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Replay(ReplayFrame),
    SysMsg(SysMsg),
    Step(StepUpdate),
}

impl RoomEvent {
    /// Normalise a server event. Returns `None` for events rooms don't handle.
    pub fn from_wire(event: &str, payload: Value) -> Option<Self> {
        match event {
            REPLAY => Some(RoomEvent::Replay(ReplayFrame {
                data: unwrap_data(payload).map(value_to_text)?,
            })),
            SYS_MSG => {
                let msg = payload
                    .get("msg")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Some(RoomEvent::SysMsg(SysMsg::Server { msg, payload }))
            }
            REPLAY_STEP => Some(RoomEvent::Step(StepUpdate {
                data: unwrap_data(payload).unwrap_or(Value::Null),
            })),
            other => TaskEventKind::from_wire(other)
                .map(|event| RoomEvent::SysMsg(SysMsg::Task { event, data: payload })),
        }
    }
}

/// `{ data: x }` → `x`; anything else is taken as the raw payload.
fn unwrap_data(payload: Value) -> Option<Value> {
    match payload {
        Value::Null => None,
        Value::Object(mut map) if map.contains_key("data") => map.remove("data"),
        other => Some(other),
    }
}

fn value_to_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}
