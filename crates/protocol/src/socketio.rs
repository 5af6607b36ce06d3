//! Engine.IO v4 / Socket.IO v5 text framing
//!
//! Only the subset a websocket-only client needs: the open handshake,
//! ping/pong, namespace connect/disconnect, events and acks. Binary
//! attachments are rejected.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ProtocolError;

pub const ENGINE_IO_VERSION: &str = "4";
pub const DEFAULT_NAMESPACE: &str = "/";

/// Payload of the Engine.IO `open` packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

/// Transport-level packet
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Message(SocketPacket),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let kind = text.chars().next().ok_or(ProtocolError::EmptyPacket)?;
        let rest = &text[kind.len_utf8()..];
        match kind {
            '0' => Ok(EnginePacket::Open(serde_json::from_str(rest)?)),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping(rest.to_string())),
            '3' => Ok(EnginePacket::Pong(rest.to_string())),
            '4' => Ok(EnginePacket::Message(SocketPacket::decode(rest)?)),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            other => Err(ProtocolError::UnknownEnginePacket(other)),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(handshake) => {
                // Handshake only holds strings and integers.
                format!("0{}", serde_json::to_string(handshake).unwrap_or_default())
            }
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(data) => format!("2{data}"),
            EnginePacket::Pong(data) => format!("3{data}"),
            EnginePacket::Message(packet) => format!("4{}", packet.encode()),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }

    /// `42["event",payload]` on the default namespace.
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        EnginePacket::Message(SocketPacket::Event {
            namespace: DEFAULT_NAMESPACE.to_string(),
            id: None,
            name: name.into(),
            args: vec![payload],
        })
    }

    /// `40` for the default namespace.
    pub fn connect() -> Self {
        EnginePacket::Message(SocketPacket::Connect {
            namespace: DEFAULT_NAMESPACE.to_string(),
            data: None,
        })
    }
}

/// Socket.IO packet carried inside an Engine.IO message
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        namespace: String,
        id: u64,
        args: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        data: Option<Value>,
    },
}

impl SocketPacket {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let kind = text.chars().next().ok_or(ProtocolError::EmptyPacket)?;
        if matches!(kind, '5' | '6') {
            return Err(ProtocolError::BinaryUnsupported);
        }
        let mut rest = &text[kind.len_utf8()..];

        let namespace = if rest.starts_with('/') {
            let end = rest.find(',').unwrap_or(rest.len());
            let namespace = rest[..end].to_string();
            rest = rest.get(end + 1..).unwrap_or("");
            namespace
        } else {
            DEFAULT_NAMESPACE.to_string()
        };

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let id = if digits > 0 {
            Some(rest[..digits].parse::<u64>()?)
        } else {
            None
        };
        rest = &rest[digits..];

        let data: Option<Value> = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest)?)
        };

        match kind {
            '0' => Ok(SocketPacket::Connect { namespace, data }),
            '1' => Ok(SocketPacket::Disconnect { namespace }),
            '2' => {
                let mut args = match data {
                    Some(Value::Array(args)) if !args.is_empty() => args,
                    _ => return Err(ProtocolError::Malformed("event without arguments")),
                };
                let name = match args.remove(0) {
                    Value::String(name) => name,
                    _ => return Err(ProtocolError::Malformed("event name is not a string")),
                };
                Ok(SocketPacket::Event {
                    namespace,
                    id,
                    name,
                    args,
                })
            }
            '3' => {
                let id = id.ok_or(ProtocolError::Malformed("ack without id"))?;
                let args = match data {
                    Some(Value::Array(args)) => args,
                    None => Vec::new(),
                    Some(_) => return Err(ProtocolError::Malformed("ack payload is not an array")),
                };
                Ok(SocketPacket::Ack {
                    namespace,
                    id,
                    args,
                })
            }
            '4' => Ok(SocketPacket::ConnectError { namespace, data }),
            other => Err(ProtocolError::UnknownSocketPacket(other)),
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        match self {
            SocketPacket::Connect { namespace, data } => {
                out.push('0');
                push_namespace(&mut out, namespace);
                if let Some(data) = data {
                    out.push_str(&data.to_string());
                }
            }
            SocketPacket::Disconnect { namespace } => {
                out.push('1');
                push_namespace(&mut out, namespace);
            }
            SocketPacket::Event {
                namespace,
                id,
                name,
                args,
            } => {
                out.push('2');
                push_namespace(&mut out, namespace);
                if let Some(id) = id {
                    let _ = write!(out, "{id}");
                }
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(Value::String(name.clone()));
                items.extend(args.iter().cloned());
                out.push_str(&Value::Array(items).to_string());
            }
            SocketPacket::Ack {
                namespace,
                id,
                args,
            } => {
                out.push('3');
                push_namespace(&mut out, namespace);
                let _ = write!(out, "{id}");
                out.push_str(&Value::Array(args.clone()).to_string());
            }
            SocketPacket::ConnectError { namespace, data } => {
                out.push('4');
                push_namespace(&mut out, namespace);
                if let Some(data) = data {
                    out.push_str(&data.to_string());
                }
            }
        }
        out
    }

    pub fn namespace(&self) -> &str {
        match self {
            SocketPacket::Connect { namespace, .. }
            | SocketPacket::Disconnect { namespace }
            | SocketPacket::Event { namespace, .. }
            | SocketPacket::Ack { namespace, .. }
            | SocketPacket::ConnectError { namespace, .. } => namespace,
        }
    }
}

fn push_namespace(out: &mut String, namespace: &str) {
    if namespace != DEFAULT_NAMESPACE {
        out.push_str(namespace);
        out.push(',');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_open_handshake() {
        let packet = EnginePacket::decode(
            r#"0{"sid":"lv_VI97HAXpY6yYWAAAC","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
        )
        .expect("decode open");
        match packet {
            EnginePacket::Open(handshake) => {
                assert_eq!(handshake.sid, "lv_VI97HAXpY6yYWAAAC");
                assert_eq!(handshake.ping_interval, 25000);
                assert_eq!(handshake.ping_timeout, 20000);
                assert_eq!(handshake.max_payload, Some(1_000_000));
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn encodes_join_event() {
        let packet = EnginePacket::event("join", json!({ "room": "room7" }));
        assert_eq!(packet.encode(), r#"42["join",{"room":"room7"}]"#);
        assert_eq!(EnginePacket::connect().encode(), "40");
    }

    #[test]
    fn decodes_event_with_namespace_and_ack_id() {
        let packet = EnginePacket::decode(r#"42/admin,13["replay",{"data":"abc"}]"#)
            .expect("decode event");
        match packet {
            EnginePacket::Message(SocketPacket::Event {
                namespace,
                id,
                name,
                args,
            }) => {
                assert_eq!(namespace, "/admin");
                assert_eq!(id, Some(13));
                assert_eq!(name, "replay");
                assert_eq!(args, vec![json!({ "data": "abc" })]);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn decodes_connect_ack_and_errors() {
        let ack = EnginePacket::decode(r#"40{"sid":"abc"}"#).expect("decode connect");
        assert_eq!(
            ack,
            EnginePacket::Message(SocketPacket::Connect {
                namespace: "/".into(),
                data: Some(json!({ "sid": "abc" })),
            })
        );

        let err = EnginePacket::decode(r#"44{"message":"Not authorized"}"#).expect("decode error");
        assert!(matches!(
            err,
            EnginePacket::Message(SocketPacket::ConnectError { .. })
        ));

        assert_eq!(
            EnginePacket::decode("41").expect("decode disconnect"),
            EnginePacket::Message(SocketPacket::Disconnect {
                namespace: "/".into()
            })
        );
    }

    #[test]
    fn ping_pong_and_control_packets() {
        assert_eq!(
            EnginePacket::decode("2").expect("ping"),
            EnginePacket::Ping(String::new())
        );
        assert_eq!(EnginePacket::Pong(String::new()).encode(), "3");
        assert_eq!(EnginePacket::decode("1").expect("close"), EnginePacket::Close);
        assert_eq!(EnginePacket::decode("6").expect("noop"), EnginePacket::Noop);
    }

    #[test]
    fn rejects_unsupported_and_malformed_packets() {
        assert!(matches!(
            EnginePacket::decode(""),
            Err(ProtocolError::EmptyPacket)
        ));
        assert!(matches!(
            EnginePacket::decode("9"),
            Err(ProtocolError::UnknownEnginePacket('9'))
        ));
        assert!(matches!(
            EnginePacket::decode(r#"451-["frame",{"_placeholder":true,"num":0}]"#),
            Err(ProtocolError::BinaryUnsupported)
        ));
        assert!(matches!(
            EnginePacket::decode("42[]"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            EnginePacket::decode("42[1,2]"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn event_with_namespace_survives_reencoding() {
        let packet = SocketPacket::Event {
            namespace: "/replay".into(),
            id: Some(7),
            name: "leave".into(),
            args: vec![json!({ "room": "r1" })],
        };
        let text = packet.encode();
        assert_eq!(text, r#"2/replay,7["leave",{"room":"r1"}]"#);
        assert_eq!(SocketPacket::decode(&text).expect("decode"), packet);
    }
}
