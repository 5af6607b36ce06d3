//! Socket.IO client transport over a raw WebSocket.
//!
//! Speaks Engine.IO v4 directly on `/socket.io/?EIO=4&transport=websocket`,
//! skipping the long-polling upgrade dance. One task per link owns the
//! socket; the [`Link`] handle only queues outbound packets, so an emit
//! queued before `close()` is still written before the disconnect.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;
use wfgame_protocol::{EnginePacket, SocketPacket, ENGINE_IO_VERSION};

use crate::connection::{Link, LinkEvents, OpenFuture, Transport};
use crate::error::{OpenError, TransportError};

#[derive(Debug, Clone)]
pub struct SocketIoTransport {
    endpoint: Url,
    connect_timeout: Duration,
}

impl SocketIoTransport {
    /// `endpoint` is the Socket.IO path on the server, e.g. `ws://host:8000/socket.io/`.
    pub fn new(endpoint: Url, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// The Engine.IO websocket URL for `endpoint`.
pub fn websocket_url(endpoint: &Url) -> Url {
    let mut url = endpoint.clone();
    url.query_pairs_mut()
        .append_pair("EIO", ENGINE_IO_VERSION)
        .append_pair("transport", "websocket");
    url
}

impl Transport for SocketIoTransport {
    fn open(&self, events: LinkEvents) -> OpenFuture {
        let url = websocket_url(&self.endpoint);
        let timeout = self.connect_timeout;

        Box::pin(async move {
            debug!(
                component = "socketio",
                event = "socketio.connect.started",
                generation = events.generation(),
                url = %url,
                "Connecting socket"
            );

            let connect = tokio_tungstenite::connect_async(url.as_str());
            let (stream, _response) = match tokio::time::timeout(timeout, connect).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(OpenError::from(TransportError::Connect(e.to_string()))),
                Err(_) => {
                    return Err(OpenError::from(TransportError::Timeout(
                        timeout.as_millis() as u64,
                    )))
                }
            };

            let (out_tx, out_rx) = mpsc::unbounded_channel();
            tokio::spawn(run_socket(stream, out_rx, events, timeout));
            Ok(Box::new(SocketIoLink {
                out_tx,
                closed: false,
            }) as Box<dyn Link>)
        })
    }

    fn describe(&self) -> String {
        format!("socket.io {}", self.endpoint)
    }
}

enum Outbound {
    Emit(String),
    Close,
}

struct SocketIoLink {
    out_tx: mpsc::UnboundedSender<Outbound>,
    closed: bool,
}

impl Link for SocketIoLink {
    fn emit(&mut self, event: &str, payload: &Value) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let packet = EnginePacket::event(event, payload.clone()).encode();
        self.out_tx
            .send(Outbound::Emit(packet))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.out_tx.send(Outbound::Close);
        }
    }
}

impl Drop for SocketIoLink {
    fn drop(&mut self) {
        self.close();
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// What the reader saw that ends the link.
enum Ending {
    Closed(Option<String>),
    Failed(String),
    /// The local side asked to close; nothing to report.
    Local,
}

async fn run_socket(
    stream: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    events: LinkEvents,
    handshake_timeout: Duration,
) {
    let (mut write, mut read) = stream.split();
    // Until the Engine.IO handshake arrives, the connect timeout applies.
    let mut liveness = Some(Instant::now() + handshake_timeout);
    let mut keepalive = Duration::ZERO;

    let ending = loop {
        let deadline = liveness;
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(Outbound::Emit(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        break Ending::Failed(e.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    let disconnect = EnginePacket::Message(SocketPacket::Disconnect {
                        namespace: wfgame_protocol::DEFAULT_NAMESPACE.to_string(),
                    });
                    let _ = write.send(Message::Text(disconnect.encode().into())).await;
                    let _ = write.send(Message::Close(None)).await;
                    break Ending::Local;
                }
            },
            incoming = read.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        break Ending::Closed(frame.map(|f| f.reason.to_string()));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Ending::Failed(e.to_string()),
                    None => break Ending::Closed(None),
                };

                if keepalive > Duration::ZERO {
                    liveness = Some(Instant::now() + keepalive);
                }

                let packet = match EnginePacket::decode(text.as_str()) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!(
                            component = "socketio",
                            event = "socketio.packet.undecodable",
                            generation = events.generation(),
                            error = %e,
                            "Dropping undecodable packet"
                        );
                        continue;
                    }
                };

                match packet {
                    EnginePacket::Open(handshake) => {
                        keepalive = Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);
                        liveness = Some(Instant::now() + keepalive);
                        debug!(
                            component = "socketio",
                            event = "socketio.handshake.received",
                            generation = events.generation(),
                            sid = %handshake.sid,
                            ping_interval_ms = handshake.ping_interval,
                            "Engine.IO handshake received"
                        );
                        let connect = EnginePacket::connect().encode();
                        if let Err(e) = write.send(Message::Text(connect.into())).await {
                            break Ending::Failed(e.to_string());
                        }
                    }
                    EnginePacket::Ping(data) => {
                        let pong = EnginePacket::Pong(data).encode();
                        if let Err(e) = write.send(Message::Text(pong.into())).await {
                            break Ending::Failed(e.to_string());
                        }
                    }
                    EnginePacket::Close => break Ending::Closed(Some("engine close".to_string())),
                    EnginePacket::Message(SocketPacket::Connect { .. }) => {
                        info!(
                            component = "socketio",
                            event = "socketio.namespace.connected",
                            generation = events.generation(),
                            "Socket connected"
                        );
                        if !events.opened() {
                            break Ending::Local;
                        }
                    }
                    EnginePacket::Message(SocketPacket::Event { name, args, .. }) => {
                        let data = args.into_iter().next().unwrap_or(Value::Null);
                        if !events.frame(name, data.to_string()) {
                            break Ending::Local;
                        }
                    }
                    EnginePacket::Message(SocketPacket::ConnectError { data, .. }) => {
                        let message = data
                            .as_ref()
                            .and_then(|d| d.get("message"))
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| "connect_error".to_string());
                        break Ending::Failed(message);
                    }
                    EnginePacket::Message(SocketPacket::Disconnect { .. }) => {
                        break Ending::Closed(Some("io server disconnect".to_string()));
                    }
                    EnginePacket::Message(SocketPacket::Ack { .. })
                    | EnginePacket::Pong(_)
                    | EnginePacket::Upgrade
                    | EnginePacket::Noop => {}
                }
            }
            _ = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                break Ending::Failed("ping timeout".to_string());
            }
        }
    };

    match ending {
        Ending::Closed(reason) => {
            events.closed(reason);
        }
        Ending::Failed(message) => {
            warn!(
                component = "socketio",
                event = "socketio.link.failed",
                generation = events.generation(),
                error = %message,
                "Socket link failed"
            );
            events.error(message);
        }
        Ending::Local => {
            debug!(
                component = "socketio",
                event = "socketio.link.closed",
                generation = events.generation(),
                "Socket closed locally"
            );
        }
    }
}
