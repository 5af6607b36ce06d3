//! Replay room hub: one socket per room, shared by every observer.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};
use wfgame_protocol::room::{
    ReplayFrame, RoomEvent, RoomRequest, StepUpdate, SysMsg, JOIN, LEAVE, WIRE_EVENTS,
};

use crate::config::RealtimeConfig;
use crate::connection::{
    ChannelContext, ChannelSink, CloseReason, ConnectionHandle, ConnectionState, ReconnectPolicy,
    Transport,
};
use crate::error::RealtimeError;
use crate::registry::{EventRegistry, Handler};
use crate::subscription::Subscription;
use crate::transport::SocketIoTransport;

/// Callback slots a room observer can fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomEventKind {
    Replay,
    SysMsg,
    Step,
    Connect,
    Disconnect,
    Error,
}

impl RoomEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomEventKind::Replay => "replay",
            RoomEventKind::SysMsg => "sys_msg",
            RoomEventKind::Step => "step",
            RoomEventKind::Connect => "connect",
            RoomEventKind::Disconnect => "disconnect",
            RoomEventKind::Error => "error",
        }
    }
}

/// What room handlers receive.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomSignal {
    Replay(ReplayFrame),
    SysMsg(SysMsg),
    Step(StepUpdate),
    Connected,
    Disconnected(Option<String>),
    Error(String),
}

impl RoomSignal {
    pub fn kind(&self) -> RoomEventKind {
        match self {
            RoomSignal::Replay(_) => RoomEventKind::Replay,
            RoomSignal::SysMsg(_) => RoomEventKind::SysMsg,
            RoomSignal::Step(_) => RoomEventKind::Step,
            RoomSignal::Connected => RoomEventKind::Connect,
            RoomSignal::Disconnected(_) => RoomEventKind::Disconnect,
            RoomSignal::Error(_) => RoomEventKind::Error,
        }
    }
}

impl From<RoomEvent> for RoomSignal {
    fn from(event: RoomEvent) -> Self {
        match event {
            RoomEvent::Replay(frame) => RoomSignal::Replay(frame),
            RoomEvent::SysMsg(msg) => RoomSignal::SysMsg(msg),
            RoomEvent::Step(step) => RoomSignal::Step(step),
        }
    }
}

/// Callbacks to attach when joining a room.
#[derive(Default)]
pub struct RoomCallbacks {
    handlers: Vec<(RoomEventKind, Handler<RoomSignal>)>,
}

impl RoomCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn on_replay<F>(self, f: F) -> Self
    where
        F: Fn(&ReplayFrame) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.with(RoomEventKind::Replay, move |signal| match signal {
            RoomSignal::Replay(frame) => f(frame),
            _ => Ok(()),
        })
    }

    pub fn on_sys_msg<F>(self, f: F) -> Self
    where
        F: Fn(&SysMsg) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.with(RoomEventKind::SysMsg, move |signal| match signal {
            RoomSignal::SysMsg(msg) => f(msg),
            _ => Ok(()),
        })
    }

    pub fn on_step<F>(self, f: F) -> Self
    where
        F: Fn(&StepUpdate) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.with(RoomEventKind::Step, move |signal| match signal {
            RoomSignal::Step(step) => f(step),
            _ => Ok(()),
        })
    }

    pub fn on_connect<F>(self, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.with(RoomEventKind::Connect, move |_| f())
    }

    /// `f` receives the close reason when one is known.
    pub fn on_disconnect<F>(self, f: F) -> Self
    where
        F: Fn(Option<&str>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.with(RoomEventKind::Disconnect, move |signal| match signal {
            RoomSignal::Disconnected(reason) => f(reason.as_deref()),
            _ => Ok(()),
        })
    }

    /// Connect errors and reconnect exhaustion.
    pub fn on_error<F>(self, f: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.with(RoomEventKind::Error, move |signal| match signal {
            RoomSignal::Error(message) => f(message),
            _ => Ok(()),
        })
    }

    fn with<F>(mut self, kind: RoomEventKind, f: F) -> Self
    where
        F: Fn(&RoomSignal) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.push((kind, Arc::new(f)));
        self
    }
}

/// One observer's view of a room connection.
///
/// Dropping it unregisters this observer's callbacks; the connection stays
/// up until [`RoomHub::release_room_socket`].
pub struct RoomSocket {
    room: String,
    connection: ConnectionHandle,
    _subscriptions: Vec<Subscription>,
}

impl fmt::Debug for RoomSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomSocket")
            .field("room", &self.room)
            .field("connection_id", &self.connection.id())
            .field("callbacks", &self._subscriptions.len())
            .finish()
    }
}

impl RoomSocket {
    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn connection_id(&self) -> u64 {
        self.connection.id()
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn emit(&self, event: &str, payload: Value) {
        self.connection.emit(event, payload);
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// True when both sockets share one underlying connection.
    pub fn same_connection(&self, other: &RoomSocket) -> bool {
        self.connection.is_same(&other.connection)
    }
}

#[derive(Clone)]
struct RoomEntry {
    connection: ConnectionHandle,
    handlers: Arc<EventRegistry<RoomSignal>>,
}

/// Live room connections, keyed by room name (cheap to Clone).
#[derive(Clone)]
pub struct RoomHub {
    inner: Arc<RoomHubInner>,
}

struct RoomHubInner {
    rooms: DashMap<String, RoomEntry>,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
}

impl RoomHub {
    pub fn new(config: &RealtimeConfig) -> Result<Self, RealtimeError> {
        let transport = SocketIoTransport::new(config.socket_endpoint()?, config.connect_timeout());
        Ok(Self::with_transport(Arc::new(transport), config.room_policy()))
    }

    pub fn with_transport(transport: Arc<dyn Transport>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(RoomHubInner {
                rooms: DashMap::new(),
                transport,
                policy,
            }),
        }
    }

    /// Join `room`, reusing its connection when one is live, and attach
    /// `callbacks` to it.
    pub fn connect_socket(&self, room: &str, callbacks: RoomCallbacks) -> RoomSocket {
        let entry = {
            let mut created = false;
            let entry = self
                .inner
                .rooms
                .entry(room.to_string())
                .or_insert_with(|| {
                    created = true;
                    self.open_room(room)
                })
                .value()
                .clone();
            if !created {
                debug!(
                    component = "rooms",
                    event = "room.connection.reused",
                    room,
                    channel_id = entry.connection.id(),
                    "Reusing live room connection"
                );
            }
            entry
        };

        let subscriptions = callbacks
            .handlers
            .into_iter()
            .map(|(kind, handler)| {
                let registration = entry.handlers.register(kind.as_str(), handler);
                Subscription::new(&entry.handlers, kind.as_str(), registration.id)
            })
            .collect();

        // Revives a room whose reconnect attempts ran out; no-op otherwise.
        entry.connection.connect();

        RoomSocket {
            room: room.to_string(),
            connection: entry.connection,
            _subscriptions: subscriptions,
        }
    }

    fn open_room(&self, room: &str) -> RoomEntry {
        let handlers = Arc::new(EventRegistry::new(format!("room:{room}")));
        let sink = RoomSink {
            room: room.to_string(),
            handlers: Arc::clone(&handlers),
            connected: AtomicBool::new(false),
        };
        let connection = ConnectionHandle::spawn(
            format!("room:{room}"),
            Arc::clone(&self.inner.transport),
            Arc::new(sink),
            self.inner.policy,
        );
        for event in WIRE_EVENTS {
            connection.subscribe(event);
        }
        info!(
            component = "rooms",
            event = "room.connection.created",
            room,
            channel_id = connection.id(),
            "Opening room connection"
        );
        RoomEntry {
            connection,
            handlers,
        }
    }

    /// Leave `room` and tear its connection down. Returns false, without
    /// sending anything, when the room has no connection.
    pub fn release_room_socket(&self, room: &str) -> bool {
        let Some((_, entry)) = self.inner.rooms.remove(room) else {
            debug!(
                component = "rooms",
                event = "room.release.unknown",
                room,
                "No connection for room, nothing to release"
            );
            return false;
        };

        entry
            .connection
            .emit(LEAVE, RoomRequest::new(room).to_value());
        entry.connection.disconnect();
        entry.connection.shutdown();
        info!(
            component = "rooms",
            event = "room.released",
            room,
            channel_id = entry.connection.id(),
            "Room connection released"
        );
        true
    }

    pub fn release_all(&self) {
        for room in self.rooms() {
            self.release_room_socket(&room);
        }
    }

    /// Rooms with a live connection, sorted.
    pub fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .inner
            .rooms
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        rooms.sort();
        rooms
    }

    pub fn connection(&self, room: &str) -> Option<ConnectionHandle> {
        self.inner
            .rooms
            .get(room)
            .map(|entry| entry.connection.clone())
    }

    pub fn handler_count(&self, room: &str, kind: RoomEventKind) -> usize {
        self.inner
            .rooms
            .get(room)
            .map_or(0, |entry| entry.handlers.handler_count(kind.as_str()))
    }
}

struct RoomSink {
    room: String,
    handlers: Arc<EventRegistry<RoomSignal>>,
    connected: AtomicBool,
}

impl RoomSink {
    fn dispatch(&self, signal: RoomSignal) {
        self.handlers.dispatch(signal.kind().as_str(), &signal);
    }
}

impl ChannelSink for RoomSink {
    fn on_open(&self, ctx: &mut ChannelContext) {
        ctx.emit(JOIN, RoomRequest::new(&self.room).to_value());
        self.connected.store(true, Ordering::SeqCst);
        info!(
            component = "rooms",
            event = "room.joined",
            room = %self.room,
            "Joined room"
        );
        self.dispatch(RoomSignal::Connected);
    }

    fn on_frame(&self, _ctx: &mut ChannelContext, event: &str, data: &str) {
        let payload = serde_json::from_str(data).unwrap_or_else(|_| Value::String(data.to_string()));
        match RoomEvent::from_wire(event, payload) {
            Some(event) => self.dispatch(event.into()),
            None => debug!(
                component = "rooms",
                event = "room.frame.ignored",
                room = %self.room,
                event_name = event,
                "Ignoring room event without payload"
            ),
        }
    }

    fn on_error(&self, error: &str) {
        self.dispatch(RoomSignal::Error(error.to_string()));
    }

    fn on_closed(&self, reason: &CloseReason) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let reason = match reason {
            CloseReason::Manual => Some("io client disconnect".to_string()),
            CloseReason::Remote(reason) => reason.clone(),
            CloseReason::Error(message) => Some(message.clone()),
        };
        self.dispatch(RoomSignal::Disconnected(reason));
    }

    fn on_reconnect_failed(&self, attempts: u32) {
        warn!(
            component = "rooms",
            event = "room.reconnect.failed",
            room = %self.room,
            attempts,
            "Giving up on room connection"
        );
        self.dispatch(RoomSignal::Error(format!(
            "reconnect failed after {attempts} attempts"
        )));
    }
}
