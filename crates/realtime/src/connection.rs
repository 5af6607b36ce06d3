//! Connection manager: owns the single live link of a channel.
//!
//! Each channel runs as an independent tokio task. Callers talk to it through
//! a cheap-to-clone [`ConnectionHandle`] that sends [`Command`]s over an
//! unbounded channel; lock-free reads of the latest state go through `ArcSwap`.
//!
//! The task owns every piece of mutable connection state (the link, the
//! pending wire subscriptions, the reconnect timer), so no two opens can race
//! and at most one reconnect timer exists at any time.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{OpenError, RealtimeError, TransportError};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
        })
    }
}

/// Fixed-delay reconnection, optionally bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub const fn unlimited(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    pub const fn bounded(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: Some(max_attempts),
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::unlimited(Duration::from_millis(5000))
    }
}

/// Something a live link reports back to its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Opened,
    Frame { event: String, data: String },
    Error(String),
    Closed(Option<String>),
}

/// Sender half given to a transport when it opens a link.
///
/// Tagged with the link generation so events from a superseded link are
/// ignored by the channel.
#[derive(Clone)]
pub struct LinkEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
}

impl LinkEvents {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn opened(&self) -> bool {
        self.send(LinkEvent::Opened)
    }

    pub fn frame(&self, event: impl Into<String>, data: impl Into<String>) -> bool {
        self.send(LinkEvent::Frame {
            event: event.into(),
            data: data.into(),
        })
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.send(LinkEvent::Error(message.into()))
    }

    pub fn closed(&self, reason: Option<String>) -> bool {
        self.send(LinkEvent::Closed(reason))
    }

    /// Returns false once the channel task is gone.
    pub fn send(&self, event: LinkEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// A live low-level connection. Owned exclusively by the channel task.
pub trait Link: Send {
    /// Register wire-level interest in `event`.
    fn listen(&mut self, _event: &str) {}

    fn emit(&mut self, event: &str, payload: &Value) -> Result<(), TransportError>;

    fn close(&mut self);
}

pub type OpenFuture = BoxFuture<'static, Result<Box<dyn Link>, OpenError>>;

/// Opens links for a channel. Any pre-connect work (credential refresh)
/// happens inside the returned future.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, events: LinkEvents) -> OpenFuture;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `disconnect()` was called.
    Manual,
    /// The server closed the link.
    Remote(Option<String>),
    /// The link failed.
    Error(String),
}

/// Requests a sink makes while handling a channel callback.
#[derive(Debug, Default)]
pub struct ChannelContext {
    outbound: Vec<(String, Value)>,
    resubscribe: bool,
}

impl ChannelContext {
    pub fn emit(&mut self, event: impl Into<String>, payload: Value) {
        self.outbound.push((event.into(), payload));
    }

    /// Re-issue wire subscriptions for every event requested so far.
    pub fn resubscribe_all(&mut self) {
        self.resubscribe = true;
    }
}

/// Receives everything a channel observes. Called on the channel task, in
/// wire order.
pub trait ChannelSink: Send + Sync + 'static {
    fn on_open(&self, _ctx: &mut ChannelContext) {}

    fn on_frame(&self, ctx: &mut ChannelContext, event: &str, data: &str);

    fn on_error(&self, _error: &str) {}

    fn on_closed(&self, _reason: &CloseReason) {}

    fn on_reconnect_failed(&self, _attempts: u32) {}
}

/// Point-in-time view of a channel, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub generation: u64,
    /// Number of link objects alive (0 or 1).
    pub live_links: usize,
    pub opens: u64,
    /// Requested events not yet subscribed on the wire.
    pub pending: Vec<String>,
    pub wired: Vec<String>,
    pub reconnect_scheduled: bool,
    pub auto_reconnect: bool,
    pub attempts: u32,
}

impl ConnectionSnapshot {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Closed,
            generation: 0,
            live_links: 0,
            opens: 0,
            pending: Vec::new(),
            wired: Vec::new(),
            reconnect_scheduled: false,
            auto_reconnect: false,
            attempts: 0,
        }
    }
}

enum Command {
    Connect,
    Disconnect,
    Subscribe(String),
    Emit { event: String, payload: Value },
    ResubscribeAll,
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Handle to a running channel (cheap to Clone).
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    name: Arc<str>,
    command_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    snapshot: Arc<ArcSwap<ConnectionSnapshot>>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionHandle {
    /// Spawn the channel task. Must be called inside a tokio runtime.
    /// The channel starts `Closed`; nothing is opened until `connect()`.
    pub fn spawn(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn ChannelSink>,
        policy: ReconnectPolicy,
    ) -> Self {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let name: Arc<str> = Arc::from(name.into());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);
        let snapshot = Arc::new(ArcSwap::from_pointee(ConnectionSnapshot::initial()));

        let actor = ChannelActor {
            id,
            name: Arc::clone(&name),
            transport,
            sink,
            policy,
            state: ConnectionState::Closed,
            state_tx,
            snapshot: Arc::clone(&snapshot),
            generation: 0,
            opens: 0,
            link: None,
            opening: None,
            early_events: Vec::new(),
            desired: Vec::new(),
            wired: HashSet::new(),
            reconnect_at: None,
            auto_reconnect: false,
            attempts: 0,
            link_tx,
        };
        tokio::spawn(actor.run(command_rx, link_rx));

        Self {
            id,
            name,
            command_tx,
            state_rx,
            snapshot,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when both handles drive the same channel task.
    pub fn is_same(&self, other: &ConnectionHandle) -> bool {
        self.id == other.id
    }

    /// Open the channel. No-op while connecting or open.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Close the channel and stop auto-reconnect until `connect()`.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Request a wire subscription. Buffered until the link is open.
    pub fn subscribe(&self, event: impl Into<String>) {
        self.send(Command::Subscribe(event.into()));
    }

    /// Send an event over the link. Dropped with a warning when not open.
    pub fn emit(&self, event: impl Into<String>, payload: Value) {
        self.send(Command::Emit {
            event: event.into(),
            payload,
        });
    }

    pub fn resubscribe_all(&self) {
        self.send(Command::ResubscribeAll);
    }

    /// Stop the channel task. The link is closed and the handle goes inert.
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the channel reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), RealtimeError> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| RealtimeError::ChannelGone(self.name.to_string()))
    }

    /// Lock-free read of the latest published snapshot.
    pub fn snapshot(&self) -> Arc<ConnectionSnapshot> {
        self.snapshot.load_full()
    }

    /// Resolves once every command sent before it has been processed.
    pub async fn flush(&self) -> Result<(), RealtimeError> {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(Command::Flush(tx)).is_err() {
            return Err(RealtimeError::ChannelGone(self.name.to_string()));
        }
        rx.await
            .map_err(|_| RealtimeError::ChannelGone(self.name.to_string()))
    }

    fn send(&self, cmd: Command) {
        if self.command_tx.send(cmd).is_err() {
            debug!(
                component = "connection",
                event = "channel.command.dropped",
                channel = %self.name,
                channel_id = self.id,
                "Channel task stopped, command dropped"
            );
        }
    }
}

struct ChannelActor {
    id: u64,
    name: Arc<str>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn ChannelSink>,
    policy: ReconnectPolicy,

    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    snapshot: Arc<ArcSwap<ConnectionSnapshot>>,

    generation: u64,
    opens: u64,
    link: Option<Box<dyn Link>>,
    opening: Option<OpenFuture>,
    /// Link events that beat the open future; replayed once the link attaches.
    early_events: Vec<LinkEvent>,

    /// Every event requested, in request order.
    desired: Vec<String>,
    /// Events subscribed on the current link.
    wired: HashSet<String>,

    reconnect_at: Option<Instant>,
    auto_reconnect: bool,
    attempts: u32,

    link_tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
}

async fn next_opened(opening: &mut Option<OpenFuture>) -> Result<Box<dyn Link>, OpenError> {
    match opening {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

/// Runs an abandoned open to completion so pre-connect work (a credential
/// refresh) is not cut off mid-flight. The link it yields is closed unused.
async fn discard_open(opening: OpenFuture, channel: Arc<str>, generation: u64) {
    match opening.await {
        Ok(mut link) => {
            link.close();
            debug!(
                component = "connection",
                event = "channel.open.discarded",
                channel = %channel,
                generation,
                "Abandoned open finished, link closed unused"
            );
        }
        Err(e) => debug!(
            component = "connection",
            event = "channel.open.discarded",
            channel = %channel,
            generation,
            error = %e,
            "Abandoned open failed"
        ),
    }
}

async fn reconnect_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ChannelActor {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        mut link_rx: mpsc::UnboundedReceiver<(u64, LinkEvent)>,
    ) {
        debug!(
            component = "connection",
            event = "channel.started",
            channel = %self.name,
            channel_id = self.id,
            transport = %self.transport.describe(),
            "Channel task started"
        );

        loop {
            let deadline = self.reconnect_at;
            // Link traffic drains before commands, so a Flush reply means
            // everything the link had already reported has been handled.
            tokio::select! {
                biased;
                Some((generation, event)) = link_rx.recv() => {
                    self.handle_link_event(generation, event);
                }
                result = next_opened(&mut self.opening) => {
                    self.opening = None;
                    self.handle_open_result(result);
                }
                _ = reconnect_timer(deadline) => {
                    self.reconnect_at = None;
                    self.handle_reconnect_timer();
                }
                cmd = command_rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
            }
            self.publish();
        }

        self.teardown();
        debug!(
            component = "connection",
            event = "channel.stopped",
            channel = %self.name,
            channel_id = self.id,
            "Channel task stopped"
        );
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => {
                if self.auto_reconnect && self.reconnect_at.is_some() {
                    // Retries only come from the timer.
                    debug!(
                        component = "connection",
                        event = "channel.connect.noop",
                        channel = %self.name,
                        channel_id = self.id,
                        attempt = self.attempts,
                        "Connect ignored, reconnect already scheduled"
                    );
                    return;
                }
                self.auto_reconnect = true;
                if self.state != ConnectionState::Closed {
                    debug!(
                        component = "connection",
                        event = "channel.connect.noop",
                        channel = %self.name,
                        channel_id = self.id,
                        state = %self.state,
                        "Connect ignored, channel already active"
                    );
                    return;
                }
                self.reconnect_at = None;
                self.attempts = 0;
                self.start_open();
            }
            Command::Disconnect => self.disconnect(),
            Command::Subscribe(event) => self.subscribe(event),
            Command::Emit { event, payload } => self.emit(&event, &payload),
            Command::ResubscribeAll => self.flush_pending(),
            Command::Flush(reply) => {
                let _ = reply.send(());
            }
            Command::Shutdown => {}
        }
    }

    fn start_open(&mut self) {
        self.generation += 1;
        self.opens += 1;
        self.early_events.clear();
        self.wired.clear();
        self.set_state(ConnectionState::Connecting);

        info!(
            component = "connection",
            event = "channel.open.started",
            channel = %self.name,
            channel_id = self.id,
            generation = self.generation,
            attempt = self.attempts,
            "Opening channel"
        );

        let events = LinkEvents {
            generation: self.generation,
            tx: self.link_tx.clone(),
        };
        self.opening = Some(self.transport.open(events));
    }

    fn handle_open_result(&mut self, result: Result<Box<dyn Link>, OpenError>) {
        match result {
            Ok(link) => {
                self.link = Some(link);
                let early = std::mem::take(&mut self.early_events);
                for event in early {
                    self.apply_link_event(event);
                }
            }
            Err(OpenError::Credentials(e)) => {
                // Not retried on a timer; waits for an explicit connect().
                warn!(
                    component = "connection",
                    event = "channel.open.no_credentials",
                    channel = %self.name,
                    channel_id = self.id,
                    error = %e,
                    "No usable credential, channel stays closed"
                );
                self.early_events.clear();
                self.set_state(ConnectionState::Closed);
            }
            Err(OpenError::Transport(e)) => {
                self.early_events.clear();
                self.fail(CloseReason::Error(e.to_string()));
            }
        }
    }

    fn handle_link_event(&mut self, generation: u64, event: LinkEvent) {
        if generation != self.generation {
            debug!(
                component = "connection",
                event = "channel.link.stale_event",
                channel = %self.name,
                channel_id = self.id,
                generation,
                current_generation = self.generation,
                "Ignoring event from superseded link"
            );
            return;
        }

        if self.link.is_none() {
            if self.opening.is_some() {
                self.early_events.push(event);
            }
            return;
        }

        self.apply_link_event(event);
    }

    fn apply_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened => {
                self.attempts = 0;
                self.set_state(ConnectionState::Open);
                info!(
                    component = "connection",
                    event = "channel.open.succeeded",
                    channel = %self.name,
                    channel_id = self.id,
                    generation = self.generation,
                    "Channel open"
                );
                self.flush_pending();
                let mut ctx = ChannelContext::default();
                self.sink.on_open(&mut ctx);
                self.apply_context(ctx);
            }
            LinkEvent::Frame { event, data } => {
                if !self.wired.contains(&event) {
                    debug!(
                        component = "connection",
                        event = "channel.frame.unsubscribed",
                        channel = %self.name,
                        channel_id = self.id,
                        event_name = %event,
                        "Dropping frame for unsubscribed event"
                    );
                    return;
                }
                let mut ctx = ChannelContext::default();
                self.sink.on_frame(&mut ctx, &event, &data);
                self.apply_context(ctx);
            }
            LinkEvent::Error(message) => self.fail(CloseReason::Error(message)),
            LinkEvent::Closed(reason) => self.fail(CloseReason::Remote(reason)),
        }
    }

    fn apply_context(&mut self, ctx: ChannelContext) {
        for (event, payload) in ctx.outbound {
            self.emit(&event, &payload);
        }
        if ctx.resubscribe {
            self.flush_pending();
        }
    }

    fn subscribe(&mut self, event: String) {
        if !self.desired.contains(&event) {
            self.desired.push(event.clone());
        }
        if self.state == ConnectionState::Open {
            self.listen(&event);
        } else {
            debug!(
                component = "connection",
                event = "channel.subscribe.pending",
                channel = %self.name,
                channel_id = self.id,
                event_name = %event,
                "Subscription buffered until open"
            );
        }
    }

    /// Wire every requested event not yet subscribed on the current link.
    fn flush_pending(&mut self) {
        if self.state != ConnectionState::Open {
            return;
        }
        let pending: Vec<String> = self
            .desired
            .iter()
            .filter(|e| !self.wired.contains(*e))
            .cloned()
            .collect();
        for event in pending {
            self.listen(&event);
        }
    }

    fn listen(&mut self, event: &str) {
        if self.wired.contains(event) {
            return;
        }
        if let Some(link) = self.link.as_mut() {
            link.listen(event);
            self.wired.insert(event.to_string());
        }
    }

    fn emit(&mut self, event: &str, payload: &Value) {
        let Some(link) = self.link.as_mut().filter(|_| self.state == ConnectionState::Open) else {
            warn!(
                component = "connection",
                event = "channel.emit.dropped",
                channel = %self.name,
                channel_id = self.id,
                event_name = event,
                state = %self.state,
                "Emit dropped, channel not open"
            );
            return;
        };
        if let Err(e) = link.emit(event, payload) {
            warn!(
                component = "connection",
                event = "channel.emit.failed",
                channel = %self.name,
                channel_id = self.id,
                event_name = event,
                error = %e,
                "Emit failed"
            );
        }
    }

    fn disconnect(&mut self) {
        self.auto_reconnect = false;
        self.reconnect_at = None;

        if self.state == ConnectionState::Closed && self.link.is_none() && self.opening.is_none() {
            debug!(
                component = "connection",
                event = "channel.disconnect.noop",
                channel = %self.name,
                channel_id = self.id,
                "Disconnect ignored, channel already closed"
            );
            return;
        }

        self.drop_link();
        self.set_state(ConnectionState::Closed);
        info!(
            component = "connection",
            event = "channel.disconnected",
            channel = %self.name,
            channel_id = self.id,
            "Channel disconnected"
        );
        self.sink.on_closed(&CloseReason::Manual);
    }

    /// Link failure: close, notify, and schedule one reconnect.
    fn fail(&mut self, reason: CloseReason) {
        self.drop_link();
        self.set_state(ConnectionState::Closed);

        match &reason {
            CloseReason::Error(message) => {
                warn!(
                    component = "connection",
                    event = "channel.link.error",
                    channel = %self.name,
                    channel_id = self.id,
                    generation = self.generation,
                    error = %message,
                    "Channel link failed"
                );
                self.sink.on_error(message);
            }
            _ => {
                info!(
                    component = "connection",
                    event = "channel.link.closed",
                    channel = %self.name,
                    channel_id = self.id,
                    generation = self.generation,
                    reason = ?reason,
                    "Channel link closed by remote"
                );
            }
        }
        self.sink.on_closed(&reason);

        if !self.auto_reconnect {
            return;
        }

        self.attempts += 1;
        if let Some(max) = self.policy.max_attempts {
            if self.attempts > max {
                warn!(
                    component = "connection",
                    event = "channel.reconnect.exhausted",
                    channel = %self.name,
                    channel_id = self.id,
                    attempts = max,
                    "Reconnect attempts exhausted"
                );
                self.auto_reconnect = false;
                self.sink.on_reconnect_failed(max);
                return;
            }
        }

        // Replaces any timer already set.
        self.reconnect_at = Some(Instant::now() + self.policy.delay);
        info!(
            component = "connection",
            event = "channel.reconnect.scheduled",
            channel = %self.name,
            channel_id = self.id,
            delay_ms = self.policy.delay.as_millis() as u64,
            attempt = self.attempts,
            "Reconnect scheduled"
        );
    }

    fn handle_reconnect_timer(&mut self) {
        if !self.auto_reconnect || self.state != ConnectionState::Closed {
            return;
        }
        self.start_open();
    }

    fn drop_link(&mut self) {
        if let Some(opening) = self.opening.take() {
            tokio::spawn(discard_open(
                opening,
                Arc::clone(&self.name),
                self.generation,
            ));
        }
        self.early_events.clear();
        self.wired.clear();
        if let Some(mut link) = self.link.take() {
            link.close();
        }
    }

    fn teardown(&mut self) {
        self.auto_reconnect = false;
        self.reconnect_at = None;
        self.drop_link();
        self.set_state(ConnectionState::Closed);
        self.publish();
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(
                component = "connection",
                event = "channel.state.changed",
                channel = %self.name,
                channel_id = self.id,
                from = %self.state,
                to = %state,
                "Channel state changed"
            );
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn publish(&self) {
        let pending = self
            .desired
            .iter()
            .filter(|e| !self.wired.contains(*e))
            .cloned()
            .collect();
        let mut wired: Vec<String> = self.wired.iter().cloned().collect();
        wired.sort();
        self.snapshot.store(Arc::new(ConnectionSnapshot {
            state: self.state,
            generation: self.generation,
            live_links: usize::from(self.link.is_some()),
            opens: self.opens,
            pending,
            wired,
            reconnect_scheduled: self.reconnect_at.is_some(),
            auto_reconnect: self.auto_reconnect,
            attempts: self.attempts,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{resolve_access_token, AccessToken, CredentialProvider, FnCredentials};
    use crate::testing::{FakeTransport, RecordingSink};
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    fn spawn(transport: &FakeTransport, sink: &Arc<RecordingSink>) -> ConnectionHandle {
        ConnectionHandle::spawn(
            "test",
            Arc::new(transport.clone()),
            Arc::clone(sink) as Arc<dyn ChannelSink>,
            ReconnectPolicy::default(),
        )
    }

    async fn open(handle: &ConnectionHandle, transport: &FakeTransport) -> LinkEvents {
        let expected = transport.opens() + 1;
        handle.connect();
        let link = transport.wait_for_link(expected).await;
        link.opened();
        handle
            .wait_for_state(ConnectionState::Open)
            .await
            .expect("channel open");
        link
    }

    #[tokio::test]
    async fn double_connect_opens_one_link() {
        let transport = FakeTransport::default();
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn(&transport, &sink);

        handle.connect();
        handle.connect();
        handle.flush().await.expect("flush");
        let link = transport.wait_for_link(1).await;
        link.opened();
        handle
            .wait_for_state(ConnectionState::Open)
            .await
            .expect("open");
        handle.connect();
        handle.flush().await.expect("flush");

        assert_eq!(transport.opens(), 1);
        let snap = handle.snapshot();
        assert_eq!(snap.live_links, 1);
        assert_eq!(snap.opens, 1);
    }

    #[tokio::test]
    async fn disconnect_when_closed_is_noop() {
        let transport = FakeTransport::default();
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn(&transport, &sink);

        handle.disconnect();
        handle.disconnect();
        handle.flush().await.expect("flush");

        assert_eq!(handle.state(), ConnectionState::Closed);
        assert_eq!(transport.closes(), 0);
        assert!(sink.closes().is_empty());
    }

    #[tokio::test]
    async fn disconnect_closes_link_once() {
        let transport = FakeTransport::default();
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn(&transport, &sink);
        open(&handle, &transport).await;

        handle.disconnect();
        handle.disconnect();
        handle.flush().await.expect("flush");

        assert_eq!(transport.closes(), 1);
        assert_eq!(sink.closes(), vec![CloseReason::Manual]);
        let snap = handle.snapshot();
        assert_eq!(snap.state, ConnectionState::Closed);
        assert!(!snap.auto_reconnect);
        assert!(!snap.reconnect_scheduled);
    }

    #[tokio::test]
    async fn pending_subscriptions_flush_on_open() {
        let transport = FakeTransport::default();
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn(&transport, &sink);

        handle.subscribe("ocr_task_update");
        handle.connect();
        handle.subscribe("broadcast");
        handle.flush().await.expect("flush");
        assert!(transport.listens().is_empty());
        assert_eq!(
            handle.snapshot().pending,
            vec!["ocr_task_update".to_string(), "broadcast".to_string()]
        );

        let link = transport.wait_for_link(1).await;
        link.opened();
        handle
            .wait_for_state(ConnectionState::Open)
            .await
            .expect("open");

        // Requested again after open: no second wire subscription.
        handle.subscribe("ocr_task_update");
        handle.resubscribe_all();
        handle.flush().await.expect("flush");

        assert_eq!(transport.listens(), vec!["ocr_task_update", "broadcast"]);
        assert!(handle.snapshot().pending.is_empty());
    }

    #[tokio::test]
    async fn frames_for_unsubscribed_events_are_dropped() {
        let transport = FakeTransport::default();
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn(&transport, &sink);
        handle.subscribe("wanted");
        let link = open(&handle, &transport).await;

        link.frame("unwanted", "{}");
        link.frame("wanted", "{\"n\":1}");
        sink.wait_for_frames(1).await;
        handle.flush().await.expect("flush");

        assert_eq!(sink.frames(), vec![("wanted".to_string(), "{\"n\":1}".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_errors_schedule_one_reconnect() {
        let transport = FakeTransport::default();
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn(&transport, &sink);
        let link = open(&handle, &transport).await;

        link.error("connection reset");
        link.error("connection reset again");
        handle.flush().await.expect("flush");
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert!(handle.snapshot().reconnect_scheduled);
        assert_eq!(sink.errors(), vec!["connection reset".to_string()]);

        tokio::time::sleep(Duration::from_millis(5001)).await;
        handle.flush().await.expect("flush");
        assert_eq!(transport.opens(), 2);

        tokio::time::sleep(Duration::from_millis(20_000)).await;
        handle.flush().await.expect("flush");
        assert_eq!(transport.opens(), 2);
        assert_eq!(handle.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resubscribes_on_new_link() {
        let transport = FakeTransport::default();
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn(&transport, &sink);
        handle.subscribe("broadcast");
        let first = open(&handle, &transport).await;

        first.closed(Some("server restart".into()));
        handle.flush().await.expect("flush");
        tokio::time::sleep(Duration::from_millis(5001)).await;

        let second = transport.wait_for_link(2).await;
        second.opened();
        handle
            .wait_for_state(ConnectionState::Open)
            .await
            .expect("reopen");

        // Late event from the first link is ignored.
        first.frame("broadcast", "{}");
        second.frame("broadcast", "{\"n\":2}");
        sink.wait_for_frames(1).await;

        assert_eq!(transport.listens(), vec!["broadcast", "broadcast"]);
        assert_eq!(sink.frames().len(), 1);
        assert_eq!(
            sink.closes(),
            vec![CloseReason::Remote(Some("server restart".into()))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let transport = FakeTransport::default();
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn(&transport, &sink);
        let link = open(&handle, &transport).await;

        link.error("boom");
        handle.disconnect();
        handle.flush().await.expect("flush");
        assert!(!handle.snapshot().reconnect_scheduled);

        tokio::time::sleep(Duration::from_secs(30)).await;
        handle.flush().await.expect("flush");
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn credential_failure_is_not_retried() {
        let transport = FakeTransport::default();
        transport.fail_next_open(OpenError::Credentials(
            crate::error::CredentialError::Missing,
        ));
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn(&transport, &sink);

        handle.connect();
        handle.flush().await.expect("flush");

        let snap = handle.snapshot();
        assert_eq!(snap.state, ConnectionState::Closed);
        assert!(!snap.reconnect_scheduled);
        assert!(sink.errors().is_empty());
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_policy_gives_up() {
        let transport = FakeTransport::default();
        let sink = Arc::new(RecordingSink::default());
        let handle = ConnectionHandle::spawn(
            "bounded",
            Arc::new(transport.clone()),
            Arc::clone(&sink) as Arc<dyn ChannelSink>,
            ReconnectPolicy::bounded(Duration::from_millis(1000), 2),
        );
        for _ in 0..3 {
            transport.fail_next_open(OpenError::Transport(TransportError::Connect(
                "refused".into(),
            )));
        }

        handle.connect();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(1001)).await;
            handle.flush().await.expect("flush");
        }

        assert_eq!(transport.opens(), 3);
        assert_eq!(sink.reconnect_failures(), vec![2]);
        assert_eq!(sink.errors().len(), 3);
        assert!(!handle.snapshot().reconnect_scheduled);
    }

    #[tokio::test]
    async fn sink_can_emit_on_open() {
        let transport = FakeTransport::default();
        let sink = Arc::new(RecordingSink::default());
        sink.emit_on_open("join", json!({ "room": "r1" }));
        let handle = spawn(&transport, &sink);
        open(&handle, &transport).await;
        handle.emit("ping", json!(1));
        handle.flush().await.expect("flush");

        assert_eq!(
            transport.emits(),
            vec![
                ("join".to_string(), json!({ "room": "r1" })),
                ("ping".to_string(), json!(1)),
            ]
        );
    }

    #[tokio::test]
    async fn emit_while_closed_is_dropped() {
        let transport = FakeTransport::default();
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn(&transport, &sink);

        handle.emit("leave", json!({ "room": "r1" }));
        handle.flush().await.expect("flush");
        assert!(transport.emits().is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_link_and_stops_task() {
        let transport = FakeTransport::default();
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn(&transport, &sink);
        open(&handle, &transport).await;

        handle.shutdown();
        handle
            .wait_for_state(ConnectionState::Closed)
            .await
            .expect("closed");
        assert!(handle.flush().await.is_err());
        assert_eq!(transport.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_during_backoff_keeps_the_timer() {
        let transport = FakeTransport::default();
        let sink = Arc::new(RecordingSink::default());
        let handle = ConnectionHandle::spawn(
            "backoff",
            Arc::new(transport.clone()),
            Arc::clone(&sink) as Arc<dyn ChannelSink>,
            ReconnectPolicy::bounded(Duration::from_millis(1000), 2),
        );
        for _ in 0..2 {
            transport.fail_next_open(OpenError::Transport(TransportError::Connect(
                "refused".into(),
            )));
        }

        handle.connect();
        handle.flush().await.expect("flush");
        for _ in 0..5 {
            handle.connect();
        }
        handle.flush().await.expect("flush");

        assert_eq!(transport.opens(), 1);
        let snap = handle.snapshot();
        assert!(snap.reconnect_scheduled);
        assert_eq!(snap.attempts, 1);

        tokio::time::sleep(Duration::from_millis(1001)).await;
        handle.flush().await.expect("flush");
        assert_eq!(transport.opens(), 2);
        assert_eq!(handle.snapshot().attempts, 2);
    }

    /// Refreshes credentials before opening, like the stream transport.
    struct RefreshingTransport {
        credentials: Arc<dyn CredentialProvider>,
        inner: FakeTransport,
    }

    impl Transport for RefreshingTransport {
        fn open(&self, events: LinkEvents) -> OpenFuture {
            let credentials = Arc::clone(&self.credentials);
            let inner = self.inner.clone();
            Box::pin(async move {
                resolve_access_token(credentials.as_ref()).await?;
                inner.open(events).await
            })
        }

        fn describe(&self) -> String {
            "refreshing".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_lets_inflight_refresh_finish() {
        let refreshed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&refreshed);
        let credentials = FnCredentials::new(
            || None,
            move || {
                let flag = Arc::clone(&flag);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(Some(AccessToken::new("fresh")))
                }
            },
        );
        let inner = FakeTransport::default();
        let transport = RefreshingTransport {
            credentials: Arc::new(credentials),
            inner: inner.clone(),
        };
        let sink = Arc::new(RecordingSink::default());
        let handle = ConnectionHandle::spawn(
            "refresh",
            Arc::new(transport),
            Arc::clone(&sink) as Arc<dyn ChannelSink>,
            ReconnectPolicy::default(),
        );

        handle.connect();
        handle.flush().await.expect("flush");
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.disconnect();
        handle.flush().await.expect("flush");
        assert_eq!(handle.state(), ConnectionState::Closed);

        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.flush().await.expect("flush");

        assert!(refreshed.load(Ordering::SeqCst));
        // The link the refresh produced is closed without ever being used.
        assert_eq!(inner.opens(), 1);
        assert_eq!(inner.closes(), 1);
        let snap = handle.snapshot();
        assert_eq!(snap.state, ConnectionState::Closed);
        assert_eq!(snap.live_links, 0);
        assert!(!snap.reconnect_scheduled);
        assert!(sink.errors().is_empty());
        assert_eq!(sink.closes(), vec![CloseReason::Manual]);
    }
}
