//! In-memory transport and sink used by the unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Notify;

use crate::connection::{
    ChannelContext, ChannelSink, CloseReason, Link, LinkEvents, OpenFuture, Transport,
};
use crate::error::{OpenError, TransportError};

#[derive(Default)]
struct FakeState {
    links: Vec<LinkEvents>,
    failures: VecDeque<OpenError>,
    listens: Vec<String>,
    emits: Vec<(String, Value)>,
    closes: usize,
}

/// Records every open, listen, emit and close. Opens resolve immediately;
/// the test drives the link through the returned [`LinkEvents`].
#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
    opened: Arc<Notify>,
}

impl FakeTransport {
    fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub(crate) fn fail_next_open(&self, error: OpenError) {
        self.with_state(|s| s.failures.push_back(error));
    }

    pub(crate) fn opens(&self) -> usize {
        self.with_state(|s| s.links.len())
    }

    pub(crate) fn listens(&self) -> Vec<String> {
        self.with_state(|s| s.listens.clone())
    }

    pub(crate) fn emits(&self) -> Vec<(String, Value)> {
        self.with_state(|s| s.emits.clone())
    }

    pub(crate) fn closes(&self) -> usize {
        self.with_state(|s| s.closes)
    }

    /// Wait until the `n`th open (1-based) happened and return its event sender.
    pub(crate) async fn wait_for_link(&self, n: usize) -> LinkEvents {
        loop {
            let notified = self.opened.notified();
            if let Some(link) = self.with_state(|s| s.links.get(n - 1).cloned()) {
                return link;
            }
            notified.await;
        }
    }
}

impl Transport for FakeTransport {
    fn open(&self, events: LinkEvents) -> OpenFuture {
        let failure = self.with_state(|s| {
            s.links.push(events);
            s.failures.pop_front()
        });
        self.opened.notify_waiters();
        let link = FakeLink {
            state: Arc::clone(&self.state),
            closed: false,
        };
        Box::pin(async move {
            match failure {
                Some(error) => Err(error),
                None => Ok(Box::new(link) as Box<dyn Link>),
            }
        })
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

struct FakeLink {
    state: Arc<Mutex<FakeState>>,
    closed: bool,
}

impl Link for FakeLink {
    fn listen(&mut self, event: &str) {
        self.state.lock().unwrap().listens.push(event.to_string());
    }

    fn emit(&mut self, event: &str, payload: &Value) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.state
            .lock()
            .unwrap()
            .emits
            .push((event.to_string(), payload.clone()));
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().unwrap().closes += 1;
        }
    }
}

#[derive(Default)]
struct SinkState {
    frames: Vec<(String, String)>,
    errors: Vec<String>,
    closes: Vec<CloseReason>,
    reconnect_failures: Vec<u32>,
    on_open: Vec<(String, Value)>,
}

/// Sink that records callbacks and can emit on open.
#[derive(Default)]
pub(crate) struct RecordingSink {
    state: Mutex<SinkState>,
    frame_seen: Notify,
}

impl RecordingSink {
    pub(crate) fn emit_on_open(&self, event: &str, payload: Value) {
        self.state
            .lock()
            .unwrap()
            .on_open
            .push((event.to_string(), payload));
    }

    pub(crate) fn frames(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().frames.clone()
    }

    pub(crate) fn errors(&self) -> Vec<String> {
        self.state.lock().unwrap().errors.clone()
    }

    pub(crate) fn closes(&self) -> Vec<CloseReason> {
        self.state.lock().unwrap().closes.clone()
    }

    pub(crate) fn reconnect_failures(&self) -> Vec<u32> {
        self.state.lock().unwrap().reconnect_failures.clone()
    }

    pub(crate) async fn wait_for_frames(&self, n: usize) {
        loop {
            let notified = self.frame_seen.notified();
            if self.state.lock().unwrap().frames.len() >= n {
                return;
            }
            notified.await;
        }
    }
}

impl ChannelSink for RecordingSink {
    fn on_open(&self, ctx: &mut ChannelContext) {
        for (event, payload) in self.state.lock().unwrap().on_open.iter() {
            ctx.emit(event.clone(), payload.clone());
        }
    }

    fn on_frame(&self, _ctx: &mut ChannelContext, event: &str, data: &str) {
        self.state
            .lock()
            .unwrap()
            .frames
            .push((event.to_string(), data.to_string()));
        self.frame_seen.notify_waiters();
    }

    fn on_error(&self, error: &str) {
        self.state.lock().unwrap().errors.push(error.to_string());
    }

    fn on_closed(&self, reason: &CloseReason) {
        self.state.lock().unwrap().closes.push(reason.clone());
    }

    fn on_reconnect_failed(&self, attempts: u32) {
        self.state
            .lock()
            .unwrap()
            .reconnect_failures
            .push(attempts);
    }
}
