//! Notification client: one shared server-push stream, many subscribers.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};
use wfgame_protocol::notification::{self, NotificationKind};

use crate::auth::CredentialProvider;
use crate::config::RealtimeConfig;
use crate::connection::{
    ChannelContext, ChannelSink, ConnectionHandle, ConnectionSnapshot, ConnectionState,
    ReconnectPolicy, Transport,
};
use crate::error::RealtimeError;
use crate::registry::{EventRegistry, Handler};
use crate::subscription::Subscription;
use crate::transport::SseTransport;

/// Handle to the notification stream (cheap to Clone).
///
/// Every clone shares the same connection and handler set.
#[derive(Clone)]
pub struct NotificationClient {
    registry: Arc<EventRegistry<Value>>,
    connection: ConnectionHandle,
}

impl NotificationClient {
    /// Client for `config.stream_url()`, authenticated through `credentials`.
    pub fn new(
        config: &RealtimeConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, RealtimeError> {
        let client = reqwest::Client::builder().build()?;
        let transport = SseTransport::new(client, config.stream_url()?, credentials);
        Ok(Self::with_transport(
            Arc::new(transport),
            config.notification_policy(),
        ))
    }

    pub fn with_transport(transport: Arc<dyn Transport>, policy: ReconnectPolicy) -> Self {
        let registry = Arc::new(EventRegistry::new("notifications"));
        let sink = NotificationSink {
            registry: Arc::clone(&registry),
        };
        let connection = ConnectionHandle::spawn("notifications", transport, Arc::new(sink), policy);
        for event in notification::RESERVED_EVENTS {
            connection.subscribe(event);
        }
        Self {
            registry,
            connection,
        }
    }

    /// Call `handler` with the decoded JSON payload of every `event`.
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_handler(event, Arc::new(handler))
    }

    /// Like [`on`](Self::on), with the payload deserialised into `T`.
    /// Payloads that don't fit `T` are logged and skipped.
    pub fn on_typed<T, F>(&self, event: &str, handler: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = event.to_string();
        self.on(event, move |value: &Value| {
            match notification::decode_typed::<T>(value) {
                Ok(typed) => handler(typed),
                Err(e) => {
                    warn!(
                        component = "notifications",
                        event = "notifications.payload.type_mismatch",
                        event_name = %name,
                        error = %e,
                        "Payload does not match handler type, skipping"
                    );
                    Ok(())
                }
            }
        })
    }

    /// Register a shared handler. The same `Arc` registered twice fires once.
    pub fn on_handler(&self, event: &str, handler: Handler<Value>) -> Subscription {
        if notification::is_reserved(event) {
            warn!(
                component = "notifications",
                event = "notifications.subscribe.reserved",
                event_name = event,
                "Reserved events are handled internally and never reach handlers"
            );
        }
        let registration = self.registry.register(event, handler);
        if registration.first_for_event {
            self.connection.subscribe(event);
        }
        Subscription::new(&self.registry, event, registration.id)
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn snapshot(&self) -> Arc<ConnectionSnapshot> {
        self.connection.snapshot()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.registry.handler_count(event)
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Stop the stream task for good.
    pub fn shutdown(&self) {
        self.connection.shutdown();
        self.registry.clear();
    }
}

struct NotificationSink {
    registry: Arc<EventRegistry<Value>>,
}

impl ChannelSink for NotificationSink {
    fn on_frame(&self, ctx: &mut ChannelContext, event: &str, data: &str) {
        match notification::classify(event) {
            NotificationKind::ConnectionEstablished => {
                debug!(
                    component = "notifications",
                    event = "notifications.connection_established",
                    "Server acknowledged stream, re-registering events"
                );
                ctx.resubscribe_all();
            }
            NotificationKind::Heartbeat => {}
            NotificationKind::Business(name) => match notification::decode_payload(data) {
                Ok(payload) => {
                    self.registry.dispatch(name, &payload);
                }
                Err(e) => {
                    warn!(
                        component = "notifications",
                        event = "notifications.payload.undecodable",
                        event_name = name,
                        error = %e,
                        "Dropping event with malformed payload"
                    );
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;
    use std::sync::Mutex;
    use wfgame_protocol::OcrTaskUpdate;

    fn client(transport: &FakeTransport) -> NotificationClient {
        NotificationClient::with_transport(Arc::new(transport.clone()), ReconnectPolicy::default())
    }

    #[tokio::test]
    async fn end_to_end_delivery_after_connection_established() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&received);
        let _ocr = client.on("ocr_task_update", move |payload: &Value| -> anyhow::Result<()> {
            sink.lock().unwrap().push(payload.clone());
            Ok(())
        });
        let _broadcast = client.on("broadcast", |_: &Value| -> anyhow::Result<()> { Ok(()) });
        let _message = client.on("message", |_: &Value| -> anyhow::Result<()> { Ok(()) });

        client.connect();
        let link = transport.wait_for_link(1).await;
        link.opened();
        link.frame("connection_established", "{}");
        link.frame("ocr_task_update", r#"{"taskId":"42","status":"done"}"#);
        client.connection().flush().await.expect("flush");

        let mut listens = transport.listens();
        listens.sort();
        assert_eq!(
            listens,
            vec![
                "broadcast",
                "connection_established",
                "heartbeat",
                "message",
                "ocr_task_update",
            ]
        );
        assert_eq!(
            *received.lock().unwrap(),
            vec![serde_json::json!({ "taskId": "42", "status": "done" })]
        );
    }

    #[tokio::test]
    async fn malformed_payload_never_reaches_handlers() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        let calls = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&calls);
        let _sub = client.on("notification", move |_: &Value| -> anyhow::Result<()> {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        client.connect();
        let link = transport.wait_for_link(1).await;
        link.opened();
        link.frame("notification", "{not valid json");
        link.frame("notification", r#"{"ok":true}"#);
        client.connection().flush().await.expect("flush");

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        let calls = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&calls);
        let sub = client.on("broadcast", move |_: &Value| -> anyhow::Result<()> {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        client.connect();
        let link = transport.wait_for_link(1).await;
        link.opened();
        link.frame("broadcast", "{}");
        client.connection().flush().await.expect("flush");

        drop(sub);
        link.frame("broadcast", "{}");
        client.connection().flush().await.expect("flush");

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(client.handler_count("broadcast"), 0);
    }

    #[tokio::test]
    async fn reserved_events_are_not_forwarded() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        let calls = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&calls);
        let _sub = client.on("heartbeat", move |_: &Value| -> anyhow::Result<()> {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        client.connect();
        let link = transport.wait_for_link(1).await;
        link.opened();
        link.frame("heartbeat", "");
        client.connection().flush().await.expect("flush");

        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn typed_handlers_skip_mismatched_payloads() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        let updates = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&updates);
        let _sub = client.on_typed(
            "ocr_task_update",
            move |update: OcrTaskUpdate| -> anyhow::Result<()> {
                sink.lock().unwrap().push(update);
                Ok(())
            },
        );

        client.connect();
        let link = transport.wait_for_link(1).await;
        link.opened();
        link.frame("ocr_task_update", r#"{"status":"running"}"#);
        link.frame(
            "ocr_task_update",
            r#"{"taskId":"7","status":"running","progress":0.5}"#,
        );
        client.connection().flush().await.expect("flush");

        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].task_id, "7");
        assert_eq!(updates[0].progress, Some(0.5));
    }

    #[tokio::test]
    async fn clones_share_one_connection() {
        let transport = FakeTransport::default();
        let client = client(&transport);
        let other = client.clone();

        client.connect();
        other.connect();
        client.connection().flush().await.expect("flush");

        assert!(client.connection().is_same(other.connection()));
        assert_eq!(transport.opens(), 1);
    }
}
