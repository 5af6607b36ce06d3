//! Process-wide entry point holding the shared clients.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use crate::auth::CredentialProvider;
use crate::config::RealtimeConfig;
use crate::connection::Transport;
use crate::error::RealtimeError;
use crate::notification::NotificationClient;
use crate::room::RoomHub;

type NotificationFactory = dyn Fn() -> Result<NotificationClient, RealtimeError> + Send + Sync;

/// Owns the one notification stream and the room hub for a process.
///
/// Create it once at startup and hand clones to whatever needs realtime
/// data; every clone sees the same connections.
#[derive(Clone)]
pub struct RealtimeHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: RealtimeConfig,
    notifications: Mutex<Option<NotificationClient>>,
    make_notifications: Box<NotificationFactory>,
    rooms: RoomHub,
}

impl RealtimeHub {
    pub fn new(
        config: RealtimeConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, RealtimeError> {
        let rooms = RoomHub::new(&config)?;
        let factory_config = config.clone();
        let make_notifications =
            Box::new(move || NotificationClient::new(&factory_config, Arc::clone(&credentials)));
        Ok(Self::from_parts(config, rooms, make_notifications))
    }

    /// Hub over caller-supplied transports.
    pub fn with_transports(
        config: RealtimeConfig,
        notifications: Arc<dyn Transport>,
        rooms: Arc<dyn Transport>,
    ) -> Self {
        let policy = config.notification_policy();
        let room_hub = RoomHub::with_transport(rooms, config.room_policy());
        let make_notifications = Box::new(move || -> Result<NotificationClient, RealtimeError> {
            Ok(NotificationClient::with_transport(
                Arc::clone(&notifications),
                policy,
            ))
        });
        Self::from_parts(config, room_hub, make_notifications)
    }

    fn from_parts(
        config: RealtimeConfig,
        rooms: RoomHub,
        make_notifications: Box<NotificationFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                notifications: Mutex::new(None),
                make_notifications,
                rooms,
            }),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    /// The notification client, created on first use.
    pub fn notifications(&self) -> Result<NotificationClient, RealtimeError> {
        let mut slot = self
            .inner
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = (self.inner.make_notifications)()?;
        *slot = Some(client.clone());
        Ok(client)
    }

    pub fn rooms(&self) -> &RoomHub {
        &self.inner.rooms
    }

    /// Disconnect the notification stream and release every room.
    pub fn shutdown(&self) {
        let client = self
            .inner
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(client) = client {
            client.disconnect();
            client.shutdown();
        }
        let rooms = self.inner.rooms.rooms();
        self.inner.rooms.release_all();
        info!(
            component = "hub",
            event = "hub.shutdown",
            rooms_released = rooms.len(),
            "Realtime hub shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::room::RoomCallbacks;
    use crate::testing::FakeTransport;

    fn hub(notifications: &FakeTransport, rooms: &FakeTransport) -> RealtimeHub {
        RealtimeHub::with_transports(
            RealtimeConfig::default(),
            Arc::new(notifications.clone()),
            Arc::new(rooms.clone()),
        )
    }

    #[tokio::test]
    async fn notifications_are_created_once() {
        let (stream, sockets) = (FakeTransport::default(), FakeTransport::default());
        let hub = hub(&stream, &sockets);

        let first = hub.notifications().expect("client");
        let second = hub.clone().notifications().expect("client");
        assert!(first.connection().is_same(second.connection()));

        first.connect();
        second.connect();
        first.connection().flush().await.expect("flush");
        assert_eq!(stream.opens(), 1);
    }

    #[tokio::test]
    async fn shutdown_releases_everything() {
        let (stream, sockets) = (FakeTransport::default(), FakeTransport::default());
        let hub = hub(&stream, &sockets);

        let client = hub.notifications().expect("client");
        client.connect();
        let room = hub.rooms().connect_socket("room7", RoomCallbacks::new());
        stream.wait_for_link(1).await.opened();
        sockets.wait_for_link(1).await.opened();
        room.connection()
            .wait_for_state(ConnectionState::Open)
            .await
            .expect("room open");

        hub.shutdown();
        client
            .connection()
            .wait_for_state(ConnectionState::Closed)
            .await
            .expect("stream closed");
        room.connection()
            .wait_for_state(ConnectionState::Closed)
            .await
            .expect("room closed");

        assert!(hub.rooms().rooms().is_empty());
        assert_eq!(sockets.emits().last().map(|(e, _)| e.as_str()), Some("leave"));
        assert!(!hub
            .notifications()
            .expect("fresh client")
            .connection()
            .is_same(client.connection()));
    }
}
