//! WFGame AI realtime clients
//!
//! Two channels feed the console with live data:
//!
//! - the notification stream, a single authenticated server-sent events
//!   connection shared by every subscriber in the process
//! - replay rooms, one Socket.IO connection per task execution room, shared
//!   by every observer of that room
//!
//! Both sit on the same [`ConnectionHandle`] actor, which owns the single
//! live link of a channel and handles reconnection. Consumers only ever see
//! handler registrations, returned as [`Subscription`] guards.

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod notification;
pub mod registry;
pub mod room;
pub mod subscription;
pub mod transport;

#[cfg(test)]
mod testing;

pub use auth::{AccessToken, CredentialProvider, FnCredentials, StaticCredentials};
pub use config::{RealtimeConfig, SocketConfig};
pub use connection::{
    ConnectionHandle, ConnectionSnapshot, ConnectionState, ReconnectPolicy, Transport,
};
pub use error::{ConfigError, CredentialError, OpenError, RealtimeError, TransportError};
pub use hub::RealtimeHub;
pub use notification::NotificationClient;
pub use registry::{DispatchReport, EventRegistry, Handler, HandlerId, Registration};
pub use room::{RoomCallbacks, RoomEventKind, RoomHub, RoomSignal, RoomSocket};
pub use subscription::Subscription;
