//! Concrete transports behind the connection manager.

pub mod socketio;
pub mod sse;

pub use socketio::SocketIoTransport;
pub use sse::SseTransport;
