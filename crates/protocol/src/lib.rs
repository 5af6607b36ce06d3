//! WFGame AI realtime protocol
//!
//! Wire vocabulary shared by the realtime client and its tests: the
//! notification stream (SSE) event names, the replay room event shapes, and
//! the Engine.IO / Socket.IO text framing the room server speaks.
//! Nothing here performs I/O.

pub mod notification;
pub mod room;
pub mod socketio;
pub mod types;

pub use notification::{NotificationKind, OcrTaskUpdate};
pub use room::{ReplayFrame, RoomEvent, RoomRequest, StepUpdate, SysMsg};
pub use socketio::{EnginePacket, Handshake, SocketPacket, DEFAULT_NAMESPACE, ENGINE_IO_VERSION};
pub use types::*;
