pub mod event_bridge;
pub mod parent;
pub mod ws_client;

pub use event_bridge::{ClientEvent, EventBridge};
pub use parent::{FrameQueueGateway, ParentGateway};
pub use ws_client::{Dialer, SocketFrame, VoiceSocket, WsDialer, WsSocket};
