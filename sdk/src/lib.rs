//! Per-room voice signaling sessions on top of an existing parent gateway
//! connection.

pub mod client;
pub mod config;
pub mod error;
pub mod network;
pub mod voice;

pub use client::VoiceClient;
pub use config::VoiceConfig;
pub use error::VoiceError;
pub use network::{
    ClientEvent, Dialer, EventBridge, FrameQueueGateway, ParentGateway, SocketFrame, VoiceSocket,
    WsDialer,
};
pub use voice::{
    ConnectionState, SessionKey, UdpTransport, VoiceConnection, VoiceSessionCoordinator,
    VoiceStateHistory, VoiceStateStore,
};

pub use voicegate_protocol as protocol;
