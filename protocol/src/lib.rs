//! Wire types for the per-room voice signaling gateway and the parent gateway
//! frames that bootstrap it.

pub mod close_code;
pub mod error;
pub mod events;
pub mod id;
pub mod opcode;
pub mod packet;

pub use close_code::{CloseCategory, VoiceCloseCode};
pub use error::ProtocolError;
pub use events::{ParentEvent, VoiceServerUpdate, VoiceState, VoiceStateIntent};
pub use id::{ChannelId, RoomId, UserId};
pub use opcode::VoiceOpcode;
pub use packet::{
    speaking, ClientDisconnect, GatewayMessage, Hello, Identify, Ready, Resume, SelectProtocol,
    SelectProtocolData, SessionDescription, Speaking, VoicePacket,
};
