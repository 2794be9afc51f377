//! Parent gateway payloads: the two voice dispatch events and the state intent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::id::{ChannelId, RoomId, UserId};
use crate::opcode::parent;
use crate::packet::GatewayMessage;

pub const VOICE_STATE_UPDATE: &str = "VOICE_STATE_UPDATE";
pub const VOICE_SERVER_UPDATE: &str = "VOICE_SERVER_UPDATE";

/// A user's voice presence in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceState {
    #[serde(default, rename = "guild_id")]
    pub room_id: Option<RoomId>,
    /// `None` when the user left voice.
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    pub user_id: UserId,
    pub session_id: String,
    #[serde(default)]
    pub deaf: bool,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub self_stream: bool,
    #[serde(default)]
    pub self_video: bool,
    #[serde(default)]
    pub suppress: bool,
    /// ISO8601 timestamp, only set in stage channels.
    #[serde(default)]
    pub request_to_speak_timestamp: Option<String>,
}

impl VoiceState {
    /// Whether the user is currently in a voice channel.
    #[must_use]
    pub fn joined(&self) -> bool {
        self.channel_id.is_some()
    }
}

/// Voice server assignment for a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceServerUpdate {
    #[serde(rename = "guild_id")]
    pub room_id: RoomId,
    pub token: String,
    /// `None` while the server is still being allocated.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Dispatch sequence of the carrying frame; not part of the payload.
    #[serde(skip)]
    pub sequence: u64,
}

/// Parent dispatch events, decoded once at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ParentEvent {
    VoiceStateUpdate(VoiceState),
    VoiceServerUpdate(VoiceServerUpdate),
    /// Any event this crate does not own, left untouched.
    Other {
        name: String,
        data: Value,
        sequence: Option<u64>,
    },
    /// A non-dispatch frame (hello, heartbeat ack, ...), left untouched.
    Control(GatewayMessage),
}

impl ParentEvent {
    /// Decode a dispatch by event name.
    ///
    /// # Errors
    /// Returns error if a voice event payload is malformed. Unknown events never fail.
    pub fn decode(name: &str, data: Value, sequence: Option<u64>) -> Result<Self, ProtocolError> {
        match name {
            VOICE_STATE_UPDATE => Ok(Self::VoiceStateUpdate(serde_json::from_value(data)?)),
            VOICE_SERVER_UPDATE => {
                let mut update: VoiceServerUpdate = serde_json::from_value(data)?;
                update.sequence = sequence.unwrap_or_default();
                Ok(Self::VoiceServerUpdate(update))
            }
            _ => Ok(Self::Other {
                name: name.to_string(),
                data,
                sequence,
            }),
        }
    }

    /// Decode a raw parent frame. Dispatches (`op` 0 with `t`, `s`, `d`) are
    /// decoded by name; any other opcode comes back as `Control`.
    ///
    /// # Errors
    /// Returns error if a dispatch has no event name or its voice payload is malformed.
    pub fn from_message(message: GatewayMessage) -> Result<Self, ProtocolError> {
        if message.op != parent::DISPATCH {
            return Ok(Self::Control(message));
        }
        let name = message.t.ok_or(ProtocolError::MissingEventName)?;
        Self::decode(&name, message.d.unwrap_or(Value::Null), message.s)
    }

    /// Dispatch event name, empty for `Control`.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::VoiceStateUpdate(_) => VOICE_STATE_UPDATE,
            Self::VoiceServerUpdate(_) => VOICE_SERVER_UPDATE,
            Self::Other { name, .. } => name.as_str(),
            Self::Control(_) => "",
        }
    }
}

/// Request to join, move within, or leave voice in a room, sent on the parent socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateIntent {
    #[serde(rename = "guild_id")]
    pub room_id: RoomId,
    /// Serialized as `null` to leave.
    pub channel_id: Option<ChannelId>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl VoiceStateIntent {
    #[must_use]
    pub fn join(room_id: RoomId, channel_id: ChannelId, self_mute: bool, self_deaf: bool) -> Self {
        Self {
            room_id,
            channel_id: Some(channel_id),
            self_mute,
            self_deaf,
        }
    }

    #[must_use]
    pub fn leave(room_id: RoomId) -> Self {
        Self {
            room_id,
            channel_id: None,
            self_mute: false,
            self_deaf: false,
        }
    }

    /// Envelope for the parent socket.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_message(&self) -> Result<GatewayMessage, ProtocolError> {
        Ok(GatewayMessage::new(
            parent::VOICE_STATE_UPDATE,
            Some(serde_json::to_value(self)?),
        ))
    }

    /// Text frame for the parent socket.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_message()?.to_text()
    }
}
