use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::id::{RoomId, UserId};
use crate::opcode::VoiceOpcode;

/// Frame envelope shared by the voice gateway and the parent gateway.
///
/// `t` is only present on parent dispatch frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayMessage {
    #[must_use]
    pub fn new(op: u8, d: Option<Value>) -> Self {
        Self { op, d, s: None, t: None }
    }

    /// Parse a text frame.
    ///
    /// # Errors
    /// Returns error if the frame is not a JSON object with an integer `op`.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to a text frame.
    ///
    /// # Errors
    /// Returns error if the payload cannot be represented as JSON.
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identify {
    pub server_id: RoomId,
    pub user_id: UserId,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectProtocol {
    pub protocol: String,
    pub data: SelectProtocolData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

impl SelectProtocol {
    /// `SELECT_PROTOCOL` for the UDP media transport.
    #[must_use]
    pub fn udp(address: impl Into<String>, port: u16, mode: impl Into<String>) -> Self {
        Self {
            protocol: "udp".to_string(),
            data: SelectProtocolData {
                address: address.into(),
                port,
                mode: mode.into(),
            },
        }
    }
}

/// Media transport parameters assigned by the voice server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ready {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    /// Encryption modes the server accepts. Older servers omit it.
    #[serde(default)]
    pub modes: Vec<String>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub mode: String,
    pub secret_key: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_session_id: Option<String>,
}

// Never print key bytes.
impl fmt::Debug for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDescription")
            .field("mode", &self.mode)
            .field("secret_key", &format_args!("<{} bytes>", self.secret_key.len()))
            .field("media_session_id", &self.media_session_id)
            .finish()
    }
}

/// Speaking bitmask values.
pub mod speaking {
    pub const NONE: u8 = 0;
    pub const MICROPHONE: u8 = 1 << 0;
    pub const SOUNDSHARE: u8 = 1 << 1;
    pub const PRIORITY: u8 = 1 << 2;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speaking {
    pub speaking: u8,
    #[serde(default)]
    pub delay: u32,
    pub ssrc: u32,
    /// Set by the server when relaying another user's speaking state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resume {
    pub server_id: RoomId,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Milliseconds. Some servers send a float.
    pub heartbeat_interval: f64,
}

impl Hello {
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval.max(0.0) as u64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDisconnect {
    #[serde(default)]
    pub user_id: Option<UserId>,
}

/// Voice gateway packets, decoded once from the JSON envelope.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum VoicePacket {
    Identify(Identify),
    SelectProtocol(SelectProtocol),
    Ready(Ready),
    Heartbeat { nonce: u64 },
    SessionDescription(SessionDescription),
    Speaking(Speaking),
    HeartbeatAck { nonce: Option<u64> },
    Resume(Resume),
    Hello(Hello),
    Resumed,
    ClientDisconnect(ClientDisconnect),
}

impl VoicePacket {
    #[must_use]
    pub fn opcode(&self) -> VoiceOpcode {
        match self {
            Self::Identify(_) => VoiceOpcode::Identify,
            Self::SelectProtocol(_) => VoiceOpcode::SelectProtocol,
            Self::Ready(_) => VoiceOpcode::Ready,
            Self::Heartbeat { .. } => VoiceOpcode::Heartbeat,
            Self::SessionDescription(_) => VoiceOpcode::SessionDescription,
            Self::Speaking(_) => VoiceOpcode::Speaking,
            Self::HeartbeatAck { .. } => VoiceOpcode::HeartbeatAck,
            Self::Resume(_) => VoiceOpcode::Resume,
            Self::Hello(_) => VoiceOpcode::Hello,
            Self::Resumed => VoiceOpcode::Resumed,
            Self::ClientDisconnect(_) => VoiceOpcode::ClientDisconnect,
        }
    }

    /// Decode a text frame.
    ///
    /// # Errors
    /// Returns error on malformed JSON, unknown opcode, or a payload that does not
    /// match the opcode.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Self::from_message(GatewayMessage::parse(text)?)
    }

    /// Interpret an already parsed envelope.
    ///
    /// # Errors
    /// See [`VoicePacket::decode`].
    pub fn from_message(message: GatewayMessage) -> Result<Self, ProtocolError> {
        let opcode = VoiceOpcode::try_from(message.op)?;
        let d = message.d;

        let packet = match opcode {
            VoiceOpcode::Identify => Self::Identify(payload(opcode, d)?),
            VoiceOpcode::SelectProtocol => Self::SelectProtocol(payload(opcode, d)?),
            VoiceOpcode::Ready => Self::Ready(payload(opcode, d)?),
            VoiceOpcode::Heartbeat => Self::Heartbeat {
                nonce: payload(opcode, d)?,
            },
            VoiceOpcode::SessionDescription => Self::SessionDescription(payload(opcode, d)?),
            VoiceOpcode::Speaking => Self::Speaking(payload(opcode, d)?),
            VoiceOpcode::HeartbeatAck => Self::HeartbeatAck {
                nonce: d.as_ref().and_then(Value::as_u64),
            },
            VoiceOpcode::Resume => Self::Resume(payload(opcode, d)?),
            VoiceOpcode::Hello => Self::Hello(payload(opcode, d)?),
            VoiceOpcode::Resumed => Self::Resumed,
            VoiceOpcode::ClientDisconnect => match d {
                Some(d) if !d.is_null() => Self::ClientDisconnect(serde_json::from_value(d)?),
                _ => Self::ClientDisconnect(ClientDisconnect::default()),
            },
        };

        Ok(packet)
    }

    /// Build the JSON envelope for this packet.
    ///
    /// # Errors
    /// Returns error if the payload cannot be represented as JSON.
    pub fn to_message(&self) -> Result<GatewayMessage, ProtocolError> {
        let d = match self {
            Self::Identify(p) => serde_json::to_value(p)?,
            Self::SelectProtocol(p) => serde_json::to_value(p)?,
            Self::Ready(p) => serde_json::to_value(p)?,
            Self::Heartbeat { nonce } => Value::from(*nonce),
            Self::SessionDescription(p) => serde_json::to_value(p)?,
            Self::Speaking(p) => serde_json::to_value(p)?,
            Self::HeartbeatAck { nonce } => nonce.map_or(Value::Null, Value::from),
            Self::Resume(p) => serde_json::to_value(p)?,
            Self::Hello(p) => serde_json::to_value(p)?,
            Self::Resumed => Value::Null,
            Self::ClientDisconnect(p) => serde_json::to_value(p)?,
        };

        Ok(GatewayMessage::new(self.opcode().as_u8(), Some(d)))
    }

    /// Encode to a text frame.
    ///
    /// # Errors
    /// Returns error if the payload cannot be represented as JSON.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_message()?.to_text()
    }
}

fn payload<T: DeserializeOwned>(opcode: VoiceOpcode, d: Option<Value>) -> Result<T, ProtocolError> {
    match d {
        Some(d) if !d.is_null() => Ok(serde_json::from_value(d)?),
        _ => Err(ProtocolError::MissingPayload {
            opcode: opcode.as_u8(),
        }),
    }
}
