//! Error types for the voice SDK.

use std::time::Duration;

use thiserror::Error;
use voicegate_protocol::{close_code, ProtocolError, RoomId};

use crate::voice::ConnectionState;

/// Errors surfaced by the coordinator and by voice connections.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Room {0} already has a live voice connection")]
    AlreadyConnected(RoomId),

    #[error("Room {0} has no voice connection")]
    NotConnected(RoomId),

    #[error("Room {room_id}: voice handshake fragments not received within {timeout:?}")]
    HandshakeTimeout { room_id: RoomId, timeout: Duration },

    #[error("Room {0}: pending voice session was dropped before it became ready")]
    SessionAbandoned(RoomId),

    #[error("Room {room_id}: connection is {state:?}, not ready")]
    NotReady {
        room_id: RoomId,
        state: ConnectionState,
    },

    #[error("Voice gateway closed with {code}: {description}")]
    Fatal {
        code: u16,
        description: &'static str,
    },

    #[error("Server offered no supported encryption mode (offered: {offered:?})")]
    NoSupportedEncryptionMode { offered: Vec<String> },

    #[error("Room {room_id}: gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { room_id: RoomId, attempts: u32 },

    #[error("Parent gateway error: {0}")]
    Gateway(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Config error: {0}")]
    Config(String),
}

impl VoiceError {
    /// Error for a close code that ends the connection.
    #[must_use]
    pub fn fatal(code: u16) -> Self {
        VoiceError::Fatal {
            code,
            description: close_code::describe(code),
        }
    }

    /// The close code behind a fatal error, if any.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        match self {
            VoiceError::Fatal { code, .. } => Some(*code),
            _ => None,
        }
    }
}
