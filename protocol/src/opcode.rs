use crate::error::ProtocolError;

macro_rules! opcodes {
    ($($(#[$meta:meta])* $name:ident = $val:literal),* $(,)?) => {
        /// Voice gateway opcodes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum VoiceOpcode { $($(#[$meta])* $name = $val,)* }

        impl VoiceOpcode {
            #[must_use]
            pub const fn as_u8(self) -> u8 { self as u8 }
        }

        impl TryFrom<u8> for VoiceOpcode {
            type Error = ProtocolError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($val => Ok(Self::$name),)*
                    _ => Err(ProtocolError::UnknownOpcode(value)),
                }
            }
        }
    };
}

opcodes! {
    // Handshake
    Identify = 0,
    SelectProtocol = 1,
    Ready = 2,
    Heartbeat = 3,
    SessionDescription = 4,
    Speaking = 5,
    HeartbeatAck = 6,
    Resume = 7,
    Hello = 8,
    Resumed = 9,

    /// Another user's media session ended.
    ClientDisconnect = 13,
}

/// Opcodes of the parent event gateway that this crate touches.
pub mod parent {
    /// Event dispatch carrying a `t` event name.
    pub const DISPATCH: u8 = 0;
    /// Voice state intent: join, move or leave a voice channel.
    pub const VOICE_STATE_UPDATE: u8 = 4;
}
