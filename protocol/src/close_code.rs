//! Voice gateway close codes and how a client should react to them.

/// How a client reacts to a socket close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCategory {
    /// Re-dial and continue; invisible to the caller.
    Reconnect,
    /// Stop and report to the caller.
    Fatal,
    /// The server removed us from the channel. Clean if we asked for it, fatal otherwise.
    Disconnected,
}

macro_rules! close_codes {
    ($($name:ident = $code:literal => $category:ident, $description:literal;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum VoiceCloseCode { $($name = $code,)* }

        impl VoiceCloseCode {
            #[must_use]
            pub fn from_code(code: u16) -> Option<Self> {
                match code {
                    $($code => Some(Self::$name),)*
                    _ => None,
                }
            }

            #[must_use]
            pub const fn code(self) -> u16 {
                self as u16
            }

            #[must_use]
            pub const fn category(self) -> CloseCategory {
                match self {
                    $(Self::$name => CloseCategory::$category,)*
                }
            }

            #[must_use]
            pub const fn description(self) -> &'static str {
                match self {
                    $(Self::$name => $description,)*
                }
            }
        }
    };
}

close_codes! {
    UnknownOpcode = 4001 => Fatal, "Unknown opcode. Check your gateway opcode and/or payload.";
    DecodeFailure = 4002 => Fatal, "Failed to decode payload. Check your gateway payload.";
    NotAuthenticated = 4003 => Fatal, "Not authenticated. Identify before sending a payload.";
    AuthenticationFailed = 4004 => Fatal, "Authentication failed. The token used while identifying is invalid.";
    AlreadyAuthenticated = 4005 => Reconnect, "Already authenticated.";
    SessionInvalid = 4006 => Fatal, "Session no longer valid.";
    SessionTimeout = 4009 => Reconnect, "Timed out. Reconnect and try again.";
    ServerNotFound = 4011 => Fatal, "Voice server not found.";
    UnknownProtocol = 4012 => Fatal, "Unknown protocol.";
    Disconnected = 4014 => Disconnected, "Disconnected. You got removed from the channel or the channel itself was deleted. Do not reconnect.";
    VoiceServerCrashed = 4015 => Reconnect, "Voice server crashed. Resume the session.";
    UnknownEncryptionMode = 4016 => Fatal, "Unknown encryption mode.";
}

/// Category for a raw close code; codes outside the table are transient.
#[must_use]
pub fn categorize(code: u16) -> CloseCategory {
    VoiceCloseCode::from_code(code).map_or(CloseCategory::Reconnect, VoiceCloseCode::category)
}

/// Human readable description for any close code.
#[must_use]
pub fn describe(code: u16) -> &'static str {
    VoiceCloseCode::from_code(code).map_or("Connection closed.", VoiceCloseCode::description)
}
