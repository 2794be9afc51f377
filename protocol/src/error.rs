use std::fmt;

/// Protocol decoding errors.
#[derive(Debug)]
pub enum ProtocolError {
    /// Frame or payload is not valid JSON for the expected shape.
    Json(serde_json::Error),
    UnknownOpcode(u8),
    /// Opcode requires a `d` payload but the frame carried none.
    MissingPayload { opcode: u8 },
    /// A parent dispatch frame without an event name.
    MissingEventName,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Json(e) => write!(f, "invalid frame: {}", e),
            ProtocolError::UnknownOpcode(op) => write!(f, "unknown opcode: {}", op),
            ProtocolError::MissingPayload { opcode } => {
                write!(f, "opcode {} requires a payload", opcode)
            }
            ProtocolError::MissingEventName => write!(f, "dispatch frame has no event name"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e)
    }
}
