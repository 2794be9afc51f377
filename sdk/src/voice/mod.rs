pub mod backoff;
pub mod connection;
pub mod coordinator;
pub(crate) mod driver;
pub mod heartbeat;
pub mod session;
pub mod state_history;

pub use connection::{ConnectionState, SessionKey, UdpTransport, VoiceConnection};
pub use coordinator::VoiceSessionCoordinator;
pub use heartbeat::{HeartbeatSignal, HeartbeatTimer};
pub use session::{ReadySession, VoiceSession};
pub use state_history::{VoiceStateHistory, VoiceStateStore};
