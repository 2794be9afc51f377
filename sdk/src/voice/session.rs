use std::fmt;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use voicegate_protocol::{RoomId, UserId};

/// A complete voice session: everything a connection needs to dial and identify.
#[derive(Clone, PartialEq, Eq)]
pub struct ReadySession {
    pub room_id: RoomId,
    pub session_id: String,
    pub user_id: UserId,
    pub token: String,
    pub endpoint: String,
    /// Sequence of the server fragment that supplied `token`, 0 if unknown.
    pub server_sequence: u64,
}

impl fmt::Debug for ReadySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadySession")
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("server_sequence", &self.server_sequence)
            .finish()
    }
}

/// Handshake fragments collected for one room while `connect` waits.
///
/// Fragments may arrive in any order and more than once. Each field is
/// last-write-wins; readiness fires once, when both halves are present.
pub struct VoiceSession {
    room_id: RoomId,
    session_id: Option<String>,
    user_id: Option<UserId>,
    token: Option<String>,
    endpoint: Option<String>,
    server_sequence: Option<u64>,
    ready_tx: Option<oneshot::Sender<ReadySession>>,
}

impl VoiceSession {
    pub fn new(room_id: RoomId) -> (Self, oneshot::Receiver<ReadySession>) {
        let (ready_tx, ready_rx) = oneshot::channel();

        let session = Self {
            room_id,
            session_id: None,
            user_id: None,
            token: None,
            endpoint: None,
            server_sequence: None,
            ready_tx: Some(ready_tx),
        };

        (session, ready_rx)
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Apply the state fragment. Returns `true` if this fired readiness.
    pub fn apply_state(&mut self, session_id: String, user_id: UserId) -> bool {
        trace!("[{}] State fragment: session_id={}", self.room_id, session_id);
        self.session_id = Some(session_id);
        self.user_id = Some(user_id);
        self.try_fire()
    }

    /// Apply the server fragment. A fragment older than the last applied one is
    /// ignored; sequence 0 means the carrier had none. Returns `true` if this
    /// fired readiness.
    pub fn apply_server(&mut self, token: String, endpoint: String, sequence: u64) -> bool {
        if let Some(last) = self.server_sequence {
            if sequence != 0 && sequence < last {
                debug!(
                    "[{}] Ignoring stale server fragment: sequence {} < {}",
                    self.room_id, sequence, last
                );
                return false;
            }
        }

        trace!("[{}] Server fragment: endpoint={}", self.room_id, endpoint);
        self.token = Some(token);
        self.endpoint = Some(endpoint);
        if sequence != 0 {
            self.server_sequence = Some(sequence);
        }
        self.try_fire()
    }

    pub fn is_complete(&self) -> bool {
        self.session_id.is_some()
            && self.user_id.is_some()
            && self.token.is_some()
            && self.endpoint.is_some()
    }

    pub fn has_fired(&self) -> bool {
        self.ready_tx.is_none()
    }

    /// Snapshot of the session if both fragments are present.
    pub fn ready_session(&self) -> Option<ReadySession> {
        Some(ReadySession {
            room_id: self.room_id,
            session_id: self.session_id.clone()?,
            user_id: self.user_id?,
            token: self.token.clone()?,
            endpoint: self.endpoint.clone()?,
            server_sequence: self.server_sequence.unwrap_or(0),
        })
    }

    fn try_fire(&mut self) -> bool {
        if self.ready_tx.is_none() {
            return false;
        }
        let Some(ready) = self.ready_session() else {
            return false;
        };
        let Some(ready_tx) = self.ready_tx.take() else {
            return false;
        };

        debug!("[{}] Voice session ready: endpoint={}", self.room_id, ready.endpoint);
        // The waiter may already have given up
        ready_tx.send(ready).is_ok()
    }
}
