use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, trace, warn};
use voicegate_protocol::{ChannelId, RoomId, UserId, VoiceStateIntent};

use crate::config::VoiceConfig;
use crate::error::VoiceError;
use crate::network::{ClientEvent, Dialer, ParentGateway};
use crate::voice::connection::{ConnectionState, SessionKey, UdpTransport, VoiceConnection};
use crate::voice::session::VoiceSession;

/// Registry of voice sessions and live connections, one per room.
///
/// `connect` and `disconnect` for the same room are serialized; different rooms
/// proceed independently.
pub struct VoiceSessionCoordinator {
    parent: Arc<dyn ParentGateway>,
    dialer: Arc<dyn Dialer>,
    config: Arc<VoiceConfig>,
    sessions: DashMap<RoomId, VoiceSession>,
    connections: DashMap<RoomId, VoiceConnection>,
    room_locks: DashMap<RoomId, Arc<Mutex<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl VoiceSessionCoordinator {
    pub fn new(parent: Arc<dyn ParentGateway>, dialer: Arc<dyn Dialer>, config: VoiceConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));

        Self {
            parent,
            dialer,
            config: Arc::new(config),
            sessions: DashMap::new(),
            connections: DashMap::new(),
            room_locks: DashMap::new(),
            events,
        }
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    /// Subscribe to client events from this point forward.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<ClientEvent> {
        self.events.clone()
    }

    /// Join `channel_id` in `room_id` and start the voice connection.
    ///
    /// Returns once the connection loop is scheduled; use
    /// [`wait_until_ready`](Self::wait_until_ready) to wait for the handshake.
    ///
    /// # Errors
    /// `AlreadyConnected` if the room has a live connection, `HandshakeTimeout` if
    /// the parent does not deliver both fragments in time, or the parent's send error.
    pub async fn connect(
        &self,
        room_id: RoomId,
        channel_id: ChannelId,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), VoiceError> {
        let lock = self.room_lock(room_id);
        let _guard = lock.lock().await;

        self.prune_closed();
        if self.connections.contains_key(&room_id) {
            return Err(VoiceError::AlreadyConnected(room_id));
        }

        let (session, ready_rx) = VoiceSession::new(room_id);
        self.sessions.insert(room_id, session);

        info!("[{}] Joining voice channel {}", room_id, channel_id);
        let intent = VoiceStateIntent::join(room_id, channel_id, self_mute, self_deaf);
        if let Err(e) = self.parent.send_state_intent(intent).await {
            self.sessions.remove(&room_id);
            return Err(e);
        }

        let timeout = self.config.handshake_timeout();
        let waited = tokio::time::timeout(timeout, ready_rx).await;
        self.sessions.remove(&room_id);

        let ready = match waited {
            Ok(Ok(ready)) => ready,
            Ok(Err(_)) => return Err(VoiceError::SessionAbandoned(room_id)),
            Err(_) => {
                warn!("[{}] Voice handshake fragments not received within {:?}", room_id, timeout);
                return Err(VoiceError::HandshakeTimeout { room_id, timeout });
            }
        };

        let connection = VoiceConnection::spawn(
            ready,
            self.config.clone(),
            self.dialer.clone(),
            self.events.clone(),
        );
        self.connections.insert(room_id, connection);

        Ok(())
    }

    /// Leave voice in `room_id`. The socket closes in the background.
    ///
    /// # Errors
    /// `NotConnected` if the room has no connection, or the parent's send error.
    pub async fn disconnect(&self, room_id: RoomId) -> Result<(), VoiceError> {
        let lock = self.room_lock(room_id);
        let _guard = lock.lock().await;

        let Some((_, connection)) = self.connections.remove(&room_id) else {
            return Err(VoiceError::NotConnected(room_id));
        };

        info!("[{}] Leaving voice", room_id);
        connection.request_close();

        self.parent
            .send_state_intent(VoiceStateIntent::leave(room_id))
            .await
    }

    /// Disconnect every room. Failures are logged.
    pub async fn disconnect_all(&self) {
        for room_id in self.rooms() {
            if let Err(e) = self.disconnect(room_id).await {
                error!("[{}] Voice disconnect failed: {}", room_id, e);
            }
        }
    }

    /// First handshake fragment: the session id from our own voice state.
    ///
    /// For a live connection a changed session id is used by its next RESUME.
    pub fn on_state_fragment(&self, room_id: RoomId, session_id: String, user_id: UserId) {
        if let Some(mut session) = self.sessions.get_mut(&room_id) {
            session.apply_state(session_id, user_id);
            return;
        }

        let connection = self.connections.get(&room_id).map(|entry| entry.clone());
        match connection {
            Some(connection) if !connection.is_closed() && !connection.is_close_requested() => {
                connection.update_session(session_id);
            }
            _ => trace!("[{}] No voice session for state fragment", room_id),
        }
    }

    /// Second handshake fragment: the voice server assignment.
    ///
    /// For a live connection a changed token or endpoint moves the connection to
    /// the new server. A `None` endpoint means the server is still being allocated.
    pub fn on_server_fragment(
        &self,
        room_id: RoomId,
        token: String,
        endpoint: Option<String>,
        sequence: u64,
    ) {
        let Some(endpoint) = endpoint else {
            debug!("[{}] Voice server not allocated yet, waiting", room_id);
            return;
        };

        if let Some(mut session) = self.sessions.get_mut(&room_id) {
            session.apply_server(token, endpoint, sequence);
            return;
        }

        let connection = self.connections.get(&room_id).map(|entry| entry.clone());
        match connection {
            Some(connection) if !connection.is_closed() && !connection.is_close_requested() => {
                connection.migrate(token, endpoint, sequence);
            }
            _ => trace!("[{}] No voice session for server fragment", room_id),
        }
    }

    /// # Errors
    /// `NotConnected` if the room has no connection, `NotReady` unless it is `Ready`.
    pub async fn start_speaking(&self, room_id: RoomId) -> Result<(), VoiceError> {
        self.connection(room_id)?.start_speaking().await
    }

    /// # Errors
    /// `NotConnected` if the room has no connection, `NotReady` unless it is `Ready`.
    pub async fn stop_speaking(&self, room_id: RoomId) -> Result<(), VoiceError> {
        self.connection(room_id)?.stop_speaking().await
    }

    /// # Errors
    /// `NotConnected` if the room has no connection; see [`VoiceConnection::wait_ready`].
    pub async fn wait_until_ready(&self, room_id: RoomId, timeout: Duration) -> Result<(), VoiceError> {
        self.connection(room_id)?.wait_ready(timeout).await
    }

    pub fn connection_state(&self, room_id: RoomId) -> Option<ConnectionState> {
        self.connections.get(&room_id).map(|entry| entry.state())
    }

    pub fn watch_state(&self, room_id: RoomId) -> Option<watch::Receiver<ConnectionState>> {
        self.connections.get(&room_id).map(|entry| entry.watch_state())
    }

    pub fn session_key(&self, room_id: RoomId) -> Option<Arc<SessionKey>> {
        self.connections.get(&room_id).and_then(|entry| entry.session_key())
    }

    pub fn transport(&self, room_id: RoomId) -> Option<Arc<UdpTransport>> {
        self.connections.get(&room_id).and_then(|entry| entry.transport())
    }

    /// Whether the room has a connection that has not closed.
    pub fn is_connected(&self, room_id: RoomId) -> bool {
        self.connections
            .get(&room_id)
            .is_some_and(|entry| !entry.is_closed())
    }

    pub fn is_pending(&self, room_id: RoomId) -> bool {
        self.sessions.contains_key(&room_id)
    }

    pub fn rooms(&self) -> Vec<RoomId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    fn connection(&self, room_id: RoomId) -> Result<VoiceConnection, VoiceError> {
        self.connections
            .get(&room_id)
            .map(|entry| entry.clone())
            .ok_or(VoiceError::NotConnected(room_id))
    }

    fn room_lock(&self, room_id: RoomId) -> Arc<Mutex<()>> {
        self.room_locks.entry(room_id).or_default().clone()
    }

    fn prune_closed(&self) {
        self.connections.retain(|room_id, connection| {
            let live = !connection.is_closed();
            if !live {
                debug!("[{}] Pruning closed voice connection", room_id);
            }
            live
        });
    }
}
