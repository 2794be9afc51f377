use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use voicegate_protocol::{ChannelId, ParentEvent, RoomId, UserId, VoiceState};

use crate::config::VoiceConfig;
use crate::error::VoiceError;
use crate::network::{ClientEvent, Dialer, EventBridge, ParentGateway, WsDialer};
use crate::voice::{
    ConnectionState, SessionKey, UdpTransport, VoiceSessionCoordinator, VoiceStateHistory,
    VoiceStateStore,
};

/// Voice client for a bot already connected to the parent gateway.
///
/// Built from the capabilities it needs: a way to send voice state intents on the
/// parent socket, a dialer for voice sockets, and a voice state cache.
pub struct VoiceClient {
    coordinator: Arc<VoiceSessionCoordinator>,
    bridge: EventBridge,
    store: Arc<dyn VoiceStateStore>,
}

impl VoiceClient {
    pub fn new(
        parent: Arc<dyn ParentGateway>,
        dialer: Arc<dyn Dialer>,
        store: Arc<dyn VoiceStateStore>,
        self_user_id: UserId,
        config: VoiceConfig,
    ) -> Self {
        let coordinator = Arc::new(VoiceSessionCoordinator::new(parent, dialer, config));
        let bridge = EventBridge::new(&coordinator, self_user_id, store.clone());

        Self {
            coordinator,
            bridge,
            store,
        }
    }

    /// Client with the websocket dialer and a bounded in-memory state history.
    pub fn with_defaults(parent: Arc<dyn ParentGateway>, self_user_id: UserId, config: VoiceConfig) -> Self {
        let store = Arc::new(VoiceStateHistory::new(config.state_history_len));
        Self::new(parent, Arc::new(WsDialer::new()), store, self_user_id, config)
    }

    /// Subscribe to client events from this point forward
    pub fn event_stream(&self) -> broadcast::Receiver<ClientEvent> {
        self.coordinator.subscribe()
    }

    pub fn coordinator(&self) -> &Arc<VoiceSessionCoordinator> {
        &self.coordinator
    }

    /// Feed a decoded parent dispatch. Returns the event if it is not a voice event.
    pub fn handle_parent_event(&self, event: ParentEvent) -> Option<ParentEvent> {
        self.bridge.intercept(event)
    }

    /// Feed any raw parent frame. Everything but the two voice events is returned.
    ///
    /// # Errors
    /// Returns error if the frame is not JSON, a dispatch has no event name, or a
    /// voice payload is malformed.
    pub fn handle_parent_frame(&self, text: &str) -> Result<Option<ParentEvent>, VoiceError> {
        self.bridge.decode_and_intercept(text)
    }

    pub async fn connect(
        &self,
        room_id: RoomId,
        channel_id: ChannelId,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), VoiceError> {
        self.coordinator
            .connect(room_id, channel_id, self_mute, self_deaf)
            .await
    }

    pub async fn disconnect(&self, room_id: RoomId) -> Result<(), VoiceError> {
        self.coordinator.disconnect(room_id).await
    }

    pub async fn disconnect_all(&self) {
        self.coordinator.disconnect_all().await;
    }

    pub async fn start_speaking(&self, room_id: RoomId) -> Result<(), VoiceError> {
        self.coordinator.start_speaking(room_id).await
    }

    pub async fn stop_speaking(&self, room_id: RoomId) -> Result<(), VoiceError> {
        self.coordinator.stop_speaking(room_id).await
    }

    pub async fn wait_until_ready(&self, room_id: RoomId, timeout: Duration) -> Result<(), VoiceError> {
        self.coordinator.wait_until_ready(room_id, timeout).await
    }

    pub fn connection_state(&self, room_id: RoomId) -> Option<ConnectionState> {
        self.coordinator.connection_state(room_id)
    }

    pub fn watch_state(&self, room_id: RoomId) -> Option<watch::Receiver<ConnectionState>> {
        self.coordinator.watch_state(room_id)
    }

    pub fn session_key(&self, room_id: RoomId) -> Option<Arc<SessionKey>> {
        self.coordinator.session_key(room_id)
    }

    pub fn transport(&self, room_id: RoomId) -> Option<Arc<UdpTransport>> {
        self.coordinator.transport(room_id)
    }

    pub fn is_connected(&self, room_id: RoomId) -> bool {
        self.coordinator.is_connected(room_id)
    }

    /// Latest known voice state for a user.
    pub fn voice_state(&self, user_id: UserId) -> Option<VoiceState> {
        self.store.latest(user_id)
    }

    pub fn voice_state_history(&self, user_id: UserId) -> Vec<VoiceState> {
        self.store.history(user_id)
    }
}
