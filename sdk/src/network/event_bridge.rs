use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, trace};
use voicegate_protocol::{
    GatewayMessage, ParentEvent, RoomId, UserId, VoiceServerUpdate, VoiceState,
};

use crate::error::VoiceError;
use crate::voice::{VoiceSessionCoordinator, VoiceStateStore};

/// Events emitted to SDK subscribers
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Any user's voice state changed; `before` is the previous known state
    VoiceStateChanged {
        state: VoiceState,
        before: Option<VoiceState>,
    },
    /// A voice server was assigned for a room
    VoiceServerAssigned(VoiceServerUpdate),
    /// The connection completed its handshake and holds a session key
    VoiceReady { room_id: RoomId },
    /// The connection resumed its session on a new socket
    VoiceResumed { room_id: RoomId },
    /// The connection closed at our request
    VoiceDisconnected { room_id: RoomId },
    /// The connection stopped because of an unrecoverable error
    VoiceConnectionFailed {
        room_id: RoomId,
        error: Arc<VoiceError>,
    },
    /// Another user's speaking state in a connected room
    SpeakingUpdate {
        room_id: RoomId,
        user_id: Option<UserId>,
        ssrc: u32,
        speaking: u8,
    },
    /// Another user left the voice connection
    ClientDisconnected {
        room_id: RoomId,
        user_id: Option<UserId>,
    },
}

/// Routes the two voice dispatch events from the parent gateway: handshake
/// fragments go to the coordinator, presence goes to the state store and to
/// subscribers. Everything else is handed back untouched.
pub struct EventBridge {
    coordinator: Weak<VoiceSessionCoordinator>,
    self_user_id: UserId,
    store: Arc<dyn VoiceStateStore>,
    events: broadcast::Sender<ClientEvent>,
}

impl EventBridge {
    pub fn new(
        coordinator: &Arc<VoiceSessionCoordinator>,
        self_user_id: UserId,
        store: Arc<dyn VoiceStateStore>,
    ) -> Self {
        Self {
            coordinator: Arc::downgrade(coordinator),
            self_user_id,
            store,
            events: coordinator.event_sender(),
        }
    }

    /// Bridge that only tracks presence and never drives connections.
    pub fn passive(
        self_user_id: UserId,
        store: Arc<dyn VoiceStateStore>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            coordinator: Weak::new(),
            self_user_id,
            store,
            events,
        }
    }

    pub fn self_user_id(&self) -> UserId {
        self.self_user_id
    }

    /// Consume the voice events; return `Some` for everything else.
    pub fn intercept(&self, event: ParentEvent) -> Option<ParentEvent> {
        match event {
            ParentEvent::VoiceStateUpdate(state) => {
                self.handle_voice_state(state);
                None
            }
            ParentEvent::VoiceServerUpdate(update) => {
                self.handle_voice_server(update);
                None
            }
            other => Some(other),
        }
    }

    /// Decode any raw parent frame and intercept it. Non-dispatch frames come
    /// back as `ParentEvent::Control`.
    ///
    /// # Errors
    /// Returns error if the frame is not JSON, a dispatch has no event name, or a
    /// voice payload is malformed.
    pub fn decode_and_intercept(&self, text: &str) -> Result<Option<ParentEvent>, VoiceError> {
        let event = ParentEvent::from_message(GatewayMessage::parse(text)?)?;
        Ok(self.intercept(event))
    }

    fn handle_voice_state(&self, state: VoiceState) {
        let before = self.store.record(state.clone());

        if state.user_id == self.self_user_id {
            match (state.room_id, self.coordinator.upgrade()) {
                (Some(room_id), Some(coordinator)) if state.joined() => {
                    coordinator.on_state_fragment(room_id, state.session_id.clone(), state.user_id);
                }
                (Some(room_id), _) => trace!("[{}] Own voice state not forwarded", room_id),
                (None, _) => {}
            }
        }

        debug!(
            "Voice state: user={}, channel={:?}",
            state.user_id, state.channel_id
        );
        self.emit(ClientEvent::VoiceStateChanged { state, before });
    }

    fn handle_voice_server(&self, update: VoiceServerUpdate) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.on_server_fragment(
                update.room_id,
                update.token.clone(),
                update.endpoint.clone(),
                update.sequence,
            );
        }

        debug!(
            "[{}] Voice server assigned: {:?}",
            update.room_id, update.endpoint
        );
        self.emit(ClientEvent::VoiceServerAssigned(update));
    }

    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            trace!("No client event subscribers");
        }
    }
}
