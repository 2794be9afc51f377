use async_channel::Sender;
use async_trait::async_trait;
use tracing::debug;
use voicegate_protocol::VoiceStateIntent;

use crate::error::VoiceError;

/// The parent event-gateway connection, seen only as a way to send voice state intents.
#[async_trait]
pub trait ParentGateway: Send + Sync {
    /// Send a voice state intent frame on the parent socket.
    async fn send_state_intent(&self, intent: VoiceStateIntent) -> Result<(), VoiceError>;
}

/// Adapter that encodes intents and queues the text frames for a parent socket
/// writer task to drain.
#[derive(Clone)]
pub struct FrameQueueGateway {
    send_tx: Sender<String>,
}

impl FrameQueueGateway {
    pub fn new(send_tx: Sender<String>) -> Self {
        Self { send_tx }
    }
}

#[async_trait]
impl ParentGateway for FrameQueueGateway {
    async fn send_state_intent(&self, intent: VoiceStateIntent) -> Result<(), VoiceError> {
        let frame = intent.encode()?;

        debug!(
            "Queueing voice state intent: room={}, channel={:?}",
            intent.room_id, intent.channel_id
        );

        self.send_tx
            .send(frame)
            .await
            .map_err(|_| VoiceError::Gateway("Parent socket writer closed".to_string()))
    }
}
