use arc_swap::{ArcSwap, ArcSwapOption};
use async_channel::{unbounded, Sender};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};
use voicegate_protocol::{speaking, RoomId};

use crate::config::VoiceConfig;
use crate::error::VoiceError;
use crate::network::{ClientEvent, Dialer};
use crate::voice::driver::ConnectionDriver;
use crate::voice::session::ReadySession;

/// Lifecycle of one voice connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    AwaitingHello,
    Identifying,
    AwaitingReady,
    SelectingProtocol,
    AwaitingSessionDescription,
    Ready,
    Resuming,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }
}

/// Media transport assigned in READY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpTransport {
    pub ip: String,
    pub port: u16,
    pub ssrc: u32,
}

/// Media encryption material from SESSION_DESCRIPTION.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub mode: String,
    pub secret_key: Vec<u8>,
    pub media_session_id: Option<String>,
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("mode", &self.mode)
            .field("secret_key", &format_args!("<{} bytes>", self.secret_key.len()))
            .field("media_session_id", &self.media_session_id)
            .finish()
    }
}

/// Voice server a connection is pointed at. `sequence` is that of the server
/// fragment that produced it, 0 if the carrier had none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerRoute {
    pub(crate) token: String,
    pub(crate) endpoint: String,
    pub(crate) sequence: u64,
}

impl ServerRoute {
    fn same_server(&self, token: &str, endpoint: &str) -> bool {
        self.token == token && self.endpoint == endpoint
    }
}

#[derive(Debug)]
pub(crate) enum ConnectionCommand {
    Speaking(u8),
    Close,
    Migrate { token: String, endpoint: String },
    UpdateSession { session_id: String },
}

/// State shared between a connection handle and its socket loop.
pub(crate) struct ConnectionShared {
    state: watch::Sender<ConnectionState>,
    close_requested: AtomicBool,
    pub(crate) transport: ArcSwapOption<UdpTransport>,
    pub(crate) session_key: ArcSwapOption<SessionKey>,
}

impl ConnectionShared {
    fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            state,
            close_requested: AtomicBool::new(false),
            transport: ArcSwapOption::empty(),
            session_key: ArcSwapOption::empty(),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Voice connection state: {:?} -> {:?}", previous, state);
        }
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    pub(crate) fn mark_close_requested(&self) {
        self.close_requested.store(true, Ordering::Release);
    }

    /// Drop everything the socket handed out.
    pub(crate) fn clear_published(&self) {
        self.transport.store(None);
        self.session_key.store(None);
    }
}

/// Handle to a running voice connection. Cheap to clone; the socket loop runs on
/// its own task until the connection closes.
#[derive(Clone)]
pub struct VoiceConnection {
    room_id: RoomId,
    shared: Arc<ConnectionShared>,
    route: Arc<ArcSwap<ServerRoute>>,
    session_id: Arc<ArcSwap<String>>,
    commands: Sender<ConnectionCommand>,
}

impl VoiceConnection {
    /// Spawn the socket loop for a complete session.
    pub(crate) fn spawn(
        session: ReadySession,
        config: Arc<VoiceConfig>,
        dialer: Arc<dyn Dialer>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let room_id = session.room_id;
        let shared = Arc::new(ConnectionShared::new());
        let route = Arc::new(ArcSwap::from_pointee(ServerRoute {
            token: session.token.clone(),
            endpoint: session.endpoint.clone(),
            sequence: session.server_sequence,
        }));
        let session_id = Arc::new(ArcSwap::from_pointee(session.session_id.clone()));
        let (commands, command_rx) = unbounded();

        info!("[{}] Starting voice connection to {}", room_id, session.endpoint);

        let driver = ConnectionDriver::new(
            session,
            config,
            dialer,
            shared.clone(),
            command_rx,
            events,
        );
        tokio::spawn(driver.run());

        Self {
            room_id,
            shared,
            route,
            session_id,
            commands,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_close_requested(&self) -> bool {
        self.shared.close_requested()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn endpoint(&self) -> String {
        self.route.load().endpoint.clone()
    }

    /// Current key, or `None` until SESSION_DESCRIPTION. Never partially written.
    pub fn session_key(&self) -> Option<Arc<SessionKey>> {
        self.shared.session_key.load_full()
    }

    pub fn transport(&self) -> Option<Arc<UdpTransport>> {
        self.shared.transport.load_full()
    }

    /// Wait until the connection reaches `Ready`.
    ///
    /// # Errors
    /// `HandshakeTimeout` if it takes longer than `timeout`, `NotReady` if the
    /// connection closed first.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), VoiceError> {
        let mut state_rx = self.watch_state();
        let waited = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|state| {
                matches!(state, ConnectionState::Ready | ConnectionState::Closed)
            }),
        )
        .await;

        match waited {
            Err(_) => Err(VoiceError::HandshakeTimeout {
                room_id: self.room_id,
                timeout,
            }),
            Ok(Err(_)) => Err(VoiceError::NotConnected(self.room_id)),
            Ok(Ok(state)) => {
                let state = *state;
                if state == ConnectionState::Ready {
                    Ok(())
                } else {
                    Err(VoiceError::NotReady {
                        room_id: self.room_id,
                        state,
                    })
                }
            }
        }
    }

    /// # Errors
    /// `NotReady` unless the connection is `Ready`.
    pub async fn start_speaking(&self) -> Result<(), VoiceError> {
        self.set_speaking(speaking::MICROPHONE).await
    }

    /// # Errors
    /// `NotReady` unless the connection is `Ready`.
    pub async fn stop_speaking(&self) -> Result<(), VoiceError> {
        self.set_speaking(speaking::NONE).await
    }

    async fn set_speaking(&self, flags: u8) -> Result<(), VoiceError> {
        let state = self.state();
        if state != ConnectionState::Ready {
            return Err(VoiceError::NotReady {
                room_id: self.room_id,
                state,
            });
        }

        self.commands
            .send(ConnectionCommand::Speaking(flags))
            .await
            .map_err(|_| VoiceError::NotConnected(self.room_id))
    }

    /// Mark the close as ours and tell the loop to shut the socket down.
    pub(crate) fn request_close(&self) {
        self.shared.mark_close_requested();
        if self.commands.try_send(ConnectionCommand::Close).is_err() {
            debug!("[{}] Voice connection loop already stopped", self.room_id);
        }
    }

    /// Point the connection at a new voice server. Returns `false` if the route is
    /// unchanged or the fragment is older than the one the route came from.
    pub(crate) fn migrate(&self, token: String, endpoint: String, sequence: u64) -> bool {
        let current = self.route.load_full();
        if sequence != 0 && sequence < current.sequence {
            debug!(
                "[{}] Ignoring stale server fragment: sequence {} < {}",
                self.room_id, sequence, current.sequence
            );
            return false;
        }
        if current.same_server(&token, &endpoint) {
            return false;
        }

        info!("[{}] Voice server moved to {}", self.room_id, endpoint);
        self.route.store(Arc::new(ServerRoute {
            token: token.clone(),
            endpoint: endpoint.clone(),
            sequence: sequence.max(current.sequence),
        }));

        self.commands
            .try_send(ConnectionCommand::Migrate { token, endpoint })
            .is_ok()
    }

    /// Hand a newer session id to the loop for its next RESUME or IDENTIFY.
    /// Returns `false` if it is unchanged.
    pub(crate) fn update_session(&self, session_id: String) -> bool {
        if **self.session_id.load() == session_id {
            return false;
        }

        debug!("[{}] Voice session id changed", self.room_id);
        self.session_id.store(Arc::new(session_id.clone()));

        self.commands
            .try_send(ConnectionCommand::UpdateSession { session_id })
            .is_ok()
    }
}

impl fmt::Debug for VoiceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceConnection")
            .field("room_id", &self.room_id)
            .field("state", &self.state())
            .field("endpoint", &self.route.load().endpoint)
            .finish_non_exhaustive()
    }
}
