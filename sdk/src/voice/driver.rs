use async_channel::{unbounded, Receiver};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};
use voicegate_protocol::close_code::{self, CloseCategory};
use voicegate_protocol::{
    GatewayMessage, Identify, Ready, Resume, SelectProtocol, SessionDescription, Speaking,
    VoiceCloseCode, VoiceOpcode, VoicePacket,
};

use crate::config::VoiceConfig;
use crate::error::VoiceError;
use crate::network::{ClientEvent, Dialer, SocketFrame, VoiceSocket};
use crate::voice::backoff::Backoff;
use crate::voice::connection::{
    ConnectionCommand, ConnectionShared, ConnectionState, SessionKey, UdpTransport,
};
use crate::voice::heartbeat::{HeartbeatSignal, HeartbeatTimer};
use crate::voice::session::ReadySession;

/// Close code we send when dropping a socket we intend to replace.
const RECONNECT_CLOSE_CODE: u16 = 4000;

const NORMAL_CLOSE_CODE: u16 = 1000;

/// What to do after a socket closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseAction {
    /// Clean shutdown.
    Finish,
    /// Stop and report the close code.
    Fail(u16),
    /// Re-dial with a full identify.
    Reconnect,
    /// Re-dial and resume the session.
    Resume,
}

/// Decide how to react to a socket close. `code` is `None` for drops without a
/// close frame and for heartbeat failures.
pub(crate) fn close_action(
    code: Option<u16>,
    close_requested: bool,
    resumable: bool,
    resuming: bool,
) -> CloseAction {
    if close_requested {
        return CloseAction::Finish;
    }

    if let Some(code) = code {
        if resuming && code == VoiceCloseCode::SessionInvalid.code() {
            return CloseAction::Reconnect;
        }
        match close_code::categorize(code) {
            CloseCategory::Fatal | CloseCategory::Disconnected => return CloseAction::Fail(code),
            CloseCategory::Reconnect => {}
        }
    }

    if resumable {
        CloseAction::Resume
    } else {
        CloseAction::Reconnect
    }
}

/// First preferred mode the server offers. An empty offer accepts our first preference.
pub(crate) fn select_encryption_mode(
    preferred: &[String],
    offered: &[String],
) -> Result<String, VoiceError> {
    let selected = if offered.is_empty() {
        preferred.first()
    } else {
        preferred.iter().find(|mode| offered.contains(mode))
    };

    selected
        .cloned()
        .ok_or_else(|| VoiceError::NoSupportedEncryptionMode {
            offered: offered.to_vec(),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Identify,
    Resume,
}

/// Why a socket stopped being driven.
#[derive(Debug)]
enum SocketExit {
    Closed(Option<u16>),
    HeartbeatMissed,
    ResumeRequested,
    Migrated,
    Finished,
    Fatal(VoiceError),
}

enum BackoffOutcome {
    Elapsed,
    Closed,
    Migrated,
}

/// Socket loop for one voice connection. Owns the heartbeat timer and the
/// reconnect policy; lives until the connection closes.
pub(crate) struct ConnectionDriver {
    session: ReadySession,
    config: Arc<VoiceConfig>,
    dialer: Arc<dyn Dialer>,
    shared: Arc<ConnectionShared>,
    commands: Receiver<ConnectionCommand>,
    events: broadcast::Sender<ClientEvent>,
    heartbeat: HeartbeatTimer,
    heartbeat_rx: Receiver<HeartbeatSignal>,
    backoff: Backoff,
    /// Key and transport from the last completed handshake, re-published
    /// after RESUMED.
    resumable_key: Option<Arc<SessionKey>>,
    resumable_transport: Option<Arc<UdpTransport>>,
    ssrc: Option<u32>,
}

impl ConnectionDriver {
    pub(crate) fn new(
        session: ReadySession,
        config: Arc<VoiceConfig>,
        dialer: Arc<dyn Dialer>,
        shared: Arc<ConnectionShared>,
        commands: Receiver<ConnectionCommand>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let (heartbeat_tx, heartbeat_rx) = unbounded();
        let backoff = Backoff::new(
            config.reconnect_initial_backoff(),
            config.reconnect_max_backoff(),
        );

        Self {
            session,
            config,
            dialer,
            shared,
            commands,
            events,
            heartbeat: HeartbeatTimer::new(heartbeat_tx),
            heartbeat_rx,
            backoff,
            resumable_key: None,
            resumable_transport: None,
            ssrc: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let outcome = self.run_until_closed().await;
        self.finish(outcome);
    }

    async fn run_until_closed(&mut self) -> Result<(), VoiceError> {
        let room_id = self.session.room_id;
        let mut handshake = Handshake::Identify;

        loop {
            if self.shared.close_requested() {
                return Ok(());
            }

            let resuming = handshake == Handshake::Resume;
            self.shared.set_state(if resuming {
                ConnectionState::Resuming
            } else {
                ConnectionState::Connecting
            });

            let url = self.config.gateway_url(&self.session.endpoint);
            let exit = match self.dialer.dial(&url).await {
                Ok(mut socket) => {
                    if !resuming {
                        self.shared.set_state(ConnectionState::AwaitingHello);
                    }
                    let exit = self.drive_socket(socket.as_mut(), handshake).await;
                    self.cleanup();
                    exit
                }
                Err(e) => {
                    warn!("[{}] Voice gateway dial failed: {}", room_id, e);
                    SocketExit::Closed(None)
                }
            };

            let resumable = self.resumable_key.is_some();
            let action = match exit {
                SocketExit::Finished => return Ok(()),
                SocketExit::Fatal(e) => return Err(e),
                SocketExit::Migrated => {
                    self.forget_resumable();
                    self.backoff.reset();
                    handshake = Handshake::Identify;
                    continue;
                }
                SocketExit::ResumeRequested if resumable => {
                    handshake = Handshake::Resume;
                    continue;
                }
                SocketExit::ResumeRequested | SocketExit::HeartbeatMissed => {
                    close_action(None, self.shared.close_requested(), resumable, resuming)
                }
                SocketExit::Closed(code) => {
                    close_action(code, self.shared.close_requested(), resumable, resuming)
                }
            };

            handshake = match action {
                CloseAction::Finish => return Ok(()),
                CloseAction::Fail(code) => return Err(VoiceError::fatal(code)),
                CloseAction::Resume => Handshake::Resume,
                CloseAction::Reconnect => {
                    self.forget_resumable();
                    Handshake::Identify
                }
            };

            if let Some(max) = self.config.max_reconnect_attempts {
                if self.backoff.attempts() >= max {
                    return Err(VoiceError::ReconnectExhausted {
                        room_id,
                        attempts: self.backoff.attempts(),
                    });
                }
            }

            let delay = self.backoff.next_delay();
            info!(
                "[{}] Reconnecting to voice gateway in {:?} ({:?}, attempt {})",
                room_id,
                delay,
                handshake,
                self.backoff.attempts()
            );

            match self.wait_backoff(delay).await {
                BackoffOutcome::Elapsed => {}
                BackoffOutcome::Closed => return Ok(()),
                BackoffOutcome::Migrated => {
                    self.forget_resumable();
                    handshake = Handshake::Identify;
                }
            }
        }
    }

    /// Sleep before a re-dial while still answering commands.
    async fn wait_backoff(&mut self, delay: Duration) -> BackoffOutcome {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => return BackoffOutcome::Elapsed,
                command = self.commands.recv() => match command {
                    Ok(ConnectionCommand::Migrate { token, endpoint }) => {
                        self.session.token = token;
                        self.session.endpoint = endpoint;
                        return BackoffOutcome::Migrated;
                    }
                    Ok(ConnectionCommand::UpdateSession { session_id }) => {
                        self.session.session_id = session_id;
                    }
                    Ok(ConnectionCommand::Speaking(_)) => {
                        debug!("[{}] Dropping speaking update while reconnecting", self.session.room_id);
                    }
                    Ok(ConnectionCommand::Close) | Err(_) => {
                        self.shared.mark_close_requested();
                        return BackoffOutcome::Closed;
                    }
                },
            }
        }
    }

    async fn drive_socket(&mut self, socket: &mut dyn VoiceSocket, handshake: Handshake) -> SocketExit {
        let room_id = self.session.room_id;

        loop {
            tokio::select! {
                frame = socket.next_frame() => match frame {
                    Some(SocketFrame::Text(text)) => {
                        match self.handle_text(socket, &text, handshake).await {
                            Ok(None) => {}
                            Ok(Some(exit)) => return exit,
                            Err(e) => {
                                warn!("[{}] Voice socket send failed: {}", room_id, e);
                                return SocketExit::Closed(None);
                            }
                        }
                    }
                    Some(SocketFrame::Close(code)) => {
                        info!(
                            "[{}] Voice gateway closed: {:?} ({})",
                            room_id,
                            code,
                            code.map_or("no close frame", close_code::describe)
                        );
                        return SocketExit::Closed(code);
                    }
                    None => {
                        info!("[{}] Voice gateway stream ended", room_id);
                        return SocketExit::Closed(None);
                    }
                },
                Ok(signal) = self.heartbeat_rx.recv() => {
                    if !self.heartbeat.is_current(signal.generation()) {
                        trace!("[{}] Dropping stale heartbeat signal {:?}", room_id, signal);
                        continue;
                    }
                    match signal {
                        HeartbeatSignal::Beat { nonce, .. } => {
                            if let Err(e) = send_packet(socket, &VoicePacket::Heartbeat { nonce }).await {
                                warn!("[{}] Heartbeat send failed: {}", room_id, e);
                                return SocketExit::Closed(None);
                            }
                        }
                        HeartbeatSignal::Missed { .. } => {
                            warn!("[{}] Heartbeat not acknowledged, reconnecting", room_id);
                            self.heartbeat.stop();
                            socket.close(RECONNECT_CLOSE_CODE).await;
                            return SocketExit::HeartbeatMissed;
                        }
                    }
                },
                command = self.commands.recv() => match command {
                    Ok(ConnectionCommand::Speaking(flags)) => {
                        if let Err(e) = self.send_speaking(socket, flags).await {
                            warn!("[{}] Speaking send failed: {}", room_id, e);
                            return SocketExit::Closed(None);
                        }
                    }
                    Ok(ConnectionCommand::UpdateSession { session_id }) => {
                        self.session.session_id = session_id;
                    }
                    Ok(ConnectionCommand::Migrate { token, endpoint }) => {
                        self.session.token = token;
                        self.session.endpoint = endpoint;
                        socket.close(RECONNECT_CLOSE_CODE).await;
                        return SocketExit::Migrated;
                    }
                    Ok(ConnectionCommand::Close) | Err(_) => {
                        self.shared.mark_close_requested();
                        return self.close_gracefully(socket).await;
                    }
                },
            }
        }
    }

    async fn handle_text(
        &mut self,
        socket: &mut dyn VoiceSocket,
        text: &str,
        handshake: Handshake,
    ) -> Result<Option<SocketExit>, VoiceError> {
        let room_id = self.session.room_id;

        let message = match GatewayMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("[{}] Ignoring malformed voice frame: {}", room_id, e);
                return Ok(None);
            }
        };

        // The server's resume request may carry no payload
        if message.op == VoiceOpcode::Resume.as_u8() {
            info!("[{}] Voice server requested a resume", room_id);
            self.heartbeat.stop();
            socket.close(RECONNECT_CLOSE_CODE).await;
            return Ok(Some(SocketExit::ResumeRequested));
        }

        let packet = match VoicePacket::from_message(message) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("[{}] Ignoring undecodable voice frame: {}", room_id, e);
                return Ok(None);
            }
        };

        match packet {
            VoicePacket::Hello(hello) => {
                let interval = hello.interval();
                debug!("[{}] HELLO: heartbeat interval {:?}", room_id, interval);
                self.heartbeat.start(interval);
                self.send_handshake(socket, handshake).await?;
            }
            VoicePacket::Ready(ready) => {
                if let Err(e) = self.handle_ready(socket, ready).await {
                    return match e {
                        VoiceError::NoSupportedEncryptionMode { .. } => {
                            socket.close(NORMAL_CLOSE_CODE).await;
                            Ok(Some(SocketExit::Fatal(e)))
                        }
                        other => Err(other),
                    };
                }
            }
            VoicePacket::SessionDescription(description) => {
                self.handle_session_description(description);
            }
            VoicePacket::HeartbeatAck { nonce } => {
                self.heartbeat.acknowledge(nonce);
            }
            VoicePacket::Resumed => {
                self.shared.transport.store(self.resumable_transport.clone());
                self.shared.session_key.store(self.resumable_key.clone());
                self.backoff.reset();
                self.shared.set_state(ConnectionState::Ready);
                info!("[{}] Voice session resumed", room_id);
                self.emit(ClientEvent::VoiceResumed { room_id });
            }
            VoicePacket::Speaking(update) => {
                self.emit(ClientEvent::SpeakingUpdate {
                    room_id,
                    user_id: update.user_id,
                    ssrc: update.ssrc,
                    speaking: update.speaking,
                });
            }
            VoicePacket::ClientDisconnect(disconnect) => {
                debug!("[{}] Client disconnected: {:?}", room_id, disconnect.user_id);
                self.emit(ClientEvent::ClientDisconnected {
                    room_id,
                    user_id: disconnect.user_id,
                });
            }
            other => {
                debug!("[{}] Ignoring unexpected {:?}", room_id, other.opcode());
            }
        }

        Ok(None)
    }

    async fn send_handshake(
        &mut self,
        socket: &mut dyn VoiceSocket,
        handshake: Handshake,
    ) -> Result<(), VoiceError> {
        let session = &self.session;

        match handshake {
            Handshake::Identify => {
                self.shared.set_state(ConnectionState::Identifying);
                let identify = VoicePacket::Identify(Identify {
                    server_id: session.room_id,
                    user_id: session.user_id,
                    session_id: session.session_id.clone(),
                    token: session.token.clone(),
                });
                send_packet(socket, &identify).await?;
                self.shared.set_state(ConnectionState::AwaitingReady);
            }
            Handshake::Resume => {
                let resume = VoicePacket::Resume(Resume {
                    server_id: session.room_id,
                    session_id: session.session_id.clone(),
                    token: session.token.clone(),
                });
                send_packet(socket, &resume).await?;
            }
        }

        Ok(())
    }

    async fn handle_ready(
        &mut self,
        socket: &mut dyn VoiceSocket,
        ready: Ready,
    ) -> Result<(), VoiceError> {
        let room_id = self.session.room_id;
        let mode = select_encryption_mode(&self.config.encryption_modes, &ready.modes)?;

        debug!(
            "[{}] READY: ssrc={}, {}:{}, mode={}",
            room_id, ready.ssrc, ready.ip, ready.port, mode
        );

        self.ssrc = Some(ready.ssrc);
        let transport = Arc::new(UdpTransport {
            ip: ready.ip.clone(),
            port: ready.port,
            ssrc: ready.ssrc,
        });
        self.shared.transport.store(Some(transport.clone()));
        self.resumable_transport = Some(transport);

        self.shared.set_state(ConnectionState::SelectingProtocol);
        let select = VoicePacket::SelectProtocol(SelectProtocol::udp(ready.ip, ready.port, mode));
        send_packet(socket, &select).await?;
        self.shared.set_state(ConnectionState::AwaitingSessionDescription);

        Ok(())
    }

    fn handle_session_description(&mut self, description: SessionDescription) {
        let room_id = self.session.room_id;

        if self.shared.session_key.load().is_some() {
            warn!("[{}] Ignoring repeated SESSION_DESCRIPTION", room_id);
            return;
        }

        let key = Arc::new(SessionKey {
            mode: description.mode,
            secret_key: description.secret_key,
            media_session_id: description.media_session_id,
        });
        self.shared.session_key.store(Some(key.clone()));
        self.resumable_key = Some(key);
        self.backoff.reset();

        self.shared.set_state(ConnectionState::Ready);
        info!("[{}] Voice connection ready", room_id);
        self.emit(ClientEvent::VoiceReady { room_id });
    }

    async fn send_speaking(&self, socket: &mut dyn VoiceSocket, flags: u8) -> Result<(), VoiceError> {
        let Some(ssrc) = self.ssrc else {
            debug!("[{}] No ssrc yet, dropping speaking update", self.session.room_id);
            return Ok(());
        };
        if self.shared.state() != ConnectionState::Ready {
            debug!("[{}] Not ready, dropping speaking update", self.session.room_id);
            return Ok(());
        }

        let packet = VoicePacket::Speaking(Speaking {
            speaking: flags,
            delay: 0,
            ssrc,
            user_id: None,
        });
        send_packet(socket, &packet).await
    }

    /// Wait for the server to close after our leave intent, else close locally.
    async fn close_gracefully(&mut self, socket: &mut dyn VoiceSocket) -> SocketExit {
        let room_id = self.session.room_id;
        self.heartbeat.stop();
        self.shared.set_state(ConnectionState::Closing);

        let server_close = async {
            loop {
                match socket.next_frame().await {
                    Some(SocketFrame::Close(code)) => return code,
                    Some(SocketFrame::Text(_)) => {}
                    None => return None,
                }
            }
        };

        let closed = tokio::time::timeout(self.config.close_timeout(), server_close).await;
        match closed {
            Ok(code) => debug!("[{}] Voice gateway closed: {:?}", room_id, code),
            Err(_) => {
                debug!("[{}] No close from voice gateway, closing locally", room_id);
                socket.close(NORMAL_CLOSE_CODE).await;
            }
        }

        SocketExit::Finished
    }

    /// The next dial must IDENTIFY from scratch.
    fn forget_resumable(&mut self) {
        self.resumable_key = None;
        self.resumable_transport = None;
    }

    /// Runs after every socket exit.
    fn cleanup(&mut self) {
        self.heartbeat.stop();
        self.shared.clear_published();
        while self.heartbeat_rx.try_recv().is_ok() {}
    }

    fn finish(mut self, outcome: Result<(), VoiceError>) {
        let room_id = self.session.room_id;
        self.cleanup();

        match outcome {
            Ok(()) => {
                info!("[{}] Voice connection closed", room_id);
                self.emit(ClientEvent::VoiceDisconnected { room_id });
            }
            Err(e) => {
                error!("[{}] Voice connection failed: {}", room_id, e);
                self.emit(ClientEvent::VoiceConnectionFailed {
                    room_id,
                    error: Arc::new(e),
                });
            }
        }

        self.shared.set_state(ConnectionState::Closed);
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

async fn send_packet(socket: &mut dyn VoiceSocket, packet: &VoicePacket) -> Result<(), VoiceError> {
    trace!("--> {:?}", packet.opcode());
    socket.send_text(packet.encode()?).await
}
