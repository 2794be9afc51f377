use async_channel::{unbounded, Receiver, Sender};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing_subscriber::EnvFilter;
use voicegate_sdk::protocol::{
    ChannelId, Identify, ParentEvent, RoomId, UserId, VoicePacket, VoiceStateIntent,
};
use voicegate_sdk::{
    ClientEvent, ConnectionState, Dialer, ParentGateway, SocketFrame, VoiceClient, VoiceConfig,
    VoiceError, VoiceSocket, VoiceStateHistory,
};

const ROOM: RoomId = RoomId(1);
const CHANNEL: ChannelId = ChannelId(5);
const SELF_USER: UserId = UserId(2);
const WAIT: Duration = Duration::from_secs(5);

/// What the client wrote to the fake voice server
#[derive(Debug)]
enum ClientFrame {
    Text(String),
    Close(u16),
}

/// Server side of one in-memory voice socket
struct ServerEnd {
    url: String,
    rx: Receiver<ClientFrame>,
    tx: Sender<SocketFrame>,
}

impl ServerEnd {
    async fn send(&self, frame: Value) {
        let _ = self.tx.send(SocketFrame::Text(frame.to_string())).await;
    }

    async fn close(&self, code: u16) {
        let _ = self.tx.send(SocketFrame::Close(Some(code))).await;
    }

    async fn recv(&self) -> ClientFrame {
        tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client socket dropped")
    }

    /// Next non-heartbeat packet from the client.
    async fn expect_packet(&self) -> VoicePacket {
        loop {
            match self.recv().await {
                ClientFrame::Text(text) => {
                    let packet = VoicePacket::decode(&text).expect("client sent undecodable frame");
                    if !matches!(packet, VoicePacket::Heartbeat { .. }) {
                        return packet;
                    }
                }
                ClientFrame::Close(code) => panic!("unexpected close {code}"),
            }
        }
    }

    async fn expect_close(&self) -> u16 {
        loop {
            if let ClientFrame::Close(code) = self.recv().await {
                return code;
            }
        }
    }

    async fn hello(&self, interval_ms: f64) {
        self.send(json!({"op": 8, "d": {"heartbeat_interval": interval_ms}})).await;
    }

    /// HELLO through SESSION_DESCRIPTION. Returns the IDENTIFY the client sent.
    async fn handshake(&self, interval_ms: f64) -> Identify {
        self.hello(interval_ms).await;
        let VoicePacket::Identify(identify) = self.expect_packet().await else {
            panic!("expected IDENTIFY");
        };

        self.send(json!({
            "op": 2,
            "d": {"ssrc": 77, "ip": "10.0.0.1", "port": 50000, "modes": ["xsalsa20_poly1305"]}
        }))
        .await;
        let VoicePacket::SelectProtocol(select) = self.expect_packet().await else {
            panic!("expected SELECT_PROTOCOL");
        };
        assert_eq!(select.protocol, "udp");
        assert_eq!(select.data.address, "10.0.0.1");
        assert_eq!(select.data.mode, "xsalsa20_poly1305");

        self.send(json!({"op": 4, "d": {"mode": "xsalsa20_poly1305", "secret_key": [1, 2, 3]}}))
            .await;

        identify
    }
}

struct MockSocket {
    to_server: Sender<ClientFrame>,
    from_server: Receiver<SocketFrame>,
}

#[async_trait]
impl VoiceSocket for MockSocket {
    async fn send_text(&mut self, text: String) -> Result<(), VoiceError> {
        self.to_server
            .send(ClientFrame::Text(text))
            .await
            .map_err(|_| VoiceError::Transport("server end dropped".to_string()))
    }

    async fn next_frame(&mut self) -> Option<SocketFrame> {
        self.from_server.recv().await.ok()
    }

    async fn close(&mut self, code: u16) {
        let _ = self.to_server.send(ClientFrame::Close(code)).await;
    }
}

/// Hands the server end of every dialed socket to the test
struct MockDialer {
    dialed: Mutex<Vec<String>>,
    servers: Sender<ServerEnd>,
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, url: &str) -> Result<Box<dyn VoiceSocket>, VoiceError> {
        self.dialed.lock().unwrap().push(url.to_string());

        let (to_server, rx) = unbounded();
        let (tx, from_server) = unbounded();
        self.servers
            .send(ServerEnd {
                url: url.to_string(),
                rx,
                tx,
            })
            .await
            .map_err(|_| VoiceError::Transport("test finished".to_string()))?;

        Ok(Box::new(MockSocket {
            to_server,
            from_server,
        }))
    }
}

struct MockParent {
    intents: Sender<VoiceStateIntent>,
}

#[async_trait]
impl ParentGateway for MockParent {
    async fn send_state_intent(&self, intent: VoiceStateIntent) -> Result<(), VoiceError> {
        self.intents
            .send(intent)
            .await
            .map_err(|_| VoiceError::Gateway("parent closed".to_string()))
    }
}

struct Harness {
    client: VoiceClient,
    dialer: Arc<MockDialer>,
    servers: Receiver<ServerEnd>,
    intents: Receiver<VoiceStateIntent>,
}

impl Harness {
    fn new(config: VoiceConfig) -> Self {
        init_tracing();

        let (servers_tx, servers) = unbounded();
        let (intents_tx, intents) = unbounded();
        let dialer = Arc::new(MockDialer {
            dialed: Mutex::new(Vec::new()),
            servers: servers_tx,
        });
        let parent = Arc::new(MockParent { intents: intents_tx });

        let client = VoiceClient::new(
            parent,
            dialer.clone(),
            Arc::new(VoiceStateHistory::default()),
            SELF_USER,
            config,
        );

        Self {
            client,
            dialer,
            servers,
            intents,
        }
    }

    fn state_fragment(&self, session_id: &str) {
        self.state_fragment_in(ROOM, session_id);
    }

    fn state_fragment_in(&self, room_id: RoomId, session_id: &str) {
        let frame = json!({
            "op": 0, "t": "VOICE_STATE_UPDATE", "s": 1,
            "d": {
                "guild_id": room_id.0.to_string(), "channel_id": "5", "user_id": "2",
                "session_id": session_id
            }
        });
        assert!(self.client.handle_parent_frame(&frame.to_string()).unwrap().is_none());
    }

    fn server_fragment(&self, token: &str, endpoint: Option<&str>, sequence: u64) {
        self.server_fragment_in(ROOM, token, endpoint, sequence);
    }

    fn server_fragment_in(&self, room_id: RoomId, token: &str, endpoint: Option<&str>, sequence: u64) {
        let frame = json!({
            "op": 0, "t": "VOICE_SERVER_UPDATE", "s": sequence,
            "d": {"guild_id": room_id.0.to_string(), "token": token, "endpoint": endpoint}
        });
        assert!(self.client.handle_parent_frame(&frame.to_string()).unwrap().is_none());
    }

    /// Connect while the parent delivers both fragments.
    async fn connect(&self) -> VoiceStateIntent {
        self.connect_to(ROOM, "e.example", 1).await
    }

    async fn connect_to(&self, room_id: RoomId, endpoint: &str, sequence: u64) -> VoiceStateIntent {
        let (result, intent) = tokio::join!(
            self.client.connect(room_id, CHANNEL, true, false),
            async {
                let intent = self.intents.recv().await.unwrap();
                self.state_fragment_in(room_id, "sess");
                self.server_fragment_in(room_id, "tok", Some(endpoint), sequence);
                intent
            }
        );
        result.expect("connect failed");
        intent
    }

    async fn next_server(&self) -> ServerEnd {
        tokio::time::timeout(WAIT, self.servers.recv())
            .await
            .expect("timed out waiting for dial")
            .unwrap()
    }

    fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.client.watch_state(ROOM).expect("no connection")
    }

    fn dialed(&self) -> Vec<String> {
        self.dialer.dialed.lock().unwrap().clone()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_reconnect() -> VoiceConfig {
    VoiceConfig {
        reconnect_initial_backoff_ms: 10,
        reconnect_max_backoff_ms: 20,
        ..VoiceConfig::default()
    }
}

async fn wait_state(state_rx: &mut watch::Receiver<ConnectionState>, state: ConnectionState) {
    tokio::time::timeout(WAIT, state_rx.wait_for(|current| *current == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state:?}"))
        .unwrap_or_else(|_| panic!("connection dropped before {state:?}"));
}

async fn wait_event(
    events: &mut broadcast::Receiver<ClientEvent>,
    matches: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn drain_failures(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<Arc<VoiceError>> {
    let mut failures = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::VoiceConnectionFailed { error, .. } = event {
            failures.push(error);
        }
    }
    failures
}

async fn expect_failure(events: &mut broadcast::Receiver<ClientEvent>) -> Arc<VoiceError> {
    match wait_event(events, |e| matches!(e, ClientEvent::VoiceConnectionFailed { .. })).await {
        ClientEvent::VoiceConnectionFailed { error, .. } => error,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_connect_sends_intent_and_dials_versioned_endpoint() {
    let h = Harness::new(VoiceConfig::default());

    let intent = h.connect().await;
    assert_eq!(intent.room_id, ROOM);
    assert_eq!(intent.channel_id, Some(CHANNEL));
    assert!(intent.self_mute);
    assert!(!intent.self_deaf);

    let server = h.next_server().await;
    assert_eq!(server.url, "wss://e.example?v=4");
    assert!(h.client.is_connected(ROOM));
    assert!(matches!(
        h.client.connection_state(ROOM),
        Some(ConnectionState::Idle | ConnectionState::Connecting | ConnectionState::AwaitingHello)
    ));
}

#[tokio::test]
async fn test_handshake_reaches_ready_with_key_and_transport() {
    let h = Harness::new(VoiceConfig::default());
    let mut events = h.client.event_stream();
    h.connect().await;
    let server = h.next_server().await;

    let identify = server.handshake(60_000.0).await;
    assert_eq!(identify.server_id, ROOM);
    assert_eq!(identify.user_id, SELF_USER);
    assert_eq!(identify.session_id, "sess");
    assert_eq!(identify.token, "tok");

    h.client.wait_until_ready(ROOM, WAIT).await.unwrap();
    wait_event(&mut events, |e| matches!(e, ClientEvent::VoiceReady { room_id } if *room_id == ROOM)).await;

    let key = h.client.session_key(ROOM).unwrap();
    assert_eq!(key.secret_key, vec![1, 2, 3]);
    assert_eq!(key.mode, "xsalsa20_poly1305");
    let transport = h.client.transport(ROOM).unwrap();
    assert_eq!((transport.ip.as_str(), transport.port, transport.ssrc), ("10.0.0.1", 50000, 77));
}

#[tokio::test]
async fn test_disconnect_while_ready_closes_cleanly() {
    let h = Harness::new(VoiceConfig::default());
    let mut events = h.client.event_stream();
    h.connect().await;
    let server = h.next_server().await;
    server.handshake(60_000.0).await;
    h.client.wait_until_ready(ROOM, WAIT).await.unwrap();
    let mut state_rx = h.watch();

    h.client.disconnect(ROOM).await.unwrap();

    let leave = h.intents.recv().await.unwrap();
    assert_eq!(leave.room_id, ROOM);
    assert_eq!(leave.channel_id, None);
    assert!(!h.client.is_connected(ROOM));
    assert!(h.client.connection_state(ROOM).is_none());

    // Server removes us after the leave intent
    server.close(4014).await;
    wait_state(&mut state_rx, ConnectionState::Closed).await;

    wait_event(&mut events, |e| matches!(e, ClientEvent::VoiceDisconnected { .. })).await;
    assert!(drain_failures(&mut events).is_empty());
}

#[tokio::test]
async fn test_disconnect_unknown_room_is_not_connected() {
    let h = Harness::new(VoiceConfig::default());
    let err = h.client.disconnect(RoomId(99)).await.unwrap_err();
    assert!(matches!(err, VoiceError::NotConnected(RoomId(99))));
}

#[tokio::test]
async fn test_second_connect_is_already_connected() {
    let h = Harness::new(VoiceConfig::default());
    h.connect().await;
    let _server = h.next_server().await;

    let err = h.client.connect(ROOM, CHANNEL, false, false).await.unwrap_err();
    assert!(matches!(err, VoiceError::AlreadyConnected(room) if room == ROOM));
    assert!(h.intents.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_heartbeat_ack_reconnects_transparently() {
    let h = Harness::new(VoiceConfig::default());
    let mut events = h.client.event_stream();
    h.connect().await;
    let server = h.next_server().await;
    let mut state_rx = h.watch();

    server.hello(100.0).await;
    assert!(matches!(server.expect_packet().await, VoicePacket::Identify(_)));

    // No ack for the first beat
    assert_eq!(server.expect_close().await, 4000);

    let second = h.next_server().await;
    assert_eq!(second.url, "wss://e.example?v=4");
    second.hello(60_000.0).await;
    assert!(matches!(second.expect_packet().await, VoicePacket::Identify(_)));

    wait_state(&mut state_rx, ConnectionState::AwaitingReady).await;
    assert!(drain_failures(&mut events).is_empty());
    assert_eq!(h.dialed().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_missing_heartbeat_ack_after_ready_resumes() {
    let h = Harness::new(VoiceConfig::default());
    let mut events = h.client.event_stream();
    h.connect().await;
    let server = h.next_server().await;
    server.handshake(100.0).await;
    h.client.wait_until_ready(ROOM, WAIT).await.unwrap();

    assert_eq!(server.expect_close().await, 4000);

    let second = h.next_server().await;
    second.hello(60_000.0).await;
    let VoicePacket::Resume(resume) = second.expect_packet().await else {
        panic!("expected RESUME");
    };
    assert_eq!(resume.session_id, "sess");
    assert_eq!(resume.token, "tok");
    assert_eq!(h.client.connection_state(ROOM), Some(ConnectionState::Resuming));

    second.send(json!({"op": 9, "d": null})).await;
    h.client.wait_until_ready(ROOM, WAIT).await.unwrap();
    wait_event(&mut events, |e| matches!(e, ClientEvent::VoiceResumed { .. })).await;
    assert_eq!(h.client.session_key(ROOM).unwrap().secret_key, vec![1, 2, 3]);
    assert!(h.client.transport(ROOM).is_some());
    assert_eq!(h.client.transport(ROOM).unwrap().ssrc, 77);
    assert!(drain_failures(&mut events).is_empty());
}

#[tokio::test]
async fn test_server_resume_request_redials_and_resumes() {
    let h = Harness::new(VoiceConfig::default());
    h.connect().await;
    let server = h.next_server().await;
    server.handshake(60_000.0).await;
    h.client.wait_until_ready(ROOM, WAIT).await.unwrap();

    server.send(json!({"op": 7})).await;
    assert_eq!(server.expect_close().await, 4000);

    let second = h.next_server().await;
    second.hello(60_000.0).await;
    assert!(matches!(second.expect_packet().await, VoicePacket::Resume(_)));

    second.send(json!({"op": 9, "d": null})).await;
    h.client.wait_until_ready(ROOM, WAIT).await.unwrap();
    let transport = h.client.transport(ROOM).unwrap();
    assert_eq!((transport.ip.as_str(), transport.port), ("10.0.0.1", 50000));
    assert!(h.client.session_key(ROOM).is_some());
}

#[tokio::test]
async fn test_resume_uses_session_id_from_latest_state() {
    let h = Harness::new(VoiceConfig::default());
    h.connect().await;
    let server = h.next_server().await;
    server.handshake(60_000.0).await;
    h.client.wait_until_ready(ROOM, WAIT).await.unwrap();

    // Parent reissued our voice state while the connection was live
    h.state_fragment("sess2");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.client.connection_state(ROOM), Some(ConnectionState::Ready));

    server.send(json!({"op": 7})).await;
    assert_eq!(server.expect_close().await, 4000);

    let second = h.next_server().await;
    second.hello(60_000.0).await;
    let VoicePacket::Resume(resume) = second.expect_packet().await else {
        panic!("expected RESUME");
    };
    assert_eq!(resume.session_id, "sess2");
    assert_eq!(resume.token, "tok");
}

#[tokio::test]
async fn test_invalid_session_during_resume_falls_back_to_identify() {
    let h = Harness::new(fast_reconnect());
    let mut events = h.client.event_stream();
    h.connect().await;
    let server = h.next_server().await;
    server.handshake(60_000.0).await;
    h.client.wait_until_ready(ROOM, WAIT).await.unwrap();

    server.close(4015).await;
    let second = h.next_server().await;
    second.hello(60_000.0).await;
    assert!(matches!(second.expect_packet().await, VoicePacket::Resume(_)));

    second.close(4006).await;
    let third = h.next_server().await;
    third.hello(60_000.0).await;
    assert!(matches!(third.expect_packet().await, VoicePacket::Identify(_)));
    assert!(drain_failures(&mut events).is_empty());
}

#[tokio::test]
async fn test_transient_close_before_ready_reconnects_with_identify() {
    let h = Harness::new(fast_reconnect());
    h.connect().await;
    let server = h.next_server().await;
    server.hello(60_000.0).await;
    assert!(matches!(server.expect_packet().await, VoicePacket::Identify(_)));

    server.close(4015).await;
    let second = h.next_server().await;
    second.hello(60_000.0).await;
    assert!(matches!(second.expect_packet().await, VoicePacket::Identify(_)));
}

#[tokio::test]
async fn test_fatal_close_code_fails_connection() {
    let h = Harness::new(VoiceConfig::default());
    let mut events = h.client.event_stream();
    h.connect().await;
    let server = h.next_server().await;
    let mut state_rx = h.watch();
    server.hello(60_000.0).await;
    server.expect_packet().await;

    server.close(4004).await;

    let error = expect_failure(&mut events).await;
    assert_eq!(error.close_code(), Some(4004));
    assert!(error.to_string().contains("Authentication failed"));
    wait_state(&mut state_rx, ConnectionState::Closed).await;
    assert!(!h.client.is_connected(ROOM));
    assert_eq!(h.dialed().len(), 1);
}

#[tokio::test]
async fn test_removed_from_channel_without_request_is_fatal() {
    let h = Harness::new(VoiceConfig::default());
    let mut events = h.client.event_stream();
    h.connect().await;
    let server = h.next_server().await;
    server.handshake(60_000.0).await;
    h.client.wait_until_ready(ROOM, WAIT).await.unwrap();

    server.close(4014).await;

    let error = expect_failure(&mut events).await;
    assert_eq!(error.close_code(), Some(4014));
}

#[tokio::test]
async fn test_closed_connection_is_pruned_on_next_connect() {
    let h = Harness::new(VoiceConfig::default());
    h.connect().await;
    let server = h.next_server().await;
    let mut state_rx = h.watch();
    server.hello(60_000.0).await;
    server.expect_packet().await;
    server.close(4011).await;
    wait_state(&mut state_rx, ConnectionState::Closed).await;

    h.connect().await;
    let second = h.next_server().await;
    assert_eq!(second.url, "wss://e.example?v=4");
}

#[tokio::test]
async fn test_speaking_requires_ready() {
    let h = Harness::new(VoiceConfig::default());
    h.connect().await;
    let server = h.next_server().await;

    let err = h.client.start_speaking(ROOM).await.unwrap_err();
    assert!(matches!(err, VoiceError::NotReady { .. }));

    server.handshake(60_000.0).await;
    h.client.wait_until_ready(ROOM, WAIT).await.unwrap();

    h.client.start_speaking(ROOM).await.unwrap();
    let VoicePacket::Speaking(speaking) = server.expect_packet().await else {
        panic!("expected SPEAKING");
    };
    assert_eq!((speaking.speaking, speaking.delay, speaking.ssrc), (1, 0, 77));

    h.client.stop_speaking(ROOM).await.unwrap();
    let VoicePacket::Speaking(speaking) = server.expect_packet().await else {
        panic!("expected SPEAKING");
    };
    assert_eq!(speaking.speaking, 0);
}

#[tokio::test]
async fn test_repeated_session_description_keeps_first_key() {
    let h = Harness::new(VoiceConfig::default());
    let mut events = h.client.event_stream();
    h.connect().await;
    let server = h.next_server().await;
    server.handshake(60_000.0).await;
    h.client.wait_until_ready(ROOM, WAIT).await.unwrap();

    server
        .send(json!({"op": 4, "d": {"mode": "xsalsa20_poly1305", "secret_key": [9, 9, 9]}}))
        .await;
    // Frames are handled in order; once this one surfaces the repeat was processed
    server
        .send(json!({"op": 5, "d": {"speaking": 1, "delay": 0, "ssrc": 12, "user_id": "40"}}))
        .await;
    let update = wait_event(&mut events, |e| matches!(e, ClientEvent::SpeakingUpdate { .. })).await;
    let ClientEvent::SpeakingUpdate { user_id, ssrc, .. } = update else {
        unreachable!();
    };
    assert_eq!((user_id, ssrc), (Some(UserId(40)), 12));

    assert_eq!(h.client.session_key(ROOM).unwrap().secret_key, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_client_disconnect_is_reported() {
    let h = Harness::new(VoiceConfig::default());
    let mut events = h.client.event_stream();
    h.connect().await;
    let server = h.next_server().await;
    server.handshake(60_000.0).await;

    server.send(json!({"op": 13, "d": {"user_id": "40"}})).await;
    let event = wait_event(&mut events, |e| matches!(e, ClientEvent::ClientDisconnected { .. })).await;
    assert!(matches!(event, ClientEvent::ClientDisconnected { user_id: Some(UserId(40)), .. }));
}

#[tokio::test]
async fn test_unsupported_encryption_mode_is_fatal() {
    let h = Harness::new(VoiceConfig::default());
    let mut events = h.client.event_stream();
    h.connect().await;
    let server = h.next_server().await;
    server.hello(60_000.0).await;
    server.expect_packet().await;

    server
        .send(json!({"op": 2, "d": {"ssrc": 1, "ip": "10.0.0.1", "port": 1, "modes": ["aes256_gcm"]}}))
        .await;

    let error = expect_failure(&mut events).await;
    assert!(matches!(*error, VoiceError::NoSupportedEncryptionMode { .. }));
}

#[tokio::test]
async fn test_reconnect_attempts_are_bounded_when_configured() {
    let h = Harness::new(VoiceConfig {
        max_reconnect_attempts: Some(1),
        ..fast_reconnect()
    });
    let mut events = h.client.event_stream();
    h.connect().await;

    h.next_server().await.close(4015).await;
    h.next_server().await.close(4015).await;

    let error = expect_failure(&mut events).await;
    assert!(matches!(*error, VoiceError::ReconnectExhausted { attempts: 1, .. }));
}

#[tokio::test]
async fn test_handshake_timeout_discards_pending_session() {
    let h = Harness::new(VoiceConfig {
        handshake_timeout_ms: 50,
        ..VoiceConfig::default()
    });

    let err = h.client.connect(ROOM, CHANNEL, false, false).await.unwrap_err();
    assert!(matches!(err, VoiceError::HandshakeTimeout { room_id, .. } if room_id == ROOM));
    assert!(!h.client.coordinator().is_pending(ROOM));
    assert!(!h.client.is_connected(ROOM));
    assert!(h.dialed().is_empty());

    // A late fragment has nothing to complete
    h.state_fragment("late");
    assert!(!h.client.coordinator().is_pending(ROOM));
}

#[tokio::test]
async fn test_fragments_in_any_order_fire_once() {
    let h = Harness::new(VoiceConfig::default());

    let (result, ()) = tokio::join!(h.client.connect(ROOM, CHANNEL, false, false), async {
        h.intents.recv().await.unwrap();
        // Allocation in progress, then the real server, then our state, then repeats
        h.server_fragment("tok", None, 1);
        h.server_fragment("tok", Some("e.example"), 2);
        h.state_fragment("sess");
        h.server_fragment("tok", Some("e.example"), 2);
        h.state_fragment("sess");
    });
    result.unwrap();

    let server = h.next_server().await;
    assert_eq!(server.url, "wss://e.example?v=4");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.servers.is_empty());
    assert_eq!(h.dialed().len(), 1);
}

#[tokio::test]
async fn test_new_voice_server_migrates_live_connection() {
    let h = Harness::new(VoiceConfig::default());
    h.connect().await;
    let server = h.next_server().await;
    server.handshake(60_000.0).await;
    h.client.wait_until_ready(ROOM, WAIT).await.unwrap();

    h.server_fragment("tok2", Some("f.example"), 9);
    assert_eq!(server.expect_close().await, 4000);

    let moved = h.next_server().await;
    assert_eq!(moved.url, "wss://f.example?v=4");
    let identify = moved.handshake(60_000.0).await;
    assert_eq!(identify.token, "tok2");
    assert_eq!(identify.session_id, "sess");
    h.client.wait_until_ready(ROOM, WAIT).await.unwrap();
}

#[tokio::test]
async fn test_older_voice_server_does_not_move_live_connection() {
    let h = Harness::new(VoiceConfig::default());
    h.connect_to(ROOM, "new.example", 10).await;
    let server = h.next_server().await;
    server.handshake(60_000.0).await;
    h.client.wait_until_ready(ROOM, WAIT).await.unwrap();

    // Delayed assignment from before the current one
    h.server_fragment("old-tok", Some("old.example"), 3);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.servers.is_empty());
    assert_eq!(h.dialed(), vec!["wss://new.example?v=4".to_string()]);
    assert_eq!(h.client.connection_state(ROOM), Some(ConnectionState::Ready));

    // A newer one still moves it
    h.server_fragment("tok11", Some("newer.example"), 11);
    assert_eq!(server.expect_close().await, 4000);
    let moved = h.next_server().await;
    assert_eq!(moved.url, "wss://newer.example?v=4");
    assert_eq!(moved.handshake(60_000.0).await.token, "tok11");
}

#[tokio::test]
async fn test_disconnect_all_leaves_every_room() {
    let h = Harness::new(VoiceConfig::default());
    let mut events = h.client.event_stream();
    let other = RoomId(3);

    h.connect_to(ROOM, "a.example", 1).await;
    h.connect_to(other, "b.example", 2).await;

    // The two dials race, so match servers to rooms by url
    let first = h.next_server().await;
    let second = h.next_server().await;
    let (a, b) = if first.url.contains("a.example") {
        (first, second)
    } else {
        (second, first)
    };
    assert_eq!(a.url, "wss://a.example?v=4");
    assert_eq!(b.url, "wss://b.example?v=4");

    a.handshake(60_000.0).await;
    b.handshake(60_000.0).await;
    h.client.wait_until_ready(ROOM, WAIT).await.unwrap();
    h.client.wait_until_ready(other, WAIT).await.unwrap();
    let mut a_state = h.watch();
    let mut b_state = h.client.watch_state(other).unwrap();

    h.client.disconnect_all().await;

    let mut left = vec![h.intents.recv().await.unwrap(), h.intents.recv().await.unwrap()];
    left.sort_by_key(|intent| intent.room_id.0);
    assert_eq!(left.iter().map(|i| i.room_id).collect::<Vec<_>>(), vec![ROOM, other]);
    assert!(left.iter().all(|intent| intent.channel_id.is_none()));
    assert!(h.client.coordinator().rooms().is_empty());

    a.close(4014).await;
    b.close(4014).await;
    wait_state(&mut a_state, ConnectionState::Closed).await;
    wait_state(&mut b_state, ConnectionState::Closed).await;

    wait_event(&mut events, |e| matches!(e, ClientEvent::VoiceDisconnected { room_id } if *room_id == ROOM)).await;
    assert!(drain_failures(&mut events).is_empty());
}

#[tokio::test]
async fn test_non_dispatch_parent_frames_are_returned() {
    let h = Harness::new(VoiceConfig::default());
    let hello = json!({"op": 10, "d": {"heartbeat_interval": 41250}});

    let event = h.client.handle_parent_frame(&hello.to_string()).unwrap();
    let Some(ParentEvent::Control(message)) = event else {
        panic!("expected control frame");
    };
    assert_eq!(message.op, 10);
    assert!(h.client.handle_parent_frame(r#"{"op":11}"#).unwrap().is_some());
}

#[tokio::test]
async fn test_passive_voice_states_are_tracked() {
    let h = Harness::new(VoiceConfig::default());
    let mut events = h.client.event_stream();

    let frame = json!({
        "op": 0, "t": "VOICE_STATE_UPDATE", "s": 3,
        "d": {"guild_id": "1", "channel_id": "5", "user_id": "40", "session_id": "other", "self_deaf": true}
    });
    assert!(h.client.handle_parent_frame(&frame.to_string()).unwrap().is_none());

    let ClientEvent::VoiceStateChanged { state, before } = events.recv().await.unwrap() else {
        panic!("expected voice state change");
    };
    assert!(before.is_none());
    assert!(state.self_deaf);
    assert_eq!(h.client.voice_state(UserId(40)).unwrap().session_id, "other");
    // Someone else's state never starts a session
    assert!(!h.client.coordinator().is_pending(ROOM));

    let passthrough = json!({"op": 0, "t": "MESSAGE_CREATE", "s": 4, "d": {}});
    let event = h.client.handle_parent_frame(&passthrough.to_string()).unwrap();
    assert_eq!(event.unwrap().name(), "MESSAGE_CREATE");
}
