//! WebSocket server and per-connection lifecycle.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── StateEngine (authoritative board)
//!            ├── Hub (one lock) ────┼── SessionRegistry
//! Client B ──┘        ▲             └── BroadcastGroup ──┬──► Client A
//!                     │                                  └──► Client B
//!                  ticker (optional clock)
//! ```
//!
//! Every state change (client mutation or clock tick) is applied and
//! broadcast while holding the hub lock. That gives one total order over all
//! changes, and every subscriber sees broadcasts in exactly that order.
//!
//! Connection states: `Connecting -> Open -> Closed`. The INITIALIZE
//! snapshot is taken under the same lock that subscribes the session, so a
//! new client gets neither a gap nor a replay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use conway_core::{MutationError, StateEngine};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats, Frame, Subscriber};
use crate::error::{ProtocolError, SessionError, SyncError};
use crate::gateway::{self, GatewayOutcome};
use crate::identity::{extract_identity, Identity};
use crate::protocol::{Envelope, ServerMessage};
use crate::registry::{ClientSession, SessionRegistry};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per session before the oldest are dropped.
    /// Rounded up to the next power of two.
    pub broadcast_capacity: usize,
    /// Maximum concurrent sessions (None = unbounded)
    pub max_sessions: Option<usize>,
    /// Heartbeat ping interval in seconds (0 = disabled)
    pub heartbeat_interval_secs: u64,
    /// Engine clock interval in milliseconds (0 = no clock)
    pub tick_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            broadcast_capacity: 256,
            max_sessions: None,
            heartbeat_interval_secs: 30,
            tick_interval_ms: 0,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    pub fn tick_interval(&self) -> Option<Duration> {
        (self.tick_interval_ms > 0).then(|| Duration::from_millis(self.tick_interval_ms))
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub active_sessions: usize,
    pub total_messages: u64,
    pub malformed_messages: u64,
    pub ignored_messages: u64,
    pub rejected_mutations: u64,
    pub accepted_mutations: u64,
    pub ticks: u64,
}

/// Result of dispatching one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Not a valid envelope; nothing happened.
    Malformed(ProtocolError),
    /// Valid envelope of a type the server does not act on.
    Ignored(String),
    /// The engine refused the mutation.
    Rejected(MutationError),
    /// Mutation applied and broadcast to `receivers` sessions.
    Broadcast { receivers: usize },
    /// Mutation applied but the update could not be encoded.
    EncodeFailed(ProtocolError),
}

/// A freshly opened session, ready to be served.
pub struct OpenedSession {
    pub session_id: Uuid,
    pub subscriber: Subscriber,
    /// Encoded INITIALIZE envelope for this client only
    pub initialize: Frame,
}

/// Everything that must change atomically: engine, registry, fan-out.
pub struct Hub<E> {
    engine: E,
    registry: SessionRegistry,
    broadcast: BroadcastGroup,
    stats: ServerStats,
}

impl<E: StateEngine> Hub<E> {
    pub fn new(engine: E, config: &ServerConfig) -> Self {
        let registry = match config.max_sessions {
            Some(capacity) => SessionRegistry::with_capacity(capacity),
            None => SessionRegistry::new(),
        };
        Self {
            engine,
            registry,
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
            stats: ServerStats::default(),
        }
    }

    /// Register a session, subscribe it to broadcasts, and build its INITIALIZE frame.
    pub fn open_session(&mut self, identity: Identity) -> Result<OpenedSession, SyncError> {
        let initialize = ServerMessage::initialize(
            self.engine.state(),
            self.engine.settings(),
            identity.clone(),
        )
        .encode()?;

        let (outbox, subscriber) = self.broadcast.channel();
        let mut session = ClientSession::new(identity, outbox);
        session.open();
        let session_id = session.session_id;
        if let Err(e) = self.registry.register(session) {
            self.stats.rejected_connections += 1;
            return Err(e.into());
        }
        self.stats.active_sessions = self.registry.len();

        Ok(OpenedSession {
            session_id,
            subscriber,
            initialize: Frame::from(initialize),
        })
    }

    /// Decode one text frame from `session_id` and act on it.
    ///
    /// Nothing here can fail the session: bad input is logged and dropped.
    pub fn dispatch(&mut self, session_id: &Uuid, raw: &str) -> Dispatch {
        self.stats.total_messages += 1;
        let token = self
            .registry
            .get(session_id)
            .map_or("<unregistered>", |s| s.token())
            .to_string();

        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.malformed_messages += 1;
                log::warn!("Dropping malformed message from {token}: {e}");
                return Dispatch::Malformed(e);
            }
        };

        match gateway::submit(&mut self.engine, envelope) {
            GatewayOutcome::Applied(state) => {
                self.stats.accepted_mutations += 1;
                log::debug!("Mutation from {token} accepted");
                self.publish(&state)
            }
            GatewayOutcome::Ignored(kind) => {
                self.stats.ignored_messages += 1;
                Dispatch::Ignored(kind)
            }
            GatewayOutcome::Rejected(e) => {
                self.stats.rejected_mutations += 1;
                Dispatch::Rejected(e)
            }
        }
    }

    /// Advance the engine clock and broadcast the result.
    ///
    /// Returns the number of receivers, or `None` if the engine has no clock.
    pub fn advance(&mut self) -> Option<usize> {
        let state = self.engine.tick()?;
        self.stats.ticks += 1;
        match self.publish(&state) {
            Dispatch::Broadcast { receivers } => Some(receivers),
            _ => Some(0),
        }
    }

    /// Remove a session and end its broadcast stream. Safe to call more than once.
    pub fn close_session(&mut self, session_id: &Uuid) -> Option<ClientSession> {
        let removed = self.registry.deregister(session_id);
        self.stats.active_sessions = self.registry.len();
        removed
    }

    pub fn note_connection(&mut self) {
        self.stats.total_connections += 1;
    }

    pub fn note_rejection(&mut self) {
        self.stats.rejected_connections += 1;
    }

    pub fn state(&self) -> Value {
        self.engine.state()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.clone()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcast.stats()
    }

    fn publish(&self, state: &Value) -> Dispatch {
        match self.broadcast.broadcast_state(&self.registry, state) {
            Ok(receivers) => Dispatch::Broadcast { receivers },
            Err(e) => {
                log::error!("Failed to encode state update: {e}");
                Dispatch::EncodeFailed(e)
            }
        }
    }
}

type SharedHub<E> = Arc<Mutex<Hub<E>>>;

/// The sync server.
pub struct SyncServer<E> {
    config: ServerConfig,
    hub: SharedHub<E>,
}

impl<E: StateEngine> SyncServer<E> {
    /// Create a server around an engine.
    pub fn new(config: ServerConfig, engine: E) -> Self {
        let hub = Arc::new(Mutex::new(Hub::new(engine, &config)));
        Self { config, hub }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await;
        Ok(())
    }

    /// Serve connections from an already-bound listener.
    ///
    /// Accept errors are logged and retried; this only returns if the task
    /// is cancelled.
    pub async fn serve(&self, listener: TcpListener) {
        let ticker = self.config.tick_interval().map(|every| spawn_ticker(self.hub.clone(), every));
        let _ticker = TickerGuard(ticker);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    log::debug!("New TCP connection from {addr}");
                    let hub = self.hub.clone();
                    let heartbeat = self.config.heartbeat_interval();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, hub, heartbeat).await {
                            log::warn!("Connection error from {addr}: {e}");
                        }
                    });
                }
                Err(e) => {
                    log::error!("Failed to accept connection: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared handle to the hub (engine + registry + fan-out).
    pub fn hub(&self) -> SharedHub<E> {
        self.hub.clone()
    }

    pub async fn stats(&self) -> ServerStats {
        self.hub.lock().await.stats()
    }
}

/// Aborts the ticker when the serve loop ends.
struct TickerGuard(Option<JoinHandle<()>>);

impl Drop for TickerGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

fn spawn_ticker<E: StateEngine>(hub: SharedHub<E>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if hub.lock().await.advance().is_none() {
                log::info!("Engine has no clock; stopping ticker");
                return;
            }
        }
    })
}

/// Run one connection from upgrade to teardown.
async fn handle_connection<E: StateEngine>(
    stream: TcpStream,
    addr: SocketAddr,
    hub: SharedHub<E>,
    heartbeat: Option<Duration>,
) -> Result<(), SyncError> {
    let mut request_target = String::new();
    let mut ws = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            request_target = req.uri().to_string();
            Ok(resp)
        },
    )
    .await?;
    hub.lock().await.note_connection();

    let identity = match extract_identity(&request_target) {
        Ok(identity) => identity,
        Err(e) => {
            log::info!("Rejecting connection from {addr}: {e}");
            hub.lock().await.note_rejection();
            close_with(&mut ws, CloseCode::Policy, "missing or malformed token").await;
            return Ok(());
        }
    };
    let token = identity.token.clone();

    let opened = hub.lock().await.open_session(identity);
    let opened = match opened {
        Ok(opened) => opened,
        Err(SyncError::Session(e @ SessionError::Full { .. })) => {
            log::warn!("Rejecting {token} from {addr}: {e}");
            close_with(&mut ws, CloseCode::Again, "server full").await;
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let session_id = opened.session_id;
    log::info!("User {token} connected from {addr} (session {session_id})");

    let result = serve_session(ws, opened, &hub, heartbeat).await;

    let uptime = hub
        .lock()
        .await
        .close_session(&session_id)
        .map(|session| session.uptime())
        .unwrap_or_default();
    match &result {
        Ok(()) => log::info!("User {token} closed connection after {uptime:.1?}"),
        Err(e) => log::warn!("User {token} dropped after {uptime:.1?}: {e}"),
    }
    result
}

/// The open-state loop: inbound dispatch, outbound broadcasts, heartbeat.
async fn serve_session<E: StateEngine>(
    ws: WebSocketStream<TcpStream>,
    opened: OpenedSession,
    hub: &SharedHub<E>,
    heartbeat: Option<Duration>,
) -> Result<(), SyncError> {
    let OpenedSession {
        session_id,
        mut subscriber,
        initialize,
    } = opened;
    let (mut ws_sender, mut ws_receiver) = ws.split();

    ws_sender.send(Message::Text(initialize)).await?;

    let mut heartbeat_timer = heartbeat.map(|every| {
        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let outcome = hub.lock().await.dispatch(&session_id, text.as_str());
                        log::trace!("Session {session_id}: {outcome:?}");
                    }
                    Some(Ok(Message::Binary(data))) => {
                        log::debug!("Ignoring {} byte binary frame from session {session_id}", data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) => {
                        // Flush the queued close reply so the peer sees a clean shutdown
                        if let Err(e) = ws_sender.close().await {
                            log::debug!("Session {session_id}: close reply failed: {e}");
                        }
                        break;
                    }
                    None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(ProtocolError::Transport(e.to_string()).into());
                    }
                }
            }

            frame = subscriber.recv() => {
                match frame {
                    Some(frame) => ws_sender.send(Message::Text(frame)).await?,
                    // Deregistered elsewhere
                    None => {
                        let _ = ws_sender.close().await;
                        break;
                    }
                }
            }

            _ = next_heartbeat(&mut heartbeat_timer) => {
                let limit = heartbeat.map_or(Duration::MAX, |every| every * 2);
                if last_seen.elapsed() > limit {
                    return Err(ProtocolError::Timeout.into());
                }
                ws_sender.send(Message::Ping(Default::default())).await?;
            }
        }
    }

    Ok(())
}

async fn next_heartbeat(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        // No heartbeat configured, wait forever
        None => std::future::pending().await,
    }
}

async fn close_with(ws: &mut WebSocketStream<TcpStream>, code: CloseCode, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        log::debug!("Close handshake failed: {e}");
        return;
    }
    // Let the peer acknowledge the close
    let drain = async { while let Some(Ok(_)) = ws.next().await {} };
    let _ = tokio::time::timeout(Duration::from_secs(1), drain).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use conway_core::{GameSettings, LifeGame};
    use serde_json::json;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            max_sessions: None,
            heartbeat_interval_secs: 0,
            tick_interval_ms: 0,
        }
    }

    fn test_hub() -> Hub<LifeGame> {
        let game = LifeGame::new(GameSettings {
            width: 8,
            height: 8,
            tick_interval_ms: 0,
        });
        Hub::new(game, &test_config())
    }

    fn add_point(x: u64, y: u64) -> String {
        json!({ "type": "ADD_POINT", "data": { "x": x, "y": y } }).to_string()
    }

    fn decode(frame: &Frame) -> ServerMessage {
        ServerMessage::decode(frame.as_str()).unwrap()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.max_sessions, None);
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.tick_interval(), None);
    }

    #[test]
    fn test_open_session_sends_initialize() {
        let mut hub = test_hub();
        let opened = hub.open_session(Identity::new("alice")).unwrap();

        match decode(&opened.initialize) {
            ServerMessage::Initialize(data) => {
                assert_eq!(data.user.token, "alice");
                assert_eq!(data.state, hub.state());
                assert_eq!(data.settings["width"], 8);
            }
            other => panic!("Expected INITIALIZE, got {other:?}"),
        }
        assert!(hub.registry().contains(&opened.session_id));
        assert_eq!(hub.stats().active_sessions, 1);
    }

    #[test]
    fn test_mutation_broadcast_to_all_including_sender() {
        let mut hub = test_hub();
        let mut a = hub.open_session(Identity::new("alice")).unwrap();
        let mut b = hub.open_session(Identity::new("bob")).unwrap();

        let outcome = hub.dispatch(&a.session_id, &add_point(2, 3));
        assert_eq!(outcome, Dispatch::Broadcast { receivers: 2 });

        let frame_a = a.subscriber.try_recv().unwrap();
        let frame_b = b.subscriber.try_recv().unwrap();
        assert_eq!(frame_a.as_str(), frame_b.as_str());
        match decode(&frame_a) {
            ServerMessage::UpdateState(state) => assert_eq!(state["field"][3][2], 1),
            other => panic!("Expected UPDATE_STATE, got {other:?}"),
        }
        assert!(a.subscriber.try_recv().is_none());
        assert!(b.subscriber.try_recv().is_none());
    }

    #[test]
    fn test_broadcasts_follow_acceptance_order() {
        let mut hub = test_hub();
        let mut a = hub.open_session(Identity::new("alice")).unwrap();
        let b = hub.open_session(Identity::new("bob")).unwrap();

        let moves = [(0, 0), (1, 1), (2, 2), (7, 7)];
        let mut expected = Vec::new();
        for (i, (x, y)) in moves.iter().enumerate() {
            let sender = if i % 2 == 0 { &a.session_id } else { &b.session_id };
            hub.dispatch(sender, &add_point(*x, *y));
            expected.push(hub.state());
        }

        for state in expected {
            assert_eq!(
                decode(&a.subscriber.try_recv().unwrap()),
                ServerMessage::UpdateState(state)
            );
        }
    }

    #[test]
    fn test_late_joiner_gets_snapshot_not_replays() {
        let mut hub = test_hub();
        let early = hub.open_session(Identity::new("early")).unwrap();
        hub.dispatch(&early.session_id, &add_point(1, 1));
        hub.dispatch(&early.session_id, &add_point(2, 2));

        let mut late = hub.open_session(Identity::new("late")).unwrap();
        match decode(&late.initialize) {
            ServerMessage::Initialize(data) => {
                assert_eq!(data.state["field"][1][1], 1);
                assert_eq!(data.state["field"][2][2], 1);
            }
            other => panic!("Expected INITIALIZE, got {other:?}"),
        }
        assert!(late.subscriber.try_recv().is_none());
    }

    #[test]
    fn test_malformed_message_changes_nothing() {
        let mut hub = test_hub();
        let mut a = hub.open_session(Identity::new("alice")).unwrap();
        let before = hub.state();

        assert!(matches!(
            hub.dispatch(&a.session_id, "{not json"),
            Dispatch::Malformed(ProtocolError::Decode(_))
        ));
        assert_eq!(hub.state(), before);
        assert!(a.subscriber.try_recv().is_none());
        assert!(hub.registry().contains(&a.session_id));

        // Still processing afterwards
        assert_eq!(
            hub.dispatch(&a.session_id, &add_point(0, 0)),
            Dispatch::Broadcast { receivers: 1 }
        );
        assert_eq!(hub.stats().malformed_messages, 1);
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let mut hub = test_hub();
        let mut a = hub.open_session(Identity::new("alice")).unwrap();
        let before = hub.state();

        let raw = json!({ "type": "CLEAR_BOARD", "data": null }).to_string();
        assert_eq!(
            hub.dispatch(&a.session_id, &raw),
            Dispatch::Ignored("CLEAR_BOARD".to_string())
        );
        assert_eq!(hub.state(), before);
        assert!(a.subscriber.try_recv().is_none());
    }

    #[test]
    fn test_rejected_mutation_not_broadcast() {
        let mut hub = test_hub();
        let mut a = hub.open_session(Identity::new("alice")).unwrap();

        let outcome = hub.dispatch(&a.session_id, &add_point(99, 0));
        assert!(matches!(
            outcome,
            Dispatch::Rejected(MutationError::OutOfBounds { .. })
        ));
        assert!(a.subscriber.try_recv().is_none());
        assert_eq!(hub.stats().rejected_mutations, 1);
    }

    #[test]
    fn test_close_session_idempotent() {
        let mut hub = test_hub();
        let a = hub.open_session(Identity::new("alice")).unwrap();
        let b = hub.open_session(Identity::new("bob")).unwrap();

        assert!(hub.close_session(&a.session_id).is_some());
        assert!(hub.close_session(&a.session_id).is_none());
        assert_eq!(hub.registry().len(), 1);
        assert!(hub.registry().contains(&b.session_id));
        assert_eq!(hub.stats().active_sessions, 1);
    }

    #[tokio::test]
    async fn test_closed_session_skipped_by_broadcast() {
        let mut hub = test_hub();
        let mut a = hub.open_session(Identity::new("alice")).unwrap();
        let mut b = hub.open_session(Identity::new("bob")).unwrap();

        // Subscriber still held: deregistration alone must cut it off
        hub.close_session(&a.session_id);

        assert_eq!(
            hub.dispatch(&b.session_id, &add_point(4, 4)),
            Dispatch::Broadcast { receivers: 1 }
        );
        assert!(b.subscriber.try_recv().is_some());
        assert!(a.subscriber.try_recv().is_none());
        assert!(a.subscriber.recv().await.is_none());
        assert_eq!(hub.broadcast_stats().active_receivers, 2);
    }

    #[test]
    fn test_session_limit() {
        let config = ServerConfig {
            max_sessions: Some(1),
            ..test_config()
        };
        let mut hub = Hub::new(LifeGame::default(), &config);
        let _a = hub.open_session(Identity::new("alice")).unwrap();
        let err = hub.open_session(Identity::new("bob")).err().unwrap();
        assert!(matches!(err, SyncError::Session(SessionError::Full { capacity: 1 })));
        assert_eq!(hub.registry().len(), 1);
        assert_eq!(hub.stats().rejected_connections, 1);
    }

    #[test]
    fn test_advance_broadcasts_next_generation() {
        let mut hub = test_hub();
        let mut a = hub.open_session(Identity::new("alice")).unwrap();

        assert_eq!(hub.advance(), Some(1));
        match decode(&a.subscriber.try_recv().unwrap()) {
            ServerMessage::UpdateState(state) => assert_eq!(state["generation"], 1),
            other => panic!("Expected UPDATE_STATE, got {other:?}"),
        }
        assert_eq!(hub.stats().ticks, 1);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::new(test_config(), LifeGame::default());
        let stats = server.stats().await;
        assert_eq!(stats, ServerStats::default());
        assert_eq!(server.config().bind_addr, "127.0.0.1:0");
    }
}
