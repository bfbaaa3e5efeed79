use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::rest::{CommandChannel, HttpTransport, RestTransport};
use super::{LinkSettings, NodeConfig, NodeStats, NodeStatus};
use crate::error::{Error, Result};
use crate::events::{CoordinatorEvent, EventBus};
use crate::protocol::{
    IncomingMessage, LoadResult, NodeInfo, PlayerEvent, PlayerState, Ready, TrackData, UpdatePlayer,
    UpdateSession,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What a link forwards to the player bound to a guild.
#[derive(Debug, Clone)]
pub enum PlayerMessage {
    State(PlayerState),
    Event(PlayerEvent),
    /// The node came back with a fresh session; replay the current track.
    Restart,
}

/// One event-stream session to one audio node.
///
/// Owns the node's [`CommandChannel`] and routes player frames, uninterpreted,
/// to whichever player is bound to the frame's guild.
pub struct NodeLink {
    config: NodeConfig,
    settings: LinkSettings,
    rest: CommandChannel,
    status: RwLock<NodeStatus>,
    session_id: RwLock<Option<String>>,
    stats: RwLock<Option<NodeStats>>,
    info: RwLock<Option<NodeInfo>>,
    players: DashMap<u64, mpsc::UnboundedSender<PlayerMessage>>,
    events: EventBus,
    shutdown: CancellationToken,
}

impl NodeLink {
    pub fn new(
        config: NodeConfig,
        settings: LinkSettings,
        transport: Arc<dyn RestTransport>,
        events: EventBus,
    ) -> Arc<Self> {
        let rest = CommandChannel::new(
            config.name.clone(),
            transport,
            settings.rest_min_interval,
            events.clone(),
        );

        Arc::new(Self {
            config,
            settings,
            rest,
            status: RwLock::new(NodeStatus::Disconnected),
            session_id: RwLock::new(None),
            stats: RwLock::new(None),
            info: RwLock::new(None),
            players: DashMap::new(),
            events,
            shutdown: CancellationToken::new(),
        })
    }

    /// A link whose commands go over HTTP.
    pub fn with_http(config: NodeConfig, settings: LinkSettings, events: EventBus) -> Result<Arc<Self>> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Ok(Self::new(config, settings, transport, events))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.read()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == NodeStatus::Ready
    }

    pub fn is_destroyed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn stats(&self) -> Option<NodeStats> {
        self.stats.read().clone()
    }

    pub fn info(&self) -> Option<NodeInfo> {
        self.info.read().clone()
    }

    /// Current penalty; zero while not ready.
    pub fn penalty(&self) -> u64 {
        if !self.is_ready() {
            return 0;
        }
        self.stats.read().as_ref().map_or(0, |s| s.penalty)
    }

    pub fn calls(&self) -> u64 {
        self.rest.calls()
    }

    pub fn rest(&self) -> &CommandChannel {
        &self.rest
    }

    pub fn bound_guilds(&self) -> Vec<u64> {
        self.players.iter().map(|entry| *entry.key()).collect()
    }

    pub(crate) fn attach(&self, guild_id: u64, sender: mpsc::UnboundedSender<PlayerMessage>) {
        self.players.insert(guild_id, sender);
    }

    pub(crate) fn detach(&self, guild_id: u64) {
        self.players.remove(&guild_id);
    }

    /// Opens the event stream and keeps it alive in the background.
    ///
    /// Only the first attempt is reported to the caller; later drops are
    /// retried by the link itself. Calling this while a connection is being
    /// made or is up does nothing.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::NodeUnavailable(format!("{} was destroyed", self.name())));
        }

        {
            let mut status = self.status.write();
            if *status != NodeStatus::Disconnected {
                debug!("[{}] Already {:?}, not connecting again", self.name(), *status);
                return Ok(());
            }
            *status = NodeStatus::Connecting;
        }

        let stream = match self.open().await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_status(NodeStatus::Disconnected);
                return Err(e);
            }
        };

        let link = Arc::clone(self);
        tokio::spawn(async move { link.supervise(stream).await });
        Ok(())
    }

    /// Tears the link down for good.
    pub fn destroy(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }

        self.shutdown.cancel();
        self.set_status(NodeStatus::Disconnected);
        info!("🗑️ [{}] Node destroyed", self.name());
        self.events.emit(CoordinatorEvent::NodeDestroyed {
            node: self.name().to_string(),
        });
    }

    pub async fn update_player(&self, guild_id: u64, update: &UpdatePlayer, no_replace: bool) -> Result<()> {
        let session_id = self.require_session()?;
        self.rest.update_player(&session_id, guild_id, update, no_replace).await
    }

    pub async fn destroy_player(&self, guild_id: u64) -> Result<()> {
        let session_id = self.require_session()?;
        self.rest.destroy_player(&session_id, guild_id).await
    }

    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        self.rest.load_tracks(identifier).await
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<Option<TrackData>> {
        self.rest.decode_track(encoded).await
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<TrackData>> {
        self.rest.decode_tracks(encoded).await
    }

    /// Pulls stats over REST, for when no websocket push has arrived yet.
    pub async fn refresh_stats(&self) -> Result<NodeStats> {
        let snapshot = NodeStats::new(self.rest.stats().await?);
        *self.stats.write() = Some(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn refresh_info(&self) -> Result<NodeInfo> {
        let info = self.rest.info().await?;
        *self.info.write() = Some(info.clone());
        Ok(info)
    }

    /// Decodes and dispatches one text frame from the node.
    pub(crate) fn handle_text(self: &Arc<Self>, text: &str) {
        let message = match serde_json::from_str::<IncomingMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("[{}] Dropping unrecognised frame: {}", self.name(), e);
                return;
            }
        };

        match message {
            IncomingMessage::Ready(ready) => self.on_ready(ready),
            IncomingMessage::Stats(stats) => {
                let snapshot = NodeStats::new(stats);
                trace!("[{}] Stats received, penalty {}", self.name(), snapshot.penalty);
                *self.stats.write() = Some(snapshot);
            }
            IncomingMessage::PlayerUpdate(update) => {
                self.route(&update.guild_id, PlayerMessage::State(update.state))
            }
            IncomingMessage::Event(event) => self.route(&event.guild_id, PlayerMessage::Event(event.event)),
        }
    }

    fn on_ready(self: &Arc<Self>, ready: Ready) {
        info!(
            "✅ [{}] Ready (session {}, resumed: {})",
            self.name(),
            ready.session_id,
            ready.resumed
        );

        let previous = self.session_id.write().replace(ready.session_id.clone());

        // Only players that outlived an earlier session lost their node-side
        // state; a resumed session still has them.
        let stranded: Vec<_> = if self.settings.auto_resume && !ready.resumed && previous.is_some() {
            self.players.iter().map(|entry| entry.value().clone()).collect()
        } else {
            Vec::new()
        };

        self.set_status(NodeStatus::Ready);
        self.events.emit(CoordinatorEvent::NodeReady {
            node: self.name().to_string(),
            session_id: ready.session_id.clone(),
            resumed: ready.resumed,
        });

        let link = Arc::clone(self);
        tokio::spawn(async move { link.after_ready(ready.session_id, stranded).await });
    }

    async fn after_ready(&self, session_id: String, stranded: Vec<mpsc::UnboundedSender<PlayerMessage>>) {
        let update = UpdateSession {
            resuming: true,
            timeout: self.settings.resume_timeout.as_secs(),
        };
        if let Err(e) = self.rest.update_session(&session_id, update).await {
            warn!("[{}] Could not configure resuming: {}", self.name(), e);
        }

        match self.rest.info().await {
            Ok(info) => {
                debug!("[{}] Node version {}", self.name(), info.version.semver);
                *self.info.write() = Some(info);
            }
            Err(e) => warn!("[{}] Could not fetch node info: {}", self.name(), e),
        }

        let restarted = stranded
            .iter()
            .filter(|player| player.send(PlayerMessage::Restart).is_ok())
            .count();

        if restarted > 0 {
            info!("🔁 [{}] Restarting {} players", self.name(), restarted);
        }
    }

    fn route(&self, guild_id: &str, message: PlayerMessage) {
        let Ok(guild_id) = guild_id.parse::<u64>() else {
            warn!("[{}] Frame with invalid guild id {:?}", self.name(), guild_id);
            return;
        };

        match self.players.get(&guild_id) {
            Some(sender) => {
                if sender.send(message).is_err() {
                    debug!("[{}] Player for guild {} is gone", self.name(), guild_id);
                }
            }
            None => trace!("[{}] No player bound for guild {}", self.name(), guild_id),
        }
    }

    fn require_session(&self) -> Result<String> {
        if !self.is_ready() {
            return Err(Error::NodeUnavailable(format!("{} is not ready", self.name())));
        }
        self.session_id()
            .ok_or_else(|| Error::NodeUnavailable(format!("{} has no session", self.name())))
    }

    fn set_status(&self, status: NodeStatus) {
        *self.status.write() = status;
    }

    fn handshake(&self) -> Result<Request> {
        let mut request = self.config.websocket_url().into_client_request()?;
        let headers = request.headers_mut();

        headers.insert("Authorization", header_value(&self.config.password)?);
        headers.insert("User-Id", header_value(&self.settings.user_id.to_string())?);
        headers.insert("Client-Name", header_value(&self.settings.client_name)?);
        if let Some(session_id) = self.session_id() {
            headers.insert("Session-Id", header_value(&session_id)?);
        }

        Ok(request)
    }

    async fn open(&self) -> Result<WsStream> {
        let request = self.handshake()?;
        let (stream, _) = connect_async(request).await?;

        info!("🔌 [{}] Connected to {}", self.name(), self.config.websocket_url());
        self.events.emit(CoordinatorEvent::NodeConnected {
            node: self.name().to_string(),
        });
        Ok(stream)
    }

    async fn supervise(self: Arc<Self>, mut stream: WsStream) {
        loop {
            let (code, reason) = self.read_frames(&mut stream).await;
            self.set_status(NodeStatus::Disconnected);

            if self.is_destroyed() {
                return;
            }

            warn!("[{}] Disconnected ({:?}): {}", self.name(), code, reason);
            self.events.emit(CoordinatorEvent::NodeDisconnected {
                node: self.name().to_string(),
                code,
                reason,
            });

            match self.reconnect().await {
                Some(next) => stream = next,
                None => {
                    if !self.is_destroyed() {
                        error!(
                            "❌ [{}] Giving up after {} reconnect attempts",
                            self.name(),
                            self.settings.reconnect_attempts
                        );
                        self.destroy();
                    }
                    return;
                }
            }
        }
    }

    async fn read_frames(self: &Arc<Self>, stream: &mut WsStream) -> (Option<u16>, String) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    if let Err(e) = stream.close(None).await {
                        debug!("[{}] Close failed: {}", self.name(), e);
                    }
                    return (Some(1000), "client shutdown".to_string());
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Close(frame))) => {
                        return frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                            .unwrap_or((None, String::new()));
                    }
                    Some(Ok(other)) => trace!("[{}] Ignoring frame {:?}", self.name(), other),
                    Some(Err(e)) => {
                        self.events.emit(CoordinatorEvent::NodeError {
                            node: self.name().to_string(),
                            message: e.to_string(),
                        });
                        return (None, e.to_string());
                    }
                    None => return (None, "stream ended".to_string()),
                }
            }
        }
    }

    async fn reconnect(&self) -> Option<WsStream> {
        for attempt in 1..=self.settings.reconnect_attempts {
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }

            info!("🔄 [{}] Reconnect attempt {}", self.name(), attempt);
            self.events.emit(CoordinatorEvent::NodeReconnecting {
                node: self.name().to_string(),
                attempt,
            });

            self.set_status(NodeStatus::Connecting);
            match self.open().await {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    self.set_status(NodeStatus::Disconnected);
                    warn!("[{}] Reconnect attempt {} failed: {}", self.name(), attempt, e);
                    self.events.emit(CoordinatorEvent::NodeError {
                        node: self.name().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        None
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::InvalidConfig(format!("invalid header value: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{node_config, push_players, ready_link, settings, settle, MockTransport};
    use pretty_assertions::assert_eq;
    use reqwest::Method;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ready_captures_session_and_configures_resume() {
        let transport = MockTransport::new();
        let events = EventBus::default();
        let link = ready_link("alpha", &transport, &events);
        settle().await;

        assert_eq!(link.status(), NodeStatus::Ready);
        assert_eq!(link.session_id().as_deref(), Some("alpha-session"));

        let session_updates = transport.requests_to(Method::PATCH, "/v4/sessions/alpha-session");
        assert_eq!(session_updates.len(), 1);
        assert_eq!(
            session_updates[0].body,
            Some(serde_json::json!({"resuming": true, "timeout": 60}))
        );
        assert_eq!(transport.requests_to(Method::GET, "/v4/info").len(), 1);
        assert!(link.info().is_some());
    }

    #[tokio::test]
    async fn test_stats_replace_snapshot_and_penalty() {
        let transport = MockTransport::new();
        let link = ready_link("alpha", &transport, &EventBus::default());

        push_players(&link, 4);
        assert_eq!(link.penalty(), 4);
        push_players(&link, 1);
        assert_eq!(link.penalty(), 1);
        assert_eq!(link.stats().map(|s| s.stats.playing_players), Some(1));
    }

    #[tokio::test]
    async fn test_penalty_is_zero_while_disconnected() {
        let transport = MockTransport::new();
        let link = NodeLink::new(node_config("cold"), settings(), transport, EventBus::default());
        push_players(&link, 9);
        assert_eq!(link.penalty(), 0);
    }

    #[tokio::test]
    async fn test_player_frames_are_routed_by_guild() {
        let transport = MockTransport::new();
        let link = ready_link("alpha", &transport, &EventBus::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.attach(42, tx);

        link.handle_text(r#"{"op":"playerUpdate","guildId":"42","state":{"time":1,"position":1500,"connected":true,"ping":20}}"#);
        link.handle_text(r#"{"op":"playerUpdate","guildId":"7","state":{"time":1,"position":1,"connected":true,"ping":1}}"#);
        link.handle_text(r#"{"op":"event","type":"TrackStartEvent","guildId":"42","track":{"encoded":"E","info":{}}}"#);
        link.handle_text("not json at all");

        match rx.recv().await {
            Some(PlayerMessage::State(state)) => assert_eq!(state.position, 1500),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            rx.recv().await,
            Some(PlayerMessage::Event(PlayerEvent::TrackStart { .. }))
        ));
        assert!(rx.try_recv().is_err());

        link.detach(42);
        assert!(link.bound_guilds().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_session_restarts_bound_players() {
        let transport = MockTransport::new();
        let link = ready_link("alpha", &transport, &EventBus::default());
        settle().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        link.attach(1, tx);

        link.handle_text(r#"{"op":"ready","resumed":true,"sessionId":"again"}"#);
        settle().await;
        assert!(rx.try_recv().is_err());

        link.handle_text(r#"{"op":"ready","resumed":false,"sessionId":"fresh"}"#);
        settle().await;
        assert!(matches!(rx.try_recv(), Ok(PlayerMessage::Restart)));
        assert_eq!(link.session_id().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_only_players_from_a_lost_session_restart() {
        let transport = MockTransport::new();
        transport.delay("/v4/info", Duration::from_millis(30));
        let link = NodeLink::new(node_config("alpha"), settings(), transport.clone(), EventBus::default());

        let (early_tx, mut early) = mpsc::unbounded_channel();
        link.attach(1, early_tx);
        link.handle_text(r#"{"op":"ready","resumed":false,"sessionId":"first"}"#);
        let (late_tx, mut late) = mpsc::unbounded_channel();
        link.attach(2, late_tx);
        settle().await;
        settle().await;

        assert!(early.try_recv().is_err());
        assert!(late.try_recv().is_err());

        link.handle_text(r#"{"op":"ready","resumed":false,"sessionId":"second"}"#);
        let (joined_tx, mut joined) = mpsc::unbounded_channel();
        link.attach(3, joined_tx);
        settle().await;
        settle().await;

        assert!(matches!(early.try_recv(), Ok(PlayerMessage::Restart)));
        assert!(matches!(late.try_recv(), Ok(PlayerMessage::Restart)));
        assert!(joined.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_commands_need_a_ready_session() {
        let transport = MockTransport::new();
        let link = NodeLink::new(node_config("cold"), settings(), transport.clone(), EventBus::default());

        let result = link.update_player(1, &UpdatePlayer::default(), false).await;
        assert!(matches!(result, Err(Error::NodeUnavailable(_))));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let transport = MockTransport::new();
        let mut config = node_config("closed");
        config.host = "127.0.0.1".into();
        config.port = 1;
        let link = NodeLink::new(config, settings(), transport, EventBus::default());

        assert!(link.connect().await.is_err());
        assert_eq!(link.status(), NodeStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_destroy_is_final() {
        let transport = MockTransport::new();
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let link = ready_link("alpha", &transport, &events);

        link.destroy();
        link.destroy();

        assert_eq!(link.status(), NodeStatus::Disconnected);
        assert!(matches!(link.connect().await, Err(Error::NodeUnavailable(_))));

        let mut destroyed = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, CoordinatorEvent::NodeDestroyed { .. }) {
                destroyed += 1;
            }
        }
        assert_eq!(destroyed, 1);
    }

    async fn accept(listener: &tokio::net::TcpListener) -> WebSocketStream<TcpStream> {
        let (socket, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(socket).await.unwrap()
    }

    async fn going_away(stream: &mut WebSocketStream<TcpStream>) {
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;

        stream
            .close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "restarting".into(),
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_stream_reconnects_then_gives_up() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = node_config("local");
        config.host = "127.0.0.1".to_string();
        config.port = listener.local_addr().unwrap().port();

        let events = EventBus::default();
        let mut rx = events.subscribe();
        let link = NodeLink::new(
            config,
            LinkSettings {
                reconnect_attempts: 2,
                ..settings()
            },
            MockTransport::new(),
            events.clone(),
        );

        // The node drops the first stream, takes the reconnect, then goes
        // away for good before dropping the second one.
        let node = tokio::spawn(async move {
            let mut first = accept(&listener).await;
            going_away(&mut first).await;
            let mut second = accept(&listener).await;
            drop(listener);
            going_away(&mut second).await;
        });

        link.connect().await.unwrap();

        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("link never gave up")
                .unwrap();
            let label = match event {
                CoordinatorEvent::NodeConnected { .. } => "connected".to_string(),
                CoordinatorEvent::NodeDisconnected { code, .. } => format!("disconnected {:?}", code),
                CoordinatorEvent::NodeReconnecting { attempt, .. } => format!("reconnecting {attempt}"),
                CoordinatorEvent::NodeError { .. } => "error".to_string(),
                CoordinatorEvent::NodeDestroyed { .. } => "destroyed".to_string(),
                _ => continue,
            };
            let done = label == "destroyed";
            seen.push(label);
            if done {
                break;
            }
        }
        node.await.unwrap();

        // Each drop starts counting again from the first attempt.
        assert_eq!(
            seen,
            vec![
                "connected",
                "disconnected Some(1001)",
                "reconnecting 1",
                "connected",
                "disconnected Some(1001)",
                "reconnecting 1",
                "error",
                "reconnecting 2",
                "error",
                "destroyed",
            ]
        );
        assert!(link.is_destroyed());
        assert_eq!(link.status(), NodeStatus::Disconnected);
    }
}
