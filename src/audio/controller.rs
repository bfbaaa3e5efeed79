//! # Playback Controller
//!
//! The per-guild playback state machine. A controller is bound to exactly one
//! [`NodeLink`] at a time; all of its node commands go through that link's
//! command channel and all node events for its guild arrive, in order, on
//! its inbox task.
//!
//! ```text
//! Idle -> Loading -> Playing <-> Paused -> Idle
//! ```
//!
//! While a migration runs the controller is in [`ControllerMode::Migrating`]
//! and drops every node event it receives.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::migration::MigrationTransaction;
use super::queue::{LoopMode, TrackQueue};
use super::track::{Track, TrackEndReason};
use super::voice::{VoiceSession, VoiceTransition};
use crate::collaborators::{GatewaySender, Services};
use crate::error::{Error, Result};
use crate::events::{CoordinatorEvent, EventBus};
use crate::node::{NodeLink, PlayerMessage};
use crate::protocol::{
    voice_state_command, PlayerEvent, PlayerState, TrackData, TrackException, UpdatePlayer, UpdatePlayerTrack,
};

/// Voice close codes after which rejoining the channel can recover the
/// session: session no longer valid, session timeout, call terminated.
const RECOVERABLE_CLOSE_CODES: [u16; 3] = [4006, 4009, 4015];

const MAX_VOLUME: u16 = 1000;

/// Per-player defaults.
#[derive(Debug, Clone)]
pub struct PlayerSettings {
    pub voice_timeout: Duration,
    pub default_volume: u16,
    pub max_queue_size: usize,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            voice_timeout: Duration::from_secs(15),
            default_volume: 100,
            max_queue_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Idle,
    Loading,
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerMode {
    Stable,
    Migrating,
}

/// What to do after the current track ended.
#[derive(Debug, Clone, PartialEq)]
pub enum EndAction {
    Nothing,
    PlayNext,
    Autoplay(Track),
    QueueEnded,
}

/// Track-end policy. Re-enqueues the ended track as the loop mode asks and
/// says what should happen next; the first matching rule wins.
pub fn decide_track_end(
    queue: &mut TrackQueue,
    loop_mode: LoopMode,
    autoplay: bool,
    ended: &Track,
    reason: &TrackEndReason,
) -> EndAction {
    if reason.is_superseded() {
        return EndAction::Nothing;
    }

    if reason.is_failure() {
        return if queue.is_empty() {
            EndAction::QueueEnded
        } else {
            EndAction::PlayNext
        };
    }

    match loop_mode {
        LoopMode::Track => {
            queue.push_front(ended.clone());
            EndAction::PlayNext
        }
        LoopMode::Queue => {
            queue.push_back(ended.clone());
            EndAction::PlayNext
        }
        LoopMode::None if !queue.is_empty() => EndAction::PlayNext,
        LoopMode::None if autoplay => EndAction::Autoplay(ended.clone()),
        LoopMode::None => EndAction::QueueEnded,
    }
}

struct PlaybackState {
    current: Option<Track>,
    queue: TrackQueue,
    loop_mode: LoopMode,
    volume: u16,
    filters: Option<Value>,
    autoplay: bool,
    paused: bool,
    loading: bool,
    channel_id: Option<u64>,
    self_deaf: bool,
    self_mute: bool,
    position: u64,
    position_at: Instant,
    ping: i64,
    mode: ControllerMode,
    /// Encoded track that failed; its trailing end event is swallowed.
    faulted: Option<String>,
    destroyed: bool,
}

impl PlaybackState {
    fn new(settings: &PlayerSettings) -> Self {
        Self {
            current: None,
            queue: TrackQueue::new(settings.max_queue_size),
            loop_mode: LoopMode::None,
            volume: settings.default_volume.min(MAX_VOLUME),
            filters: None,
            autoplay: false,
            paused: false,
            loading: false,
            channel_id: None,
            self_deaf: false,
            self_mute: false,
            position: 0,
            position_at: Instant::now(),
            ping: -1,
            mode: ControllerMode::Stable,
            faulted: None,
            destroyed: false,
        }
    }

    fn status(&self) -> PlayerStatus {
        if self.loading {
            PlayerStatus::Loading
        } else if self.current.is_none() {
            PlayerStatus::Idle
        } else if self.paused {
            PlayerStatus::Paused
        } else {
            PlayerStatus::Playing
        }
    }

    fn is_playing(&self) -> bool {
        self.status() == PlayerStatus::Playing
    }

    fn set_position(&mut self, position: u64) {
        self.position = position;
        self.position_at = Instant::now();
    }

    /// Last reported position plus the time spent playing since.
    fn estimated_position(&self) -> u64 {
        let Some(track) = &self.current else {
            return 0;
        };

        let mut position = self.position;
        if self.is_playing() {
            position += self.position_at.elapsed().as_millis() as u64;
        }
        if !track.info.is_stream && track.info.length > 0 {
            position = position.min(track.info.length);
        }
        position
    }

    /// Takes the current track out if `data` is it, marking it as faulted.
    fn take_faulted(&mut self, data: &TrackData) -> Track {
        self.loading = false;
        self.faulted = Some(data.encoded.clone());
        match self.current.take() {
            Some(current) if current.matches(data) => current,
            other => {
                self.current = other;
                Track::from(data.clone())
            }
        }
    }
}

/// Per-guild playback state machine.
pub struct PlaybackController {
    guild_id: u64,
    link: RwLock<Arc<NodeLink>>,
    voice: VoiceSession,
    state: Mutex<PlaybackState>,
    services: Arc<Services>,
    gateway: Arc<dyn GatewaySender>,
    events: EventBus,
    inbox: mpsc::UnboundedSender<PlayerMessage>,
    shutdown: CancellationToken,
}

impl PlaybackController {
    pub fn new(
        guild_id: u64,
        link: Arc<NodeLink>,
        settings: &PlayerSettings,
        services: Arc<Services>,
        gateway: Arc<dyn GatewaySender>,
        events: EventBus,
    ) -> Arc<Self> {
        let (inbox, receiver) = mpsc::unbounded_channel();
        link.attach(guild_id, inbox.clone());

        let controller = Arc::new(Self {
            guild_id,
            link: RwLock::new(link),
            voice: VoiceSession::new(guild_id, settings.voice_timeout),
            state: Mutex::new(PlaybackState::new(settings)),
            services,
            gateway,
            events,
            inbox,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Self::run(
            Arc::downgrade(&controller),
            receiver,
            controller.shutdown.clone(),
        ));

        debug!("Player created for guild {} on {}", guild_id, controller.node_name());
        controller
    }

    async fn run(
        controller: Weak<Self>,
        mut inbox: mpsc::UnboundedReceiver<PlayerMessage>,
        shutdown: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = inbox.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let Some(controller) = controller.upgrade() else {
                break;
            };
            controller.handle_message(message).await;
        }
    }

    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    pub fn node(&self) -> Arc<NodeLink> {
        self.link.read().clone()
    }

    pub fn node_name(&self) -> String {
        self.link.read().name().to_string()
    }

    pub fn voice(&self) -> &VoiceSession {
        &self.voice
    }

    pub fn status(&self) -> PlayerStatus {
        self.state.lock().status()
    }

    pub fn mode(&self) -> ControllerMode {
        self.state.lock().mode
    }

    pub fn is_migrating(&self) -> bool {
        self.mode() == ControllerMode::Migrating
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    pub fn current(&self) -> Option<Track> {
        self.state.lock().current.clone()
    }

    pub fn queue(&self) -> Vec<Track> {
        self.state.lock().queue.to_vec()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn queue_duration(&self) -> Duration {
        self.state.lock().queue.total_duration()
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.state.lock().loop_mode
    }

    pub fn volume(&self) -> u16 {
        self.state.lock().volume
    }

    pub fn filters(&self) -> Option<Value> {
        self.state.lock().filters.clone()
    }

    pub fn autoplay(&self) -> bool {
        self.state.lock().autoplay
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn channel_id(&self) -> Option<u64> {
        self.state.lock().channel_id
    }

    /// Node-reported voice ping in milliseconds, `-1` when unknown.
    pub fn ping(&self) -> i64 {
        self.state.lock().ping
    }

    /// Estimated playback position of the current track.
    pub fn position(&self) -> Duration {
        Duration::from_millis(self.state.lock().estimated_position())
    }

    /// Joins `channel_id` through the gateway and waits until the node has
    /// accepted the resulting voice credentials.
    pub async fn connect(&self, channel_id: u64, self_deaf: bool, self_mute: bool) -> Result<()> {
        self.ensure_alive()?;
        {
            let mut state = self.state.lock();
            state.channel_id = Some(channel_id);
            state.self_deaf = self_deaf;
            state.self_mute = self_mute;
        }

        info!("🔊 Joining voice channel {} in guild {}", channel_id, self.guild_id);
        self.send_gateway(voice_state_command(self.guild_id, Some(channel_id), self_deaf, self_mute))?;

        self.voice.resolve().await?;
        Ok(())
    }

    /// Leaves the voice channel and drops the node-side player.
    pub async fn disconnect(&self) -> Result<()> {
        self.ensure_alive()?;
        {
            let mut state = self.state.lock();
            state.channel_id = None;
            state.current = None;
            state.loading = false;
            state.paused = false;
        }

        info!("👋 Leaving voice in guild {}", self.guild_id);
        self.send_gateway(voice_state_command(self.guild_id, None, false, false))?;

        if let Err(e) = self.node().destroy_player(self.guild_id).await {
            debug!("Guild {}: node-side player cleanup failed: {}", self.guild_id, e);
        }
        Ok(())
    }

    pub async fn on_voice_server_update(&self, endpoint: Option<String>, token: String) -> Result<()> {
        self.ensure_alive()?;
        let resume = self.voice.on_voice_server_update(endpoint, token);
        self.push_voice().await?;

        if resume && self.is_paused() {
            info!("▶️ Resuming guild {} after voice reconnect", self.guild_id);
            self.pause(false).await?;
        }
        Ok(())
    }

    pub async fn on_voice_state_update(
        &self,
        session_id: String,
        channel_id: Option<u64>,
        self_deaf: bool,
        self_mute: bool,
    ) -> Result<VoiceTransition> {
        self.ensure_alive()?;
        let transition = self
            .voice
            .on_voice_state_update(session_id, channel_id, self_deaf, self_mute);

        match transition {
            VoiceTransition::Terminated => {
                info!("👋 Voice session in guild {} ended externally", self.guild_id);
                self.destroy().await;
                return Ok(transition);
            }
            VoiceTransition::Moved { from, to } => {
                let was_playing = {
                    let mut state = self.state.lock();
                    state.channel_id = Some(to);
                    state.is_playing()
                };

                info!("🔀 Guild {} moved from channel {} to {}", self.guild_id, from, to);
                if was_playing {
                    self.voice.hold_until_server_update();
                    if let Err(e) = self.pause(true).await {
                        warn!("Guild {}: could not pause for channel move: {}", self.guild_id, e);
                    }
                }
            }
            VoiceTransition::Updated => {}
        }

        self.push_voice().await?;
        Ok(transition)
    }

    /// Sends the current credentials to the bound node unless it already
    /// has them. Returns how many pushes this call made.
    async fn push_voice(&self) -> Result<usize> {
        let guild_id = self.guild_id;
        self.voice
            .push_pending(|credentials| {
                let link = self.node();
                let update = UpdatePlayer {
                    voice: Some(credentials.payload()),
                    volume: Some(self.volume()),
                    ..Default::default()
                };
                async move { link.update_player(guild_id, &update, false).await }
            })
            .await
    }

    /// Reproduce la siguiente canción de la cola. Retorna `None` si la cola
    /// está vacía.
    pub async fn play(&self) -> Result<Option<Track>> {
        self.ensure_alive()?;
        if self.channel_id().is_none() {
            return Err(Error::NotConnected(self.guild_id));
        }
        self.push_voice().await?;
        self.voice.resolve().await?;

        let next = {
            let mut state = self.state.lock();
            let next = state.queue.next();
            state.loading = next.is_some();
            next
        };
        let Some(track) = next else {
            debug!("Guild {}: nothing queued", self.guild_id);
            return Ok(None);
        };

        let (track, encoded) = match self.prepare(track).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.state.lock().loading = false;
                return Err(e);
            }
        };

        let previous = {
            let mut state = self.state.lock();
            state.faulted = None;
            state.set_position(0);
            state.current.replace(track.clone())
        };

        let update = UpdatePlayer {
            track: Some(UpdatePlayerTrack::play(encoded, track.user_data.clone())),
            ..Default::default()
        };

        match self.send(&update).await {
            Ok(()) => {
                self.state.lock().loading = false;
                info!("🎵 Guild {} now playing: {}", self.guild_id, track.title());
                Ok(Some(track))
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.loading = false;
                state.current = previous;
                state.queue.push_front(track);
                Err(e)
            }
        }
    }

    /// Makes sure `track` has an encoding, resolving placeholders.
    async fn prepare(&self, track: Track) -> Result<(Track, String)> {
        let track = if track.is_placeholder() {
            self.resolve_placeholder(track).await?
        } else {
            track
        };

        let encoded = track
            .encoded
            .clone()
            .ok_or_else(|| Error::TrackResolution(format!("{} has no playable encoding", track.title())))?;
        Ok((track, encoded))
    }

    async fn resolve_placeholder(&self, track: Track) -> Result<Track> {
        let query = track.search_query();
        debug!("Guild {}: resolving placeholder {:?}", self.guild_id, query);

        let link = self.node();
        let mut resolved = self
            .services
            .resolver
            .resolve(&link, &query, track.requester)
            .await?
            .into_iter()
            .find(|candidate| !candidate.is_placeholder())
            .ok_or_else(|| Error::TrackResolution(format!("no playable match for {query}")))?;

        resolved.requester = track.requester;
        resolved.added_at = track.added_at;
        Ok(resolved)
    }

    /// Salta a la siguiente canción, o detiene si no hay más
    pub async fn skip(&self) -> Result<Option<Track>> {
        self.ensure_alive()?;
        let has_next = {
            let mut state = self.state.lock();
            if state.loop_mode == LoopMode::Queue {
                if let Some(current) = state.current.clone() {
                    state.queue.push_back(current);
                }
            }
            !state.queue.is_empty()
        };

        if has_next {
            self.play().await
        } else {
            self.stop().await?;
            Ok(None)
        }
    }

    /// Detiene la canción actual sin tocar la cola
    pub async fn stop(&self) -> Result<()> {
        self.ensure_alive()?;
        {
            let mut state = self.state.lock();
            state.current = None;
            state.loading = false;
            state.faulted = None;
        }

        self.send(&UpdatePlayer {
            track: Some(UpdatePlayerTrack::stop()),
            ..Default::default()
        })
        .await
    }

    pub async fn pause(&self, paused: bool) -> Result<()> {
        self.ensure_alive()?;
        self.send(&UpdatePlayer {
            paused: Some(paused),
            ..Default::default()
        })
        .await?;

        let mut state = self.state.lock();
        let position = state.estimated_position();
        state.paused = paused;
        state.set_position(position);
        Ok(())
    }

    pub async fn seek(&self, position: Duration) -> Result<()> {
        self.ensure_alive()?;
        if self.current().is_none() {
            debug!("Guild {}: seek with nothing playing", self.guild_id);
            return Ok(());
        }

        let position = position.as_millis() as u64;
        self.send(&UpdatePlayer {
            position: Some(position),
            ..Default::default()
        })
        .await?;
        self.state.lock().set_position(position);
        Ok(())
    }

    /// Ajusta el volumen, limitado a `0..=1000`
    pub async fn set_volume(&self, volume: u16) -> Result<()> {
        self.ensure_alive()?;
        let volume = volume.min(MAX_VOLUME);
        self.send(&UpdatePlayer {
            volume: Some(volume),
            ..Default::default()
        })
        .await?;
        self.state.lock().volume = volume;
        Ok(())
    }

    /// Forwards a filter payload to the node as-is.
    pub async fn set_filters(&self, filters: Value) -> Result<()> {
        self.ensure_alive()?;
        self.send(&UpdatePlayer {
            filters: Some(filters.clone()),
            ..Default::default()
        })
        .await?;
        self.state.lock().filters = Some(filters);
        Ok(())
    }

    pub fn set_loop_mode(&self, mode: LoopMode) {
        self.state.lock().loop_mode = mode;
    }

    pub fn set_autoplay(&self, enabled: bool) -> Result<()> {
        if enabled {
            self.services.autoplay.get()?;
        }
        self.state.lock().autoplay = enabled;
        Ok(())
    }

    /// Agrega una canción y retorna el nuevo largo de la cola
    pub fn enqueue(&self, track: Track) -> Result<usize> {
        let mut state = self.state.lock();
        state.queue.add(track)?;
        Ok(state.queue.len())
    }

    /// Appends as many tracks as fit; returns how many were added.
    pub fn enqueue_many(&self, tracks: impl IntoIterator<Item = Track>) -> usize {
        self.state.lock().queue.add_many(tracks)
    }

    pub fn remove_from_queue(&self, index: usize) -> Option<Track> {
        self.state.lock().queue.remove(index)
    }

    pub fn move_in_queue(&self, from: usize, to: usize) -> Result<()> {
        self.state.lock().queue.move_track(from, to)
    }

    pub fn clear_queue(&self) -> usize {
        self.state.lock().queue.clear()
    }

    pub fn shuffle_queue(&self) {
        self.state.lock().queue.shuffle();
    }

    /// Destruye el reproductor. Se puede llamar más de una vez.
    pub async fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.current = None;
            state.loading = false;
            state.queue.clear();
        }

        self.shutdown.cancel();
        let link = self.node();
        link.detach(self.guild_id);
        if let Err(e) = link.destroy_player(self.guild_id).await {
            debug!("Guild {}: node-side destroy failed: {}", self.guild_id, e);
        }

        info!("🗑️ Player destroyed for guild {}", self.guild_id);
        self.events.emit(CoordinatorEvent::PlayerDestroyed {
            guild_id: self.guild_id,
        });
    }

    pub(crate) async fn handle_message(&self, message: PlayerMessage) {
        if self.is_destroyed() {
            return;
        }

        match (self.mode(), message) {
            (ControllerMode::Migrating, message) => {
                debug!("Guild {} is migrating, dropping {:?}", self.guild_id, message);
            }
            (ControllerMode::Stable, PlayerMessage::State(state)) => self.on_player_state(state),
            (ControllerMode::Stable, PlayerMessage::Event(event)) => self.on_event(event).await,
            (ControllerMode::Stable, PlayerMessage::Restart) => {
                if let Err(e) = self.restart().await {
                    warn!("Guild {}: restart on {} failed: {}", self.guild_id, self.node_name(), e);
                }
            }
        }
    }

    fn on_player_state(&self, update: PlayerState) {
        let mut state = self.state.lock();
        state.set_position(update.position);
        state.ping = update.ping;
    }

    async fn on_event(&self, event: PlayerEvent) {
        match event {
            PlayerEvent::TrackStart { track } => self.on_track_start(track),
            PlayerEvent::TrackEnd { track, reason } => self.on_track_end(track, reason).await,
            PlayerEvent::TrackException { track, exception } => self.on_track_exception(track, exception),
            PlayerEvent::TrackStuck { track, threshold_ms } => self.on_track_stuck(track, threshold_ms).await,
            PlayerEvent::WebSocketClosed { code, reason, by_remote } => {
                self.on_socket_closed(code, reason, by_remote).await
            }
        }
    }

    fn on_track_start(&self, data: TrackData) {
        let track = {
            let mut state = self.state.lock();
            state.loading = false;
            match &state.current {
                Some(current) if current.matches(&data) => {
                    let current = current.clone();
                    state.set_position(0);
                    current
                }
                _ => Track::from(data),
            }
        };

        debug!("Guild {}: track started: {}", self.guild_id, track.title());
        self.events.emit(CoordinatorEvent::TrackStart {
            guild_id: self.guild_id,
            track,
        });
    }

    async fn on_track_end(&self, data: TrackData, reason: TrackEndReason) {
        let autoplay_available = self.services.autoplay.is_enabled();

        let (ended, action) = {
            let mut state = self.state.lock();
            let is_current = state.current.as_ref().is_some_and(|t| t.matches(&data));
            let ended = match &state.current {
                Some(current) if is_current => current.clone(),
                _ => Track::from(data.clone()),
            };

            if state.faulted.as_deref() == Some(data.encoded.as_str()) {
                state.faulted = None;
                (ended, EndAction::Nothing)
            } else if reason.is_superseded() {
                (ended, EndAction::Nothing)
            } else if !is_current {
                debug!("Guild {}: stale end event for {}", self.guild_id, ended.title());
                (ended, EndAction::Nothing)
            } else {
                state.current = None;
                let loop_mode = state.loop_mode;
                let autoplay = state.autoplay && autoplay_available;
                let action = decide_track_end(&mut state.queue, loop_mode, autoplay, &ended, &reason);
                (ended, action)
            }
        };

        debug!("Guild {}: {} ended ({}), {:?}", self.guild_id, ended.title(), reason, action);
        self.events.emit(CoordinatorEvent::TrackEnd {
            guild_id: self.guild_id,
            track: ended,
            reason,
        });

        match action {
            EndAction::Nothing => {}
            EndAction::PlayNext => {
                if let Err(e) = self.play().await {
                    warn!("Guild {}: could not start next track: {}", self.guild_id, e);
                }
            }
            EndAction::Autoplay(seed) => self.autoplay_from(seed).await,
            EndAction::QueueEnded => self.finish_queue(),
        }
    }

    async fn autoplay_from(&self, seed: Track) {
        let provider = match self.services.autoplay.get() {
            Ok(provider) => provider.clone(),
            Err(_) => return self.finish_queue(),
        };

        match provider.next_track(&seed).await {
            Ok(Some(track)) => {
                info!("🎲 Autoplay picked {} for guild {}", track.title(), self.guild_id);
                self.state.lock().queue.push_back(track);
                if let Err(e) = self.play().await {
                    warn!("Guild {}: autoplay track failed to start: {}", self.guild_id, e);
                }
            }
            Ok(None) => self.finish_queue(),
            Err(e) => {
                warn!("Guild {}: autoplay failed: {}", self.guild_id, e);
                self.finish_queue();
            }
        }
    }

    fn finish_queue(&self) {
        {
            let mut state = self.state.lock();
            state.current = None;
            state.loading = false;
        }

        info!("📭 Queue ended in guild {}", self.guild_id);
        self.events.emit(CoordinatorEvent::QueueEnd {
            guild_id: self.guild_id,
        });
    }

    fn on_track_exception(&self, data: TrackData, exception: TrackException) {
        let track = self.state.lock().take_faulted(&data);
        let message = exception.message.unwrap_or_else(|| exception.cause.clone());

        error!(
            "❌ Guild {}: {} failed ({}): {}",
            self.guild_id,
            track.title(),
            exception.severity,
            message
        );
        self.events.emit(CoordinatorEvent::TrackException {
            guild_id: self.guild_id,
            track,
            message,
            severity: exception.severity,
        });
    }

    async fn on_track_stuck(&self, data: TrackData, threshold_ms: u64) {
        let track = self.state.lock().take_faulted(&data);

        warn!(
            "⚠️ Guild {}: {} stuck for {}ms, stopping",
            self.guild_id,
            track.title(),
            threshold_ms
        );
        self.events.emit(CoordinatorEvent::TrackStuck {
            guild_id: self.guild_id,
            track,
            threshold_ms,
        });

        let stop = UpdatePlayer {
            track: Some(UpdatePlayerTrack::stop()),
            ..Default::default()
        };
        if let Err(e) = self.send(&stop).await {
            debug!("Guild {}: stop after stuck track failed: {}", self.guild_id, e);
        }
    }

    async fn on_socket_closed(&self, code: u16, reason: String, by_remote: bool) {
        let (was_playing, channel_id, self_deaf, self_mute) = {
            let state = self.state.lock();
            (state.is_playing(), state.channel_id, state.self_deaf, state.self_mute)
        };

        warn!(
            "🔇 Guild {}: voice socket closed ({}, by remote: {}): {}",
            self.guild_id, code, by_remote, reason
        );

        if RECOVERABLE_CLOSE_CODES.contains(&code) {
            if let Some(channel_id) = channel_id {
                if was_playing {
                    self.voice.hold_until_server_update();
                }
                let rejoin = voice_state_command(self.guild_id, Some(channel_id), self_deaf, self_mute);
                if let Err(e) = self.send_gateway(rejoin) {
                    warn!("Guild {}: rejoin after close {} failed: {}", self.guild_id, code, e);
                }
            }
        }

        if was_playing {
            if let Err(e) = self.pause(true).await {
                debug!("Guild {}: pause after voice close failed: {}", self.guild_id, e);
            }
        }

        self.events.emit(CoordinatorEvent::VoiceSocketClosed {
            guild_id: self.guild_id,
            code,
            reason,
            by_remote,
        });
    }

    /// Replays voice and the current track on a node that lost its session.
    async fn restart(&self) -> Result<()> {
        let snapshot = self.snapshot();
        info!("🔁 Guild {}: restarting playback on {}", self.guild_id, snapshot.source);
        self.replay_voice(&snapshot).await?;
        self.replay_playback(&snapshot).await
    }

    pub(crate) fn begin_migration(&self) -> Result<MigrationGuard<'_>> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(Error::PlayerDestroyed(self.guild_id));
        }
        if state.mode == ControllerMode::Migrating {
            return Err(Error::AlreadyMigrating(self.guild_id));
        }

        state.mode = ControllerMode::Migrating;
        Ok(MigrationGuard { controller: self })
    }

    pub(crate) fn snapshot(&self) -> MigrationTransaction {
        let state = self.state.lock();
        MigrationTransaction {
            guild_id: self.guild_id,
            source: self.node_name(),
            track: state.current.clone(),
            position: state.estimated_position(),
            volume: state.volume,
            paused: state.paused,
            filters: state.filters.clone(),
            voice: self.voice.credentials(),
        }
    }

    /// Swaps the bound node; returns the previous one.
    pub(crate) fn rebind(&self, link: Arc<NodeLink>) -> Arc<NodeLink> {
        let mut slot = self.link.write();
        let previous = std::mem::replace(&mut *slot, link);
        previous.detach(self.guild_id);
        slot.attach(self.guild_id, self.inbox.clone());
        previous
    }

    /// Re-sends voice credentials to the bound node and waits until it has
    /// accepted them. Does nothing when the snapshot was taken before voice
    /// was complete. Credentials that changed since the snapshot win.
    pub(crate) async fn replay_voice(&self, snapshot: &MigrationTransaction) -> Result<()> {
        self.voice.invalidate();
        let Some(captured) = &snapshot.voice else {
            debug!("Guild {}: no voice credentials to replay", self.guild_id);
            return Ok(());
        };
        if !self.voice.is_ready() {
            debug!(
                "Guild {}: voice session {} ended before replay",
                self.guild_id, captured.session_id
            );
            return Ok(());
        }

        if self.push_voice().await? == 0 && !self.voice.is_acknowledged() {
            self.voice.resolve().await?;
        }
        Ok(())
    }

    pub(crate) async fn replay_playback(&self, snapshot: &MigrationTransaction) -> Result<()> {
        let track = snapshot.track.as_ref().and_then(|track| {
            track
                .encoded
                .clone()
                .map(|encoded| UpdatePlayerTrack::play(encoded, track.user_data.clone()))
        });

        let update = UpdatePlayer {
            position: track.as_ref().map(|_| snapshot.position),
            track,
            volume: Some(snapshot.volume),
            paused: Some(snapshot.paused),
            filters: snapshot.filters.clone(),
            ..Default::default()
        };

        self.send(&update).await?;
        self.state.lock().set_position(snapshot.position);
        Ok(())
    }

    fn send_gateway(&self, payload: Value) -> Result<()> {
        self.gateway
            .send(self.guild_id, payload)
            .map_err(|e| Error::Gateway(e.to_string()))
    }

    async fn send(&self, update: &UpdatePlayer) -> Result<()> {
        let link = self.node();
        link.update_player(self.guild_id, update, false).await
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::PlayerDestroyed(self.guild_id));
        }
        Ok(())
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Keeps a controller in [`ControllerMode::Migrating`]; dropping it returns
/// the controller to [`ControllerMode::Stable`] whatever happened meanwhile.
pub(crate) struct MigrationGuard<'a> {
    controller: &'a PlaybackController,
}

impl Drop for MigrationGuard<'_> {
    fn drop(&mut self) {
        self.controller.state.lock().mode = ControllerMode::Stable;
        debug!("Guild {} migration finished", self.controller.guild_id);
    }
}
