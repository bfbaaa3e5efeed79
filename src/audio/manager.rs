//! # Coordinator
//!
//! Top-level entry point: owns the node registry and one
//! [`PlaybackController`] per guild, routes gateway voice updates to the
//! right player and applies the failover policy when a node is lost.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::controller::PlaybackController;
use super::migration::{LowestPenalty, MigrationCoordinator, MigrationReport, MigrationStrategy};
use super::track::Track;
use super::voice::VoiceTransition;
use crate::collaborators::{GatewaySender, Services};
use crate::config::{Config, FailoverPolicy};
use crate::error::{Error, Result};
use crate::events::{CoordinatorEvent, EventBus};
use crate::node::{NodeConfig, NodeLink, NodeRegistry};

/// Gateway `VOICE_SERVER_UPDATE` for one guild.
#[derive(Debug, Clone)]
pub struct VoiceServerUpdate {
    pub guild_id: u64,
    pub endpoint: Option<String>,
    pub token: String,
}

/// Gateway `VOICE_STATE_UPDATE` for one member.
#[derive(Debug, Clone)]
pub struct VoiceStateUpdate {
    pub guild_id: u64,
    pub user_id: u64,
    pub session_id: String,
    pub channel_id: Option<u64>,
    pub self_deaf: bool,
    pub self_mute: bool,
}

pub struct Coordinator {
    config: Config,
    registry: NodeRegistry,
    players: DashMap<u64, Arc<PlaybackController>>,
    services: Arc<Services>,
    gateway: Arc<dyn GatewaySender>,
    events: EventBus,
    migration: MigrationCoordinator,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(config: Config, services: Services, gateway: Arc<dyn GatewaySender>) -> Arc<Self> {
        Self::with_strategy(config, services, gateway, LowestPenalty)
    }

    /// Like [`Coordinator::new`] with a custom migration destination strategy.
    pub fn with_strategy(
        config: Config,
        services: Services,
        gateway: Arc<dyn GatewaySender>,
        strategy: impl MigrationStrategy + 'static,
    ) -> Arc<Self> {
        let events = EventBus::default();
        let watch = events.subscribe();

        let coordinator = Arc::new(Self {
            config,
            registry: NodeRegistry::new(),
            players: DashMap::new(),
            services: Arc::new(services),
            gateway,
            migration: MigrationCoordinator::with_strategy(strategy, events.clone()),
            events,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Self::watch_failover(
            Arc::downgrade(&coordinator),
            watch,
            coordinator.shutdown.clone(),
        ));

        coordinator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Registra un nodo con transporte HTTP, todavía sin conectar
    pub fn add_node(&self, node: NodeConfig) -> Result<Arc<NodeLink>> {
        let link = NodeLink::with_http(node, self.config.link_settings(), self.events.clone())?;
        self.registry.insert(link.clone())?;
        info!("➕ Node {} registered", link.name());
        Ok(link)
    }

    /// Registers an already built link.
    pub fn add_link(&self, link: Arc<NodeLink>) -> Result<()> {
        self.registry.insert(link)
    }

    /// Registers every node from the configuration.
    pub fn add_configured_nodes(&self) -> Result<()> {
        for node in self.config.nodes.clone() {
            self.add_node(node)?;
        }
        Ok(())
    }

    /// Conecta todos los nodos registrados en paralelo
    pub async fn connect_all(&self) -> Vec<(String, Result<()>)> {
        let links = self.registry.all();
        join_all(links.iter().map(|link| async move {
            (link.name().to_string(), link.connect().await)
        }))
        .await
    }

    /// Crea el reproductor del servidor en el mejor nodo, priorizando los
    /// nodos que sirven `region`.
    pub fn create_player(&self, guild_id: u64, region: Option<&str>) -> Result<Arc<PlaybackController>> {
        match self.players.entry(guild_id) {
            Entry::Occupied(_) => Err(Error::PlayerExists(guild_id)),
            Entry::Vacant(slot) => {
                let link = self.registry.select(region)?;
                info!("🎛️ Creating player for guild {} on {}", guild_id, link.name());

                let player = PlaybackController::new(
                    guild_id,
                    link,
                    &self.config.player_settings(),
                    self.services.clone(),
                    self.gateway.clone(),
                    self.events.clone(),
                );
                slot.insert(player.clone());
                Ok(player)
            }
        }
    }

    pub fn player(&self, guild_id: u64) -> Option<Arc<PlaybackController>> {
        self.players.get(&guild_id).map(|entry| entry.value().clone())
    }

    pub fn players(&self) -> Vec<Arc<PlaybackController>> {
        self.players.iter().map(|entry| entry.value().clone()).collect()
    }

    pub async fn destroy_player(&self, guild_id: u64) -> Result<()> {
        let (_, player) = self
            .players
            .remove(&guild_id)
            .ok_or(Error::PlayerNotFound(guild_id))?;
        player.destroy().await;
        Ok(())
    }

    /// Busca canciones en el mejor nodo disponible
    pub async fn search(&self, query: &str, requester: Option<u64>) -> Result<Vec<Track>> {
        let link = self.registry.select(None)?;
        debug!("Searching {:?} on {}", query, link.name());
        self.services.resolver.resolve(&link, query, requester).await
    }

    pub async fn handle_voice_server_update(&self, update: VoiceServerUpdate) -> Result<()> {
        let Some(player) = self.player(update.guild_id) else {
            trace!("Voice server update for guild {} without a player", update.guild_id);
            return Ok(());
        };

        player.on_voice_server_update(update.endpoint, update.token).await
    }

    /// Routes the bot's own voice-state updates; everyone else's are ignored.
    pub async fn handle_voice_state_update(&self, update: VoiceStateUpdate) -> Result<()> {
        if update.user_id != self.config.bot_user_id {
            return Ok(());
        }
        let Some(player) = self.player(update.guild_id) else {
            trace!("Voice state update for guild {} without a player", update.guild_id);
            return Ok(());
        };

        let transition = player
            .on_voice_state_update(update.session_id, update.channel_id, update.self_deaf, update.self_mute)
            .await?;

        if transition == VoiceTransition::Terminated {
            self.players.remove(&update.guild_id);
        }
        Ok(())
    }

    /// Moves one player to the named node, or wherever the strategy picks.
    pub async fn move_player(&self, guild_id: u64, destination: Option<&str>) -> Result<()> {
        let player = self.player(guild_id).ok_or(Error::PlayerNotFound(guild_id))?;
        let destination = match destination {
            Some(name) => Some(
                self.registry
                    .get(name)
                    .ok_or_else(|| Error::NodeUnavailable(format!("unknown node {name}")))?,
            ),
            None => None,
        };

        self.migration.migrate(&self.registry, &player, destination).await
    }

    /// Mueve todos los reproductores fuera de `node`
    pub async fn move_node(&self, node: &str) -> MigrationReport {
        let stranded = self.players_on(node);
        info!("🚚 Moving {} players off {}", stranded.len(), node);
        self.migration.move_all(&self.registry, stranded).await
    }

    fn players_on(&self, node: &str) -> Vec<Arc<PlaybackController>> {
        self.players
            .iter()
            .filter(|entry| entry.value().node_name() == node)
            .map(|entry| entry.value().clone())
            .collect()
    }

    async fn watch_failover(
        coordinator: Weak<Self>,
        mut events: broadcast::Receiver<CoordinatorEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(CoordinatorEvent::NodeDestroyed { node }) => {
                    let Some(coordinator) = coordinator.upgrade() else {
                        break;
                    };
                    coordinator.on_node_lost(&node).await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!("Failover watch missed {} events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn on_node_lost(&self, node: &str) {
        self.registry.remove(node);
        let stranded = self.players_on(node);
        if stranded.is_empty() {
            return;
        }

        match self.config.failover {
            FailoverPolicy::None => {
                warn!(
                    "⚠️ Node {} is gone with {} players still bound; failover is disabled",
                    node,
                    stranded.len()
                );
            }
            FailoverPolicy::Migrate => {
                let report = self.migration.move_all(&self.registry, stranded).await;
                for (guild_id, e) in &report.failed {
                    warn!("Guild {} could not be moved off {}: {}", guild_id, node, e);
                }
            }
            FailoverPolicy::Destroy => {
                for player in stranded {
                    self.players.remove(&player.guild_id());
                    player.destroy().await;
                }
            }
        }
    }

    /// Destruye todos los reproductores y cierra los nodos
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down coordinator");
        self.shutdown.cancel();

        let players: Vec<_> = self.players.iter().map(|entry| entry.value().clone()).collect();
        self.players.clear();
        join_all(players.iter().map(|player| player.destroy())).await;

        for link in self.registry.all() {
            link.destroy();
        }
    }
}
