//! # Migration
//!
//! Moves a live player from one node to another. The player's state is
//! captured before it leaves the source node and replayed on the
//! destination, voice first and playback second.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::controller::PlaybackController;
use super::track::Track;
use super::voice::VoiceCredentials;
use crate::error::{Error, Result};
use crate::events::{CoordinatorEvent, EventBus};
use crate::node::{NodeLink, NodeRegistry};

/// Everything needed to rebuild a player on another node.
#[derive(Debug, Clone)]
pub struct MigrationTransaction {
    pub guild_id: u64,
    /// Node the snapshot was taken on.
    pub source: String,
    pub track: Option<Track>,
    /// Milliseconds into `track`.
    pub position: u64,
    pub volume: u16,
    pub paused: bool,
    pub filters: Option<Value>,
    pub voice: Option<VoiceCredentials>,
}

/// Picks where a player goes when no destination is given.
pub trait MigrationStrategy: Send + Sync {
    fn select(&self, registry: &NodeRegistry, current: &NodeLink) -> Option<Arc<NodeLink>>;
}

/// The ready node with the lowest penalty that is not the current one.
#[derive(Debug, Default, Clone, Copy)]
pub struct LowestPenalty;

impl MigrationStrategy for LowestPenalty {
    fn select(&self, registry: &NodeRegistry, current: &NodeLink) -> Option<Arc<NodeLink>> {
        registry
            .best()
            .into_iter()
            .find(|link| link.name() != current.name())
    }
}

/// Outcome of moving several players at once.
#[derive(Debug, Default)]
pub struct MigrationReport {
    pub moved: Vec<u64>,
    pub failed: Vec<(u64, Error)>,
}

impl MigrationReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct MigrationCoordinator {
    strategy: Box<dyn MigrationStrategy>,
    events: EventBus,
}

impl MigrationCoordinator {
    pub fn new(events: EventBus) -> Self {
        Self::with_strategy(LowestPenalty, events)
    }

    pub fn with_strategy(strategy: impl MigrationStrategy + 'static, events: EventBus) -> Self {
        Self {
            strategy: Box::new(strategy),
            events,
        }
    }

    /// Moves `controller` to `destination`, or to the node the strategy
    /// picks when none is given.
    pub async fn migrate(
        &self,
        registry: &NodeRegistry,
        controller: &PlaybackController,
        destination: Option<Arc<NodeLink>>,
    ) -> Result<()> {
        let destination = match destination {
            Some(destination) => destination,
            None => self
                .strategy
                .select(registry, &controller.node())
                .ok_or_else(|| {
                    Error::NodeUnavailable(format!("no node to move guild {} to", controller.guild_id()))
                })?,
        };

        let result = self.move_to(controller, destination).await;
        if let Err(e) = &result {
            self.events.emit(CoordinatorEvent::MigrationFailed {
                guild_id: controller.guild_id(),
                reason: e.to_string(),
            });
        }
        result
    }

    /// The migration protocol itself. Event processing for the guild is
    /// suspended for the whole call and resumes however it ends.
    pub async fn move_to(&self, controller: &PlaybackController, destination: Arc<NodeLink>) -> Result<()> {
        let guild_id = controller.guild_id();
        let source = controller.node();

        if source.name() == destination.name() {
            debug!("Guild {} is already on {}", guild_id, destination.name());
            return Ok(());
        }

        let _migrating = controller.begin_migration()?;
        let snapshot = controller.snapshot();

        if !destination.is_ready() {
            return Err(Error::NodeUnavailable(format!("{} is not ready", destination.name())));
        }

        info!(
            "🚚 Moving guild {} from {} to {}",
            guild_id,
            source.name(),
            destination.name()
        );

        if let Err(e) = source.destroy_player(guild_id).await {
            debug!("Guild {}: teardown on {} skipped: {}", guild_id, source.name(), e);
        }

        controller.rebind(destination.clone());

        let replayed = async {
            controller.replay_voice(&snapshot).await?;
            controller.replay_playback(&snapshot).await
        }
        .await;

        if let Err(e) = replayed {
            warn!("Guild {}: replay on {} failed: {}", guild_id, destination.name(), e);
            return Err(Error::MigrationFailure {
                guild_id,
                source: Box::new(e),
            });
        }

        self.events.emit(CoordinatorEvent::PlayerMoved {
            guild_id,
            from: source.name().to_string(),
            to: destination.name().to_string(),
        });
        Ok(())
    }

    /// Moves every given player, each independently of the others.
    pub async fn move_all(
        &self,
        registry: &NodeRegistry,
        controllers: Vec<Arc<PlaybackController>>,
    ) -> MigrationReport {
        let results = join_all(controllers.iter().map(|controller| async move {
            (controller.guild_id(), self.migrate(registry, controller, None).await)
        }))
        .await;

        let mut report = MigrationReport::default();
        for (guild_id, result) in results {
            match result {
                Ok(()) => report.moved.push(guild_id),
                Err(e) => report.failed.push((guild_id, e)),
            }
        }

        info!(
            "🚚 Migration finished: {} moved, {} failed",
            report.moved.len(),
            report.failed.len()
        );
        report
    }
}
