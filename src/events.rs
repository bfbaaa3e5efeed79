//! Observability and lifecycle events published by nodes and players.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::trace;

use crate::audio::track::{Track, TrackEndReason};

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    NodeConnected { node: String },
    NodeReady { node: String, session_id: String, resumed: bool },
    NodeDisconnected { node: String, code: Option<u16>, reason: String },
    NodeError { node: String, message: String },
    NodeReconnecting { node: String, attempt: u32 },
    NodeDestroyed { node: String },
    RequestCompleted {
        node: String,
        method: String,
        path: String,
        status: Option<u16>,
        elapsed: Duration,
    },
    TrackStart { guild_id: u64, track: Track },
    TrackEnd { guild_id: u64, track: Track, reason: TrackEndReason },
    TrackException { guild_id: u64, track: Track, message: String, severity: String },
    TrackStuck { guild_id: u64, track: Track, threshold_ms: u64 },
    QueueEnd { guild_id: u64 },
    VoiceSocketClosed { guild_id: u64, code: u16, reason: String, by_remote: bool },
    PlayerMoved { guild_id: u64, from: String, to: String },
    MigrationFailed { guild_id: u64, reason: String },
    PlayerDestroyed { guild_id: u64 },
}

/// Fan-out of [`CoordinatorEvent`]s to every subscriber.
///
/// Publishing never fails: with no subscribers the event is dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoordinatorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: CoordinatorEvent) {
        if self.sender.send(event).is_err() {
            trace!("No subscribers for coordinator event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
