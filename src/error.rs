use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// What a [`VoiceSession`] was still waiting for when its readiness gate
/// timed out.
///
/// [`VoiceSession`]: crate::audio::voice::VoiceSession
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    /// Endpoint, token or session id never arrived from the chat platform.
    PlatformCredentials,
    /// The credentials were complete but the node never acknowledged the push.
    NodeAcknowledgement,
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitCondition::PlatformCredentials => f.write_str("voice credentials from the gateway"),
            WaitCondition::NodeAcknowledgement => f.write_str("the node to accept the voice update"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("node {node} answered {status} to {method} {path}: {body}")]
    Transport {
        node: String,
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("guild {guild_id}: timed out after {timeout:?} waiting for {waiting_for}")]
    ConnectionTimeout {
        guild_id: u64,
        waiting_for: WaitCondition,
        timeout: Duration,
    },

    #[error("no connected node available: {0}")]
    NodeUnavailable(String),

    #[error("migration of guild {guild_id} failed: {source}")]
    MigrationFailure {
        guild_id: u64,
        #[source]
        source: Box<Error>,
    },

    #[error("guild {0} is already being migrated")]
    AlreadyMigrating(u64),

    #[error("gateway rejected voice command: {0}")]
    Gateway(String),

    #[error("guild {0} is not connected to a voice channel")]
    NotConnected(u64),

    #[error("a player already exists for guild {0}")]
    PlayerExists(u64),

    #[error("no player exists for guild {0}")]
    PlayerNotFound(u64),

    #[error("the player for guild {0} was destroyed")]
    PlayerDestroyed(u64),

    #[error("queue is full (max {0} tracks)")]
    QueueFull(usize),

    #[error("feature disabled: {0}")]
    FeatureDisabled(&'static str),

    #[error("could not resolve track: {0}")]
    TrackResolution(String),

    #[error("node failed to load tracks: {0}")]
    LoadFailed(String),

    #[error("command channel of node {0} is closed")]
    ChannelClosed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether this is a timeout of the voice readiness gate.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ConnectionTimeout { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
