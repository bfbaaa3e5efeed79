//! # Node Module
//!
//! Everything that talks to one remote audio node:
//!
//! - [`rest`] - the ordered, rate-limited command channel
//! - [`link`] - the event-stream connection, health and reconnection
//! - [`registry`] - read-side ranking over every link

pub mod link;
pub mod registry;
pub mod rest;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::link::{NodeLink, PlayerMessage};
pub use self::registry::NodeRegistry;
pub use self::rest::{CommandChannel, HttpTransport, RestRequest, RestResponse, RestTransport};

use crate::protocol::Stats;

/// Static description of one node, taken from configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NodeConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub password: String,
    #[serde(default)]
    pub secure: bool,
    /// Voice regions this node should preferably serve, e.g. `us-east`.
    #[serde(default)]
    pub regions: Vec<String>,
}

fn default_port() -> u16 {
    2333
}

impl NodeConfig {
    pub fn rest_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn websocket_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/v4/websocket", scheme, self.host, self.port)
    }

    pub fn serves_region(&self, region: &str) -> bool {
        self.regions.iter().any(|r| r.eq_ignore_ascii_case(region))
    }
}

/// Connection behaviour shared by every link.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub user_id: u64,
    pub client_name: String,
    pub reconnect_delay: Duration,
    pub reconnect_attempts: u32,
    pub rest_min_interval: Duration,
    pub resume_timeout: Duration,
    pub auto_resume: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            user_id: 0,
            client_name: concat!("open-music-link/", env!("CARGO_PKG_VERSION")).to_string(),
            reconnect_delay: Duration::from_secs(5),
            reconnect_attempts: 5,
            rest_min_interval: Duration::ZERO,
            resume_timeout: Duration::from_secs(60),
            auto_resume: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Disconnected,
    Connecting,
    Ready,
}

/// Latest stats push from a node together with its derived penalty.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStats {
    pub stats: Stats,
    pub penalty: u64,
    pub received_at: DateTime<Utc>,
}

impl NodeStats {
    pub fn new(stats: Stats) -> Self {
        Self {
            penalty: penalty(&stats),
            stats,
            received_at: Utc::now(),
        }
    }
}

/// Load heuristic used to rank nodes; lower is better.
///
/// `players + round(1.05^(100 * cpu) * 10 - 10) + deficit + 2 * nulled`
pub fn penalty(stats: &Stats) -> u64 {
    let players = stats.playing_players as f64;
    let cpu = (1.05f64.powf(100.0 * stats.cpu.system_load.max(0.0)) * 10.0 - 10.0).round();
    let (deficit, nulled) = stats
        .frame_stats
        .as_ref()
        .map(|frames| (frames.deficit.max(0) as f64, frames.nulled.max(0) as f64))
        .unwrap_or((0.0, 0.0));

    (players + cpu + deficit + 2.0 * nulled).max(0.0) as u64
}
