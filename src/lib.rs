//! # Open Music Link
//!
//! Client-side coordinator for a pool of Lavalink-style audio nodes.
//!
//! The host bot forwards its gateway voice events to a [`Coordinator`] and
//! drives playback through the per-guild [`PlaybackController`]s it hands
//! out. Node selection, voice credential hand-off, track-end handling,
//! reconnection and moving players between nodes happen here.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use open_music_link::{Config, Coordinator, Services};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let gateway = |guild_id: u64, payload: serde_json::Value| -> open_music_link::Result<()> {
//!     println!("send to shard of {guild_id}: {payload}");
//!     Ok(())
//! };
//!
//! let coordinator = Coordinator::new(config.clone(), Services::new(&config.search_prefix), Arc::new(gateway));
//! coordinator.add_configured_nodes()?;
//! coordinator.connect_all().await;
//!
//! let player = coordinator.create_player(123, None)?;
//! for track in coordinator.search("never gonna give you up", None).await?.into_iter().take(1) {
//!     player.enqueue(track)?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod node;
pub mod protocol;

#[cfg(test)]
mod testing;

pub use crate::audio::{Coordinator, LoopMode, PlaybackController, Track, VoiceServerUpdate, VoiceStateUpdate};
pub use crate::collaborators::{AutoplayProvider, Capability, GatewaySender, Services, TrackResolver};
pub use crate::config::{Config, FailoverPolicy};
pub use crate::error::{Error, Result};
pub use crate::events::{CoordinatorEvent, EventBus};
pub use crate::node::{NodeConfig, NodeLink, NodeRegistry};
