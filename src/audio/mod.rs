//! # Audio Module
//!
//! Per-guild playback on top of the node layer.
//!
//! ## Architecture
//!
//! ### [`voice`] - Voice Session
//! - Collects the voice credentials the chat gateway hands out in pieces
//! - Pushes each complete set to the node exactly once
//! - Gates `connect` until the node has accepted them
//!
//! ### [`controller`] - Playback Controller
//! - Owns the current track, the queue and the loop/volume/filter state
//! - Reacts to track events from the node (advance, loop, autoplay, stop)
//! - Suspends event handling while it is being migrated
//!
//! ### [`queue`] / [`track`] - Queue Management
//! - Bounded FIFO with shuffle, move and loop modes
//! - Tracks carry the node's encoded form and the requester
//!
//! ### [`migration`] - Node Migration
//! - Snapshots a player, rebinds it to another node and replays the state
//!
//! ### [`manager`] - Coordinator
//! - One entry point owning nodes and players, routing gateway updates and
//!   applying the failover policy when a node goes away

pub mod controller;
pub mod manager;
pub mod migration;
pub mod queue;
pub mod track;
pub mod voice;

pub use self::controller::{PlaybackController, PlayerSettings, PlayerStatus};
pub use self::manager::{Coordinator, VoiceServerUpdate, VoiceStateUpdate};
pub use self::migration::{MigrationCoordinator, MigrationStrategy, MigrationTransaction};
pub use self::queue::{LoopMode, TrackQueue};
pub use self::track::{Track, TrackEndReason};
pub use self::voice::{VoiceCredentials, VoiceSession, VoiceTransition};
