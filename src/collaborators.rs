//! Seams to code this crate does not own: the chat gateway, track lookup and
//! autoplay recommendations.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::audio::track::Track;
use crate::error::{Error, Result};
use crate::node::NodeLink;

/// Sends a raw gateway payload (opcode 4) for a guild's shard.
#[cfg_attr(test, mockall::automock)]
pub trait GatewaySender: Send + Sync {
    fn send(&self, guild_id: u64, payload: Value) -> Result<()>;
}

impl<F> GatewaySender for F
where
    F: Fn(u64, Value) -> Result<()> + Send + Sync,
{
    fn send(&self, guild_id: u64, payload: Value) -> Result<()> {
        self(guild_id, payload)
    }
}

/// Turns a free-text query into ordered candidate tracks.
#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn resolve(&self, node: &NodeLink, query: &str, requester: Option<u64>) -> Result<Vec<Track>>;
}

/// Picks something to play once the queue runs dry.
#[async_trait]
pub trait AutoplayProvider: Send + Sync {
    async fn next_track(&self, seed: &Track) -> Result<Option<Track>>;
}

/// Default resolver: asks the node itself, searching with a source prefix
/// unless the query is already a URL.
pub struct NodeSearchResolver {
    prefix: String,
}

impl NodeSearchResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn identifier(&self, query: &str) -> String {
        let is_link = url::Url::parse(query.trim()).is_ok_and(|url| matches!(url.scheme(), "http" | "https"));
        if is_link || self.prefix.is_empty() {
            query.to_string()
        } else {
            format!("{}:{}", self.prefix, query)
        }
    }
}

#[async_trait]
impl TrackResolver for NodeSearchResolver {
    async fn resolve(&self, node: &NodeLink, query: &str, requester: Option<u64>) -> Result<Vec<Track>> {
        let tracks = node.load_tracks(&self.identifier(query)).await?.into_tracks()?;
        Ok(tracks.into_iter().map(|data| Track::new(data, requester)).collect())
    }
}

/// A feature that may be switched off.
///
/// Call sites check for the capability explicitly instead of reaching for an
/// object that fails on use.
pub enum Capability<T> {
    Enabled(T),
    Disabled { feature: &'static str },
}

impl<T> Capability<T> {
    pub fn disabled(feature: &'static str) -> Self {
        Capability::Disabled { feature }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Capability::Enabled(_))
    }

    pub fn get(&self) -> Result<&T> {
        match self {
            Capability::Enabled(value) => Ok(value),
            Capability::Disabled { feature } => Err(Error::FeatureDisabled(feature)),
        }
    }
}

/// Collaborators shared by every player.
pub struct Services {
    pub resolver: Arc<dyn TrackResolver>,
    pub autoplay: Capability<Arc<dyn AutoplayProvider>>,
}

impl Services {
    pub fn new(search_prefix: &str) -> Self {
        Self {
            resolver: Arc::new(NodeSearchResolver::new(search_prefix)),
            autoplay: Capability::disabled("autoplay"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_identifier() {
        let resolver = NodeSearchResolver::new("ytsearch");
        assert_eq!(resolver.identifier("never gonna"), "ytsearch:never gonna");
        assert_eq!(
            resolver.identifier("https://example.com/a.mp3"),
            "https://example.com/a.mp3"
        );
        assert_eq!(resolver.identifier("artist: song"), "ytsearch:artist: song");
        assert_eq!(NodeSearchResolver::new("").identifier("raw"), "raw");
    }

    #[test]
    fn test_capability_reports_disabled_feature() {
        let disabled: Capability<u8> = Capability::disabled("autoplay");
        assert!(!disabled.is_enabled());
        assert!(matches!(disabled.get(), Err(Error::FeatureDisabled("autoplay"))));
        assert_eq!(*Capability::Enabled(3u8).get().unwrap(), 3);
    }

    #[test]
    fn test_closures_are_gateway_senders() {
        let sender = |guild_id: u64, payload: Value| -> Result<()> {
            assert_eq!(guild_id, 5);
            assert_eq!(payload["op"], 4);
            Ok(())
        };
        sender.send(5, serde_json::json!({"op": 4})).unwrap();
    }
}
