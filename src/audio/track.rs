use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::protocol::{TrackData, TrackInfo};

/// A track reference held by a player.
///
/// `encoded` is the node-specific blob. A track without one is a placeholder
/// produced by a metadata-only source; it is resolved right before it plays.
#[derive(Debug, Clone)]
pub struct Track {
    pub encoded: Option<String>,
    pub info: TrackInfo,
    pub requester: Option<u64>,
    pub user_data: Value,
    pub added_at: DateTime<Utc>,
}

impl Track {
    pub fn new(data: TrackData, requester: Option<u64>) -> Self {
        Self {
            encoded: Some(data.encoded),
            info: data.info,
            requester,
            user_data: data.user_data,
            added_at: Utc::now(),
        }
    }

    /// A metadata-only track that has to be resolved before playback.
    pub fn placeholder(title: impl Into<String>, author: impl Into<String>, requester: Option<u64>) -> Self {
        Self {
            encoded: None,
            info: TrackInfo {
                title: title.into(),
                author: author.into(),
                ..Default::default()
            },
            requester,
            user_data: Value::Null,
            added_at: Utc::now(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.encoded.is_none()
    }

    pub fn title(&self) -> &str {
        &self.info.title
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.info.length)
    }

    /// Query used to find a playable version of a placeholder.
    pub fn search_query(&self) -> String {
        match &self.info.uri {
            Some(uri) if self.info.author.is_empty() => uri.clone(),
            _ if self.info.author.is_empty() => self.info.title.clone(),
            _ => format!("{} - {}", self.info.author, self.info.title),
        }
    }

    /// Whether the node-side track `data` is this track.
    pub fn matches(&self, data: &TrackData) -> bool {
        self.encoded.as_deref() == Some(data.encoded.as_str())
    }
}

/// Equality only looks at what identifies the audio, never at who asked for it.
impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        match (&self.encoded, &other.encoded) {
            (Some(a), Some(b)) => a == b,
            (None, None) => {
                self.info.title == other.info.title
                    && self.info.author == other.info.author
                    && self.info.source_name == other.info.source_name
            }
            _ => false,
        }
    }
}

impl From<TrackData> for Track {
    fn from(data: TrackData) -> Self {
        Track::new(data, None)
    }
}

/// Why the node stopped playing a track.
///
/// Nodes and protocol versions disagree on spelling (`loadFailed`,
/// `LOAD_FAILED`, `loadfailed`), so parsing ignores case and underscores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
    Other(String),
}

impl TrackEndReason {
    pub fn parse(raw: &str) -> Self {
        let normalized: String = raw
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();

        match normalized.as_str() {
            "finished" => TrackEndReason::Finished,
            "loadfailed" => TrackEndReason::LoadFailed,
            "stopped" => TrackEndReason::Stopped,
            "replaced" => TrackEndReason::Replaced,
            "cleanup" => TrackEndReason::Cleanup,
            _ => TrackEndReason::Other(raw.to_string()),
        }
    }

    /// The track was superseded by an explicit command.
    pub fn is_superseded(&self) -> bool {
        matches!(self, TrackEndReason::Replaced | TrackEndReason::Stopped)
    }

    /// The track never played or was reaped; looping it would only fail again.
    pub fn is_failure(&self) -> bool {
        matches!(self, TrackEndReason::LoadFailed | TrackEndReason::Cleanup)
    }
}

impl fmt::Display for TrackEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackEndReason::Finished => f.write_str("finished"),
            TrackEndReason::LoadFailed => f.write_str("loadFailed"),
            TrackEndReason::Stopped => f.write_str("stopped"),
            TrackEndReason::Replaced => f.write_str("replaced"),
            TrackEndReason::Cleanup => f.write_str("cleanup"),
            TrackEndReason::Other(raw) => f.write_str(raw),
        }
    }
}

impl<'de> Deserialize<'de> for TrackEndReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(TrackEndReason::parse(&raw))
    }
}
