//! Serde model of the node protocol (v4) and of the one gateway command this
//! crate emits.
//!
//! Inbound websocket frames are decoded into [`IncomingMessage`], a tagged
//! union keyed by `op`; player events are further keyed by `type`. Unknown
//! frames fail to decode and are dropped by the caller with a warning.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::audio::track::TrackEndReason;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    Ready(Ready),
    Stats(Stats),
    PlayerUpdate(PlayerUpdate),
    Event(EventMessage),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    #[serde(default)]
    pub resumed: bool,
    pub session_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    #[serde(default)]
    pub players: u64,
    #[serde(default)]
    pub playing_players: u64,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub memory: Memory,
    #[serde(default)]
    pub cpu: Cpu,
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    pub guild_id: String,
    pub state: PlayerState,
}

/// Node-reported state of one player.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct PlayerState {
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub ping: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub guild_id: String,
    #[serde(flatten)]
    pub event: PlayerEvent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    #[serde(rename = "TrackStartEvent")]
    TrackStart { track: TrackData },
    #[serde(rename = "TrackEndEvent")]
    TrackEnd {
        track: TrackData,
        reason: TrackEndReason,
    },
    #[serde(rename = "TrackExceptionEvent")]
    TrackException {
        track: TrackData,
        exception: TrackException,
    },
    #[serde(rename = "TrackStuckEvent", rename_all = "camelCase")]
    TrackStuck { track: TrackData, threshold_ms: u64 },
    #[serde(rename = "WebSocketClosedEvent", rename_all = "camelCase")]
    WebSocketClosed {
        code: u16,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        by_remote: bool,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TrackException {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub cause: String,
}

/// A track as the node encodes it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackData {
    pub encoded: String,
    pub info: TrackInfo,
    #[serde(default)]
    pub plugin_info: Value,
    #[serde(default)]
    pub user_data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub is_seekable: bool,
    #[serde(default)]
    pub author: String,
    /// Length in milliseconds.
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub is_stream: bool,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default)]
    pub source_name: String,
}

/// Result of `GET /v4/loadtracks`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawLoadResult")]
pub enum LoadResult {
    Track(TrackData),
    Playlist(Playlist),
    Search(Vec<TrackData>),
    Empty,
    Error(TrackException),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub info: PlaylistInfo,
    #[serde(default)]
    pub plugin_info: Value,
    #[serde(default)]
    pub tracks: Vec<TrackData>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: String,
    #[serde(default = "no_selection")]
    pub selected_track: i64,
}

fn no_selection() -> i64 {
    -1
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLoadResult {
    load_type: String,
    #[serde(default)]
    data: Value,
}

impl TryFrom<RawLoadResult> for LoadResult {
    type Error = serde_json::Error;

    fn try_from(raw: RawLoadResult) -> std::result::Result<Self, serde_json::Error> {
        Ok(match raw.load_type.to_ascii_lowercase().as_str() {
            "track" => LoadResult::Track(serde_json::from_value(raw.data)?),
            "playlist" => LoadResult::Playlist(serde_json::from_value(raw.data)?),
            "search" => LoadResult::Search(serde_json::from_value(raw.data)?),
            "error" => LoadResult::Error(serde_json::from_value(raw.data)?),
            _ => LoadResult::Empty,
        })
    }
}

impl LoadResult {
    /// Flattens the result into an ordered candidate list.
    pub fn into_tracks(self) -> Result<Vec<TrackData>> {
        match self {
            LoadResult::Track(track) => Ok(vec![track]),
            LoadResult::Playlist(playlist) => Ok(playlist.tracks),
            LoadResult::Search(tracks) => Ok(tracks),
            LoadResult::Empty => Ok(Vec::new()),
            LoadResult::Error(exception) => Err(Error::LoadFailed(
                exception
                    .message
                    .unwrap_or_else(|| exception.cause.clone()),
            )),
        }
    }
}

/// Capability information from `GET /v4/info`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeInfo {
    pub version: NodeVersion,
    pub build_time: i64,
    pub jvm: String,
    pub lavaplayer: String,
    pub source_managers: Vec<String>,
    pub filters: Vec<String>,
    pub plugins: Vec<PluginInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NodeVersion {
    pub semver: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
}

/// Voice credentials in the shape the node expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoicePayload {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

/// Body of `PATCH /v4/sessions/{session}/players/{guild}`.
///
/// Every field is optional; absent fields leave the node's value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<UpdatePlayerTrack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoicePayload>,
}

/// `encoded: null` stops the player.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayerTrack {
    pub encoded: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub user_data: Value,
}

impl UpdatePlayerTrack {
    pub fn play(encoded: impl Into<String>, user_data: Value) -> Self {
        Self {
            encoded: Some(encoded.into()),
            user_data,
        }
    }

    pub fn stop() -> Self {
        Self {
            encoded: None,
            user_data: Value::Null,
        }
    }
}

/// Body of `PATCH /v4/sessions/{session}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpdateSession {
    pub resuming: bool,
    /// Resume window in seconds.
    pub timeout: u64,
}

/// Gateway opcode 4 (voice state update) for joining, moving or leaving.
pub fn voice_state_command(
    guild_id: u64,
    channel_id: Option<u64>,
    self_deaf: bool,
    self_mute: bool,
) -> Value {
    json!({
        "op": 4,
        "d": {
            "guild_id": guild_id.to_string(),
            "channel_id": channel_id.map(|id| id.to_string()),
            "self_deaf": self_deaf,
            "self_mute": self_mute,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decodes_ready_and_stats() {
        let ready: IncomingMessage =
            serde_json::from_str(r#"{"op":"ready","resumed":false,"sessionId":"abc"}"#).unwrap();
        assert!(matches!(ready, IncomingMessage::Ready(Ready { ref session_id, .. }) if session_id == "abc"));

        let stats: IncomingMessage = serde_json::from_str(
            r#"{"op":"stats","players":3,"playingPlayers":2,"uptime":10,
                "memory":{"free":1,"used":2,"allocated":3,"reservable":4},
                "cpu":{"cores":4,"systemLoad":0.5,"lavalinkLoad":0.1},
                "frameStats":{"sent":3000,"nulled":4,"deficit":7}}"#,
        )
        .unwrap();
        match stats {
            IncomingMessage::Stats(stats) => {
                assert_eq!(stats.playing_players, 2);
                assert_eq!(stats.frame_stats, Some(FrameStats { sent: 3000, nulled: 4, deficit: 7 }));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_decodes_track_end_event() {
        let message: IncomingMessage = serde_json::from_str(
            r#"{"op":"event","type":"TrackEndEvent","guildId":"42",
                "track":{"encoded":"QAAA","info":{"title":"Song","length":1000}},
                "reason":"loadFailed"}"#,
        )
        .unwrap();
        match message {
            IncomingMessage::Event(EventMessage { guild_id, event: PlayerEvent::TrackEnd { track, reason } }) => {
                assert_eq!(guild_id, "42");
                assert_eq!(track.encoded, "QAAA");
                assert_eq!(reason, TrackEndReason::LoadFailed);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_decodes_websocket_closed_event() {
        let message: IncomingMessage = serde_json::from_str(
            r#"{"op":"event","type":"WebSocketClosedEvent","guildId":"7","code":4006,"reason":"Session is no longer valid.","byRemote":true}"#,
        )
        .unwrap();
        assert!(matches!(
            message,
            IncomingMessage::Event(EventMessage { event: PlayerEvent::WebSocketClosed { code: 4006, by_remote: true, .. }, .. })
        ));
    }

    #[test]
    fn test_load_result_variants() {
        let empty: LoadResult = serde_json::from_str(r#"{"loadType":"empty","data":{}}"#).unwrap();
        assert_eq!(empty, LoadResult::Empty);
        assert!(empty.into_tracks().unwrap().is_empty());

        let search: LoadResult = serde_json::from_str(
            r#"{"loadType":"search","data":[{"encoded":"A","info":{"title":"a"}},{"encoded":"B","info":{"title":"b"}}]}"#,
        )
        .unwrap();
        let tracks = search.into_tracks().unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[1].encoded, "B");

        let error: LoadResult = serde_json::from_str(
            r#"{"loadType":"error","data":{"message":"nope","severity":"common","cause":"x"}}"#,
        )
        .unwrap();
        assert!(matches!(error.into_tracks(), Err(Error::LoadFailed(msg)) if msg == "nope"));
    }

    #[test]
    fn test_load_result_single_track_and_unknown_type() {
        let single: LoadResult =
            serde_json::from_str(r#"{"loadType":"TRACK","data":{"encoded":"T","info":{"title":"t"}}}"#).unwrap();
        assert!(matches!(single, LoadResult::Track(ref track) if track.encoded == "T"));

        let unknown: LoadResult = serde_json::from_str(r#"{"loadType":"somethingNew","data":null}"#).unwrap();
        assert_eq!(unknown, LoadResult::Empty);
    }

    #[test]
    fn test_update_player_serialization_skips_absent_fields() {
        let stop = UpdatePlayer {
            track: Some(UpdatePlayerTrack::stop()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&stop).unwrap(), json!({"track": {"encoded": null}}));

        let voice = UpdatePlayer {
            voice: Some(VoicePayload {
                token: "t".into(),
                endpoint: "e".into(),
                session_id: "s".into(),
            }),
            volume: Some(80),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&voice).unwrap(),
            json!({"volume": 80, "voice": {"token": "t", "endpoint": "e", "sessionId": "s"}})
        );
    }

    #[test]
    fn test_voice_state_command_shape() {
        assert_eq!(
            voice_state_command(1, Some(2), true, false),
            json!({"op": 4, "d": {"guild_id": "1", "channel_id": "2", "self_deaf": true, "self_mute": false}})
        );
        assert_eq!(voice_state_command(1, None, false, false)["d"]["channel_id"], Value::Null);
    }
}
