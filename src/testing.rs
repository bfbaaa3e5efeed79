//! Test doubles shared by the unit tests of every module.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::Value;

use crate::audio::controller::{PlaybackController, PlayerSettings};
use crate::audio::track::Track;
use crate::collaborators::{GatewaySender, Services};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::node::{LinkSettings, NodeConfig, NodeLink, RestRequest, RestResponse, RestTransport};
use crate::protocol::{TrackData, TrackInfo};

struct Route {
    method: Option<Method>,
    prefix: String,
    status: u16,
    body: String,
    delay: Duration,
    fail: bool,
}

/// Scripted [`RestTransport`]: records every request and answers from the
/// most recently registered matching route, or `200 {}`.
#[derive(Default)]
pub(crate) struct MockTransport {
    requests: Mutex<Vec<RestRequest>>,
    routes: Mutex<Vec<Route>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, method: Method, prefix: &str, status: u16, body: impl Into<String>) {
        self.routes.lock().push(Route {
            method: Some(method),
            prefix: prefix.to_string(),
            status,
            body: body.into(),
            delay: Duration::ZERO,
            fail: false,
        });
    }

    pub fn delay(&self, prefix: &str, delay: Duration) {
        self.routes.lock().push(Route {
            method: None,
            prefix: prefix.to_string(),
            status: 200,
            body: "{}".to_string(),
            delay,
            fail: false,
        });
    }

    /// Makes matching requests fail before reaching the node.
    pub fn fail(&self, method: Method, prefix: &str) {
        self.routes.lock().push(Route {
            method: Some(method),
            prefix: prefix.to_string(),
            status: 0,
            body: String::new(),
            delay: Duration::ZERO,
            fail: true,
        });
    }

    pub fn requests(&self) -> Vec<RestRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_to(&self, method: Method, prefix: &str) -> Vec<RestRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Bodies of every player update, in order.
    pub fn player_updates(&self) -> Vec<Value> {
        self.requests_to(Method::PATCH, "/v4/sessions/")
            .into_iter()
            .filter(|r| r.path.contains("/players/"))
            .filter_map(|r| r.body)
            .collect()
    }

    pub fn clear(&self) {
        self.requests.lock().clear();
    }
}

#[async_trait]
impl RestTransport for MockTransport {
    async fn execute(&self, request: &RestRequest) -> Result<RestResponse> {
        self.requests.lock().push(request.clone());

        let (status, body, delay, fail) = {
            let routes = self.routes.lock();
            routes
                .iter()
                .rev()
                .find(|route| {
                    route.method.as_ref().map_or(true, |m| *m == request.method)
                        && request.path.starts_with(&route.prefix)
                })
                .map(|route| (route.status, route.body.clone(), route.delay, route.fail))
                .unwrap_or((200, "{}".to_string(), Duration::ZERO, false))
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(Error::NodeUnavailable(format!("scripted failure for {}", request.path)));
        }

        Ok(RestResponse { status, body })
    }
}

pub(crate) fn track_data(title: &str, length: u64) -> TrackData {
    TrackData {
        encoded: format!("enc-{title}"),
        info: TrackInfo {
            identifier: title.to_string(),
            title: title.to_string(),
            author: "tester".to_string(),
            length,
            source_name: "test".to_string(),
            ..Default::default()
        },
        plugin_info: Value::Null,
        user_data: Value::Null,
    }
}

pub(crate) fn track(title: &str, length: u64) -> Track {
    Track::new(track_data(title, length), Some(1))
}

pub(crate) fn node_config(name: &str) -> NodeConfig {
    NodeConfig {
        name: name.to_string(),
        host: format!("{name}.invalid"),
        port: 2333,
        password: "youshallnotpass".to_string(),
        secure: false,
        regions: Vec::new(),
    }
}

pub(crate) fn settings() -> LinkSettings {
    LinkSettings {
        user_id: 99,
        reconnect_delay: Duration::from_millis(10),
        reconnect_attempts: 1,
        ..Default::default()
    }
}

/// A link that has received `ready` but has no socket behind it.
pub(crate) fn ready_link(name: &str, transport: &Arc<MockTransport>, events: &EventBus) -> Arc<NodeLink> {
    let link = NodeLink::new(node_config(name), settings(), transport.clone(), events.clone());
    link.handle_text(&format!(r#"{{"op":"ready","resumed":false,"sessionId":"{name}-session"}}"#));
    link
}

/// Pushes a stats frame with the given playing-player count and no load.
pub(crate) fn push_players(link: &Arc<NodeLink>, playing: u64) {
    link.handle_text(&format!(
        r#"{{"op":"stats","players":{playing},"playingPlayers":{playing},"uptime":1,
            "memory":{{"free":0,"used":0,"allocated":0,"reservable":0}},
            "cpu":{{"cores":1,"systemLoad":0.0,"lavalinkLoad":0.0}}}}"#
    ));
}

/// A gateway that records every payload it is asked to send.
pub(crate) fn recording_gateway() -> (Arc<dyn GatewaySender>, Arc<Mutex<Vec<Value>>>) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let log = sent.clone();
    let gateway = move |_guild_id: u64, payload: Value| -> Result<()> {
        log.lock().push(payload);
        Ok(())
    };
    (Arc::new(gateway), sent)
}

/// A player for guild 1 bound to `link`, with a recording gateway.
pub(crate) fn controller(
    link: &Arc<NodeLink>,
    events: &EventBus,
    services: Services,
) -> (Arc<PlaybackController>, Arc<Mutex<Vec<Value>>>) {
    let (gateway, sent) = recording_gateway();
    let player = PlaybackController::new(
        1,
        link.clone(),
        &PlayerSettings {
            voice_timeout: Duration::from_millis(200),
            ..Default::default()
        },
        Arc::new(services),
        gateway,
        events.clone(),
    );
    (player, sent)
}

/// Delivers a full credential set and joins channel 10.
pub(crate) async fn connect_voice(player: &PlaybackController) {
    player
        .on_voice_state_update("voice-session".into(), Some(10), false, false)
        .await
        .unwrap();
    player
        .on_voice_server_update(Some("us-east1.discord.media:443".into()), "token".into())
        .await
        .unwrap();
    player.connect(10, false, false).await.unwrap();
    settle().await;
}

/// Lets spawned tasks run to completion.
pub(crate) async fn settle() {
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}
