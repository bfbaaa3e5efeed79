//! Ordered, rate-limited command channel to one node.
//!
//! Every control-plane call goes through a single FIFO drained by one task,
//! so calls complete in exactly the order they were submitted. No retries
//! happen here; callers decide.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::NodeConfig;
use crate::error::{Error, Result};
use crate::events::{CoordinatorEvent, EventBus};
use crate::protocol::{LoadResult, NodeInfo, Stats, TrackData, UpdatePlayer, UpdateSession};

#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestResponse {
    pub status: u16,
    pub body: String,
}

impl RestResponse {
    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Executes one request against a node. Status codes are returned as-is;
/// interpreting them is the channel's job.
#[async_trait]
pub trait RestTransport: Send + Sync {
    async fn execute(&self, request: &RestRequest) -> Result<RestResponse>;
}

/// [`RestTransport`] over a pooled reqwest client, so the underlying
/// connection is reused across calls.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    password: String,
}

impl HttpTransport {
    pub fn new(config: &NodeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self {
            client,
            base_url: config.rest_url(),
            password: config.password.clone(),
        })
    }
}

#[async_trait]
impl RestTransport for HttpTransport {
    async fn execute(&self, request: &RestRequest) -> Result<RestResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .header("Authorization", &self.password);

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        Ok(RestResponse { status, body })
    }
}

struct Pending {
    request: RestRequest,
    done: oneshot::Sender<Result<RestResponse>>,
}

pub struct CommandChannel {
    node: String,
    sender: mpsc::UnboundedSender<Pending>,
    calls: AtomicU64,
}

impl CommandChannel {
    /// Creates the channel and spawns its drain task on the current runtime.
    pub fn new(
        node: impl Into<String>,
        transport: Arc<dyn RestTransport>,
        min_interval: Duration,
        events: EventBus,
    ) -> Self {
        let node = node.into();
        let (sender, receiver) = mpsc::unbounded_channel();

        tokio::spawn(drain(node.clone(), transport, min_interval, events, receiver));

        Self {
            node,
            sender,
            calls: AtomicU64::new(0),
        }
    }

    /// Submits a request.
    ///
    /// The request is queued when this is called, not when the returned
    /// future is first polled. Dropping the future only abandons the wait.
    pub fn enqueue(
        &self,
        method: Method,
        path: impl Into<String>,
        body: Option<Value>,
    ) -> impl Future<Output = Result<RestResponse>> + Send + 'static {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let (done, result) = oneshot::channel();
        let request = RestRequest {
            method,
            path: path.into(),
            body,
        };
        let queued = self.sender.send(Pending { request, done }).is_ok();
        let node = self.node.clone();

        async move {
            if !queued {
                return Err(Error::ChannelClosed(node));
            }
            result.await.map_err(|_| Error::ChannelClosed(node))?
        }
    }

    /// Number of calls ever submitted; used for least-used ranking.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub async fn update_player(
        &self,
        session_id: &str,
        guild_id: u64,
        update: &UpdatePlayer,
        no_replace: bool,
    ) -> Result<()> {
        let path = format!(
            "/v4/sessions/{}/players/{}?noReplace={}",
            session_id, guild_id, no_replace
        );
        self.enqueue(Method::PATCH, path, Some(serde_json::to_value(update)?))
            .await?;
        Ok(())
    }

    /// Removes the player from the node. A player the node never had is not
    /// an error.
    pub async fn destroy_player(&self, session_id: &str, guild_id: u64) -> Result<()> {
        let path = format!("/v4/sessions/{}/players/{}", session_id, guild_id);
        self.enqueue(Method::DELETE, path, None).await?;
        Ok(())
    }

    pub async fn update_session(&self, session_id: &str, update: UpdateSession) -> Result<()> {
        let path = format!("/v4/sessions/{}", session_id);
        self.enqueue(Method::PATCH, path, Some(serde_json::to_value(update)?))
            .await?;
        Ok(())
    }

    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        let path = format!("/v4/loadtracks?identifier={}", urlencoding::encode(identifier));
        let response = self.enqueue(Method::GET, path, None).await?;

        if response.is_not_found() {
            return Ok(LoadResult::Empty);
        }
        response.json()
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<Option<TrackData>> {
        let path = format!("/v4/decodetrack?encodedTrack={}", urlencoding::encode(encoded));
        let response = self.enqueue(Method::GET, path, None).await?;

        if response.is_not_found() {
            return Ok(None);
        }
        response.json().map(Some)
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<TrackData>> {
        let response = self
            .enqueue(Method::POST, "/v4/decodetracks", Some(serde_json::to_value(encoded)?))
            .await?;
        response.json()
    }

    pub async fn info(&self) -> Result<NodeInfo> {
        self.enqueue(Method::GET, "/v4/info", None).await?.json()
    }

    pub async fn stats(&self) -> Result<Stats> {
        self.enqueue(Method::GET, "/v4/stats", None).await?.json()
    }
}

async fn drain(
    node: String,
    transport: Arc<dyn RestTransport>,
    min_interval: Duration,
    events: EventBus,
    mut receiver: mpsc::UnboundedReceiver<Pending>,
) {
    let mut last_sent: Option<Instant> = None;

    while let Some(Pending { request, done }) = receiver.recv().await {
        if let Some(last) = last_sent {
            let earliest = last + min_interval;
            if earliest > Instant::now() {
                tokio::time::sleep_until(earliest).await;
            }
        }

        let started = Instant::now();
        last_sent = Some(started);

        let result = transport
            .execute(&request)
            .await
            .and_then(|response| check_status(&node, &request, response));
        let elapsed = started.elapsed();

        let status = match &result {
            Ok(response) => Some(response.status),
            Err(Error::Transport { status, .. }) => Some(*status),
            Err(_) => None,
        };

        match &result {
            Ok(_) => debug!(
                "[{}] {} {} -> {:?} in {:?}",
                node, request.method, request.path, status, elapsed
            ),
            Err(e) => warn!("[{}] {} {} failed: {}", node, request.method, request.path, e),
        }

        events.emit(CoordinatorEvent::RequestCompleted {
            node: node.clone(),
            method: request.method.to_string(),
            path: request.path.clone(),
            status,
            elapsed,
        });

        // The caller may have stopped waiting; the call still happened.
        let _ = done.send(result);
    }

    debug!("[{}] Command channel closed", node);
}

fn check_status(node: &str, request: &RestRequest, response: RestResponse) -> Result<RestResponse> {
    if (200..300).contains(&response.status) || response.is_not_found() {
        return Ok(response);
    }

    Err(Error::Transport {
        node: node.to_string(),
        method: request.method.to_string(),
        path: request.path.clone(),
        status: response.status,
        body: response.body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use pretty_assertions::assert_eq;

    fn channel(transport: &Arc<MockTransport>, min_interval: Duration) -> CommandChannel {
        CommandChannel::new("test", transport.clone(), min_interval, EventBus::default())
    }

    #[tokio::test]
    async fn test_completion_order_matches_submission_order() {
        let transport = MockTransport::new();
        transport.delay("/slow", Duration::from_millis(80));
        let channel = channel(&transport, Duration::ZERO);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let slow = channel.enqueue(Method::GET, "/slow", None);
        let fast = channel.enqueue(Method::GET, "/fast", None);

        let tx_a = tx.clone();
        let a = tokio::spawn(async move {
            slow.await.unwrap();
            tx_a.send("A").unwrap();
        });
        let b = tokio::spawn(async move {
            fast.await.unwrap();
            tx.send("B").unwrap();
        });
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(rx.recv().await, Some("A"));
        assert_eq!(rx.recv().await, Some("B"));
        let paths: Vec<_> = transport.requests().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/slow", "/fast"]);
    }

    #[tokio::test]
    async fn test_not_found_is_a_result_and_errors_carry_status() {
        let transport = MockTransport::new();
        transport.respond(Method::GET, "/missing", 404, "");
        transport.respond(Method::GET, "/broken", 500, "boom");
        let channel = channel(&transport, Duration::ZERO);

        let missing = channel.enqueue(Method::GET, "/missing", None).await.unwrap();
        assert!(missing.is_not_found());

        match channel.enqueue(Method::GET, "/broken", None).await {
            Err(Error::Transport { status, body, .. }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected transport error, got {other:?}"),
        }
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_min_interval_spaces_requests() {
        let transport = MockTransport::new();
        let channel = channel(&transport, Duration::from_millis(40));

        let started = std::time::Instant::now();
        let first = channel.enqueue(Method::GET, "/a", None);
        let second = channel.enqueue(Method::GET, "/b", None);
        let third = channel.enqueue(Method::GET, "/c", None);
        first.await.unwrap();
        second.await.unwrap();
        third.await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(channel.calls(), 3);
    }

    #[tokio::test]
    async fn test_emits_event_per_completed_call() {
        let transport = MockTransport::new();
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let channel = CommandChannel::new("obs", transport.clone(), Duration::ZERO, events);

        channel.enqueue(Method::GET, "/v4/info", None).await.unwrap();

        match rx.recv().await.unwrap() {
            CoordinatorEvent::RequestCompleted { node, path, status, .. } => {
                assert_eq!(node, "obs");
                assert_eq!(path, "/v4/info");
                assert_eq!(status, Some(200));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_typed_calls_build_paths() {
        let transport = MockTransport::new();
        transport.respond(
            Method::GET,
            "/v4/loadtracks",
            200,
            r#"{"loadType":"track","data":{"encoded":"E","info":{"title":"t"}}}"#,
        );
        let channel = channel(&transport, Duration::ZERO);

        let result = channel.load_tracks("ytsearch:hello world").await.unwrap();
        assert!(matches!(result, LoadResult::Track(ref t) if t.encoded == "E"));

        channel
            .update_player("s1", 9, &UpdatePlayer { volume: Some(50), ..Default::default() }, true)
            .await
            .unwrap();
        channel.destroy_player("s1", 9).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests[0].path, "/v4/loadtracks?identifier=ytsearch%3Ahello%20world");
        assert_eq!(requests[1].method, Method::PATCH);
        assert_eq!(requests[1].path, "/v4/sessions/s1/players/9?noReplace=true");
        assert_eq!(requests[1].body, Some(serde_json::json!({"volume": 50})));
        assert_eq!(requests[2].method, Method::DELETE);
    }
}
