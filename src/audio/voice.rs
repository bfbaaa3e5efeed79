use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::{Error, Result, WaitCondition};
use crate::protocol::VoicePayload;

/// A complete set of voice credentials for one guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceCredentials {
    pub endpoint: String,
    pub token: String,
    pub session_id: String,
}

impl VoiceCredentials {
    pub fn payload(&self) -> VoicePayload {
        VoicePayload {
            token: self.token.clone(),
            endpoint: self.endpoint.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

/// What a voice-state update meant for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceTransition {
    Updated,
    /// The bot was moved to another channel; the session survives.
    Moved { from: u64, to: u64 },
    /// The bot left or was kicked from voice.
    Terminated,
}

#[derive(Debug, Default)]
struct VoiceState {
    endpoint: Option<String>,
    token: Option<String>,
    session_id: Option<String>,
    region: Option<String>,
    channel_id: Option<u64>,
    self_deaf: bool,
    self_mute: bool,
    /// Bumped whenever the node side forgets what it was sent.
    generation: u64,
    last_pushed: Option<(u64, VoiceCredentials)>,
    in_flight: bool,
    resume_on_server_update: bool,
}

impl VoiceState {
    fn credentials(&self) -> Option<VoiceCredentials> {
        Some(VoiceCredentials {
            endpoint: self.endpoint.clone()?,
            token: self.token.clone()?,
            session_id: self.session_id.clone()?,
        })
    }

    fn is_acknowledged(&self, credentials: &VoiceCredentials) -> bool {
        matches!(&self.last_pushed, Some((generation, pushed)) if *generation == self.generation && pushed == credentials)
    }
}

/// Merges voice-server and voice-state updates into one credential set and
/// makes sure the node sees each completed set exactly once.
pub struct VoiceSession {
    guild_id: u64,
    timeout: Duration,
    state: Mutex<VoiceState>,
    changed: watch::Sender<()>,
}

impl VoiceSession {
    pub fn new(guild_id: u64, timeout: Duration) -> Self {
        Self {
            guild_id,
            timeout,
            state: Mutex::new(VoiceState::default()),
            changed: watch::channel(()).0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().credentials().is_some()
    }

    pub fn credentials(&self) -> Option<VoiceCredentials> {
        self.state.lock().credentials()
    }

    /// Voice region derived from the endpoint, e.g. `us-east`.
    pub fn region(&self) -> Option<String> {
        self.state.lock().region.clone()
    }

    pub fn channel_id(&self) -> Option<u64> {
        self.state.lock().channel_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the current credentials have been accepted by the node.
    pub fn is_acknowledged(&self) -> bool {
        let state = self.state.lock();
        !state.in_flight && state.credentials().is_some_and(|c| state.is_acknowledged(&c))
    }

    /// Records a voice-server update. Returns `true` when playback was held
    /// for a channel move and should now resume.
    pub fn on_voice_server_update(&self, endpoint: Option<String>, token: String) -> bool {
        let resume = {
            let mut state = self.state.lock();
            state.region = endpoint.as_deref().and_then(region_from_endpoint);
            state.endpoint = endpoint;
            state.token = Some(token);
            std::mem::take(&mut state.resume_on_server_update)
        };

        trace!("Guild {} voice server update (resume: {})", self.guild_id, resume);
        self.notify();
        resume
    }

    pub fn on_voice_state_update(
        &self,
        session_id: String,
        channel_id: Option<u64>,
        self_deaf: bool,
        self_mute: bool,
    ) -> VoiceTransition {
        let transition = {
            let mut state = self.state.lock();

            match channel_id {
                None => {
                    state.session_id = None;
                    state.channel_id = None;
                    state.endpoint = None;
                    state.token = None;
                    state.last_pushed = None;
                    state.resume_on_server_update = false;
                    VoiceTransition::Terminated
                }
                Some(to) => {
                    let previous = state.channel_id.replace(to);
                    state.session_id = Some(session_id);
                    state.self_deaf = self_deaf;
                    state.self_mute = self_mute;

                    match previous {
                        Some(from) if from != to => VoiceTransition::Moved { from, to },
                        _ => VoiceTransition::Updated,
                    }
                }
            }
        };

        debug!("Guild {} voice state update: {:?}", self.guild_id, transition);
        self.notify();
        transition
    }

    /// Holds playback until the next voice-server update arrives.
    pub fn hold_until_server_update(&self) {
        self.state.lock().resume_on_server_update = true;
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().resume_on_server_update
    }

    /// Forgets what the node was sent so the next push goes out again, e.g.
    /// after switching nodes or after a node lost its session.
    pub fn invalidate(&self) {
        self.state.lock().generation += 1;
        self.notify();
    }

    /// Pushes the current credentials through `push` unless they were
    /// already accepted.
    ///
    /// Only one push runs at a time. A caller that finds a push in flight
    /// returns immediately; the in-flight caller re-checks after its push
    /// completes and sends the newest set if it changed meanwhile. Returns
    /// the number of pushes this call performed.
    pub async fn push_pending<F, Fut>(&self, mut push: F) -> Result<usize>
    where
        F: FnMut(VoiceCredentials) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut pushed = 0;

        loop {
            let (generation, credentials) = {
                let mut state = self.state.lock();
                if state.in_flight {
                    trace!("Guild {} voice push already in flight", self.guild_id);
                    return Ok(pushed);
                }
                let Some(credentials) = state.credentials() else {
                    return Ok(pushed);
                };
                if state.is_acknowledged(&credentials) {
                    return Ok(pushed);
                }
                state.in_flight = true;
                (state.generation, credentials)
            };

            let flight = InFlight { session: self };
            self.notify();

            push(credentials.clone()).await?;

            self.state.lock().last_pushed = Some((generation, credentials));
            drop(flight);
            pushed += 1;
        }
    }

    /// Waits until the current credentials are complete and accepted by the
    /// node, for at most the configured timeout.
    pub async fn resolve(&self) -> Result<VoiceCredentials> {
        let mut changed = self.changed.subscribe();

        let wait = async {
            loop {
                {
                    let state = self.state.lock();
                    if !state.in_flight {
                        if let Some(credentials) = state.credentials() {
                            if state.is_acknowledged(&credentials) {
                                return credentials;
                            }
                        }
                    }
                }

                if changed.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };

        match tokio::time::timeout(self.timeout, wait).await {
            Ok(credentials) => Ok(credentials),
            Err(_) => Err(Error::ConnectionTimeout {
                guild_id: self.guild_id,
                waiting_for: self.waiting_for(),
                timeout: self.timeout,
            }),
        }
    }

    fn waiting_for(&self) -> WaitCondition {
        let state = self.state.lock();
        if state.in_flight || state.credentials().is_some() {
            WaitCondition::NodeAcknowledgement
        } else {
            WaitCondition::PlatformCredentials
        }
    }

    fn notify(&self) {
        self.changed.send_replace(());
    }
}

/// Clears the in-flight mark even when the pushing future is dropped.
struct InFlight<'a> {
    session: &'a VoiceSession,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.session.state.lock().in_flight = false;
        self.session.notify();
    }
}

/// `wss://us-east1234.discord.media:443` becomes `us-east`.
fn region_from_endpoint(endpoint: &str) -> Option<String> {
    let host = endpoint.split("://").last()?;
    let label = host.split(['.', ':']).next()?;
    let region: String = label.chars().filter(|c| !c.is_ascii_digit()).collect();
    let region = region.trim_end_matches('-');

    (!region.is_empty()).then(|| region.to_string())
}
