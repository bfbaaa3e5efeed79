use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::audio::controller::PlayerSettings;
use crate::node::{LinkSettings, NodeConfig};

/// What happens to the players of a node that is gone for good.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverPolicy {
    /// Leave them; the host decides.
    #[default]
    None,
    /// Move them to the best remaining node.
    Migrate,
    /// Tear them down.
    Destroy,
}

impl FromStr for FailoverPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(FailoverPolicy::None),
            "migrate" => Ok(FailoverPolicy::Migrate),
            "destroy" => Ok(FailoverPolicy::Destroy),
            other => bail!("Unknown failover policy {:?} (expected none, migrate or destroy)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Nodos
    pub nodes: Vec<NodeConfig>,

    // Identidad
    pub bot_user_id: u64,
    pub client_name: String,

    // Conexión
    pub voice_timeout: Duration,
    pub reconnect_delay: Duration,
    pub reconnect_attempts: u32,
    pub rest_min_interval: Duration,
    pub resume_timeout: Duration,
    pub auto_resume: bool,

    // Reproducción
    pub default_volume: u16,
    pub max_queue_size: usize,
    pub search_prefix: String,

    pub failover: FailoverPolicy,
}

impl Config {
    /// Loads `.env` if present, then reads the process environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds and validates a configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let nodes = match var("LAVALINK_NODES") {
            Some(raw) => serde_json::from_str::<Vec<NodeConfig>>(&raw)
                .context("LAVALINK_NODES must be a JSON array of nodes")?,
            None => vec![NodeConfig {
                name: "main".to_string(),
                host: var("LAVALINK_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: parse_or(&var, "LAVALINK_PORT", 2333)?,
                password: var("LAVALINK_PASSWORD").unwrap_or_else(|| "youshallnotpass".to_string()),
                secure: parse_or(&var, "LAVALINK_SECURE", false)?,
                regions: Vec::new(),
            }],
        };

        let config = Self {
            nodes,

            bot_user_id: var("BOT_USER_ID")
                .context("BOT_USER_ID is required")?
                .parse::<u64>()
                .context("BOT_USER_ID must be a numeric user id")?,
            client_name: var("CLIENT_NAME")
                .unwrap_or_else(|| concat!("open-music-link/", env!("CARGO_PKG_VERSION")).to_string()),

            voice_timeout: duration_or(&var, "VOICE_TIMEOUT", "15s")?,
            reconnect_delay: duration_or(&var, "RECONNECT_DELAY", "5s")?,
            reconnect_attempts: parse_or(&var, "RECONNECT_ATTEMPTS", 5)?,
            rest_min_interval: duration_or(&var, "REST_MIN_INTERVAL", "0ms")?,
            resume_timeout: duration_or(&var, "RESUME_TIMEOUT", "60s")?,
            auto_resume: parse_or(&var, "AUTO_RESUME", true)?,

            default_volume: parse_or(&var, "DEFAULT_VOLUME", 100)?,
            max_queue_size: parse_or(&var, "MAX_QUEUE_SIZE", 1000)?,
            search_prefix: var("SEARCH_PREFIX").unwrap_or_else(|| "ytsearch".to_string()),

            failover: parse_or(&var, "FAILOVER", FailoverPolicy::None)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - At least one node, with unique names
    /// - At least one reconnect attempt
    /// - Volume between 0 and 1000
    /// - Queue size greater than 0
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("At least one Lavalink node must be configured");
        }

        for (index, node) in self.nodes.iter().enumerate() {
            if node.name.trim().is_empty() {
                bail!("Node #{} has an empty name", index);
            }
            if self.nodes[..index].iter().any(|other| other.name == node.name) {
                bail!("Duplicate node name: {}", node.name);
            }
        }

        if self.reconnect_attempts == 0 {
            bail!("Reconnect attempts must be greater than 0");
        }

        if self.default_volume > 1000 {
            bail!("Default volume must be between 0 and 1000, got: {}", self.default_volume);
        }

        if self.max_queue_size == 0 {
            bail!("Max queue size must be greater than 0");
        }

        Ok(())
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            user_id: self.bot_user_id,
            client_name: self.client_name.clone(),
            reconnect_delay: self.reconnect_delay,
            reconnect_attempts: self.reconnect_attempts,
            rest_min_interval: self.rest_min_interval,
            resume_timeout: self.resume_timeout,
            auto_resume: self.auto_resume,
        }
    }

    pub fn player_settings(&self) -> PlayerSettings {
        PlayerSettings {
            voice_timeout: self.voice_timeout,
            default_volume: self.default_volume,
            max_queue_size: self.max_queue_size,
        }
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Node passwords are never included.
    pub fn summary(&self) -> String {
        let nodes = self
            .nodes
            .iter()
            .map(|node| format!("{} ({})", node.name, node.rest_url()))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "Config Summary:\n  \
            Nodes: {}\n  \
            Client: {} as user {}\n  \
            Voice: {} timeout\n  \
            Reconnect: {} attempts every {}, resume window {}, auto-resume={}\n  \
            Players: {}% vol, {} queue, search prefix {:?}\n  \
            Failover: {:?}",
            nodes,
            self.client_name,
            self.bot_user_id,
            humantime::format_duration(self.voice_timeout),
            self.reconnect_attempts,
            humantime::format_duration(self.reconnect_delay),
            humantime::format_duration(self.resume_timeout),
            self.auto_resume,
            self.default_volume,
            self.max_queue_size,
            self.search_prefix,
            self.failover,
        )
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}={:?}: {}", key, raw, e)),
        None => Ok(default),
    }
}

fn duration_or(var: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> Result<Duration> {
    let raw = var(key).unwrap_or_else(|| default.to_string());
    humantime::parse_duration(raw.trim()).with_context(|| format!("Invalid duration {}={:?}", key, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults_with_single_node() {
        let config = load(&[("BOT_USER_ID", "42")]).unwrap();

        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].rest_url(), "http://localhost:2333");
        assert_eq!(config.voice_timeout, Duration::from_secs(15));
        assert_eq!(config.reconnect_attempts, 5);
        assert_eq!(config.rest_min_interval, Duration::ZERO);
        assert_eq!(config.failover, FailoverPolicy::None);
        assert!(config.auto_resume);
        assert_eq!(config.link_settings().user_id, 42);
    }

    #[test]
    fn test_node_list_and_overrides() {
        let config = load(&[
            ("BOT_USER_ID", "42"),
            (
                "LAVALINK_NODES",
                r#"[{"name":"eu","host":"eu.lava","password":"a","regions":["rotterdam"]},
                    {"name":"us","host":"us.lava","port":443,"password":"b","secure":true}]"#,
            ),
            ("VOICE_TIMEOUT", "3s"),
            ("REST_MIN_INTERVAL", "250ms"),
            ("FAILOVER", "Migrate"),
            ("DEFAULT_VOLUME", "80"),
        ])
        .unwrap();

        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[1].websocket_url(), "wss://us.lava:443/v4/websocket");
        assert!(config.nodes[0].serves_region("rotterdam"));
        assert_eq!(config.player_settings().voice_timeout, Duration::from_secs(3));
        assert_eq!(config.rest_min_interval, Duration::from_millis(250));
        assert_eq!(config.failover, FailoverPolicy::Migrate);
        assert_eq!(config.player_settings().default_volume, 80);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(load(&[]).is_err());
        assert!(load(&[("BOT_USER_ID", "abc")]).is_err());
        assert!(load(&[("BOT_USER_ID", "1"), ("RECONNECT_ATTEMPTS", "0")]).is_err());
        assert!(load(&[("BOT_USER_ID", "1"), ("DEFAULT_VOLUME", "1001")]).is_err());
        assert!(load(&[("BOT_USER_ID", "1"), ("MAX_QUEUE_SIZE", "0")]).is_err());
        assert!(load(&[("BOT_USER_ID", "1"), ("VOICE_TIMEOUT", "soon")]).is_err());
        assert!(load(&[("BOT_USER_ID", "1"), ("FAILOVER", "pray")]).is_err());
        assert!(load(&[("BOT_USER_ID", "1"), ("LAVALINK_NODES", "[]")]).is_err());
        assert!(load(&[
            ("BOT_USER_ID", "1"),
            (
                "LAVALINK_NODES",
                r#"[{"name":"x","host":"a","password":"p"},{"name":"x","host":"b","password":"p"}]"#
            ),
        ])
        .is_err());
    }

    #[test]
    fn test_summary_hides_passwords() {
        let config = load(&[("BOT_USER_ID", "7"), ("LAVALINK_PASSWORD", "hunter2")]).unwrap();
        let summary = config.summary();

        assert!(summary.contains("main (http://localhost:2333)"));
        assert!(!summary.contains("hunter2"));
    }
}
