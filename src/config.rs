use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const ENV_PREFIX: &str = "RPC_SESSION";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

///
/// Client settings. Every field has a default, so an empty or missing
/// config file is valid. Environment variables prefixed with `RPC_SESSION_`
/// override the file, e.g. `RPC_SESSION_SERVER_URL=ws://host:7007`.
///
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    /// name sent with every call on the default connection
    pub client_name: String,
    pub push_namespace: String,
    pub command_namespace: String,
    pub credentials: Option<Credentials>,
    /// where the session store is kept
    pub data_dir: PathBuf,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub retry_intervals_secs: Vec<u64>,
    pub socket_redial_ms: u64,
    pub cache_capacity: usize,
    pub cache_default_ttl_secs: u64,
    pub command_poll_interval_ms: u64,
    pub progress_poll_interval_ms: u64,
    pub command_poll_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            server_url: String::from("ws://127.0.0.1:7007"),
            client_name: String::from("webclient"),
            push_namespace: String::from("/notification"),
            command_namespace: String::from("/command"),
            credentials: None,
            data_dir: PathBuf::from("data"),
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 2 * 60 * 60 * 1000,
            retry_intervals_secs: (1..=10).map(|n| n * 10).collect(),
            socket_redial_ms: 1_000,
            cache_capacity: 500,
            cache_default_ttl_secs: 30 * 60,
            command_poll_interval_ms: 5_000,
            progress_poll_interval_ms: 3_000,
            command_poll_timeout_ms: 2 * 60 * 60 * 1000,
        }
    }
}

impl ClientSettings {
    /// Load `config_name` (any format the config crate knows, the file is
    /// optional) and apply environment overrides on top.
    pub fn load(config_name: &str) -> crate::Result<Self> {
        let mut settings = config::Config::default();
        settings
            .merge(config::File::with_name(config_name).required(false))?
            .merge(config::Environment::with_prefix(ENV_PREFIX).separator("__"))?;
        Ok(settings.try_into()?)
    }

    /// The socket url of a namespace, an empty namespace is the server url
    /// itself.
    pub fn url_for(&self, namespace: &str) -> crate::Result<Url> {
        let mut url = Url::parse(&self.server_url)?;
        if !namespace.is_empty() {
            url.set_path(namespace);
        }
        Ok(url)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn retry_intervals(&self) -> Vec<Duration> {
        self.retry_intervals_secs
            .iter()
            .map(|secs| Duration::from_secs(*secs))
            .collect()
    }

    pub fn socket_redial(&self) -> Duration {
        Duration::from_millis(self.socket_redial_ms)
    }

    pub fn cache_default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_default_ttl_secs)
    }

    pub fn command_poll_interval(&self) -> Duration {
        Duration::from_millis(self.command_poll_interval_ms)
    }

    pub fn progress_poll_interval(&self) -> Duration {
        Duration::from_millis(self.progress_poll_interval_ms)
    }

    pub fn command_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.command_poll_timeout_ms)
    }
}
