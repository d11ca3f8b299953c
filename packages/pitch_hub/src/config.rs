use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [hub]
//                    queue_capacity = 50
//
//   env var:         PITCH_HUB_HUB__QUEUE_CAPACITY=50   (double underscore = nesting)
//
//   (single underscore stays within field names: PITCH_HUB_SERVER__SEND_CHANNEL_CAPACITY)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub hub: HubFileConfig,
}

/// Listener knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_send_channel_capacity")]
    pub send_channel_capacity: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            send_channel_capacity: default_send_channel_capacity(),
        }
    }
}

/// Hub behavior (lives under `[hub]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubFileConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Force-close connections silent for this long. 0 disables.
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    /// Empty disables the transport-level auto reply.
    #[serde(default = "default_ping_token")]
    pub ping_token: String,
    #[serde(default = "default_pong_token")]
    pub pong_token: String,
    #[serde(default)]
    pub hibernate_when_idle: bool,
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

impl Default for HubFileConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            default_ttl_secs: default_ttl_secs(),
            max_idle_secs: default_max_idle_secs(),
            ping_token: default_ping_token(),
            pong_token: default_pong_token(),
            hibernate_when_idle: false,
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_send_channel_capacity() -> usize {
    128
}
fn default_queue_capacity() -> usize {
    100
}
fn default_ttl_secs() -> u64 {
    604800
}
fn default_max_idle_secs() -> u64 {
    300
}
fn default_ping_token() -> String {
    "ping".to_string()
}
fn default_pong_token() -> String {
    "pong".to_string()
}
fn default_inbox_capacity() -> usize {
    1024
}

/// Build a figment that layers: defaults → config.toml → PITCH_HUB_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `PITCH_HUB_HUB__QUEUE_CAPACITY=50`  →  `hub.queue_capacity = 50`
///   `PITCH_HUB_SERVER__PORT=9000`  →  `server.port = 9000`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("PITCH_HUB_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Listener configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Outbound frames buffered per connection before sends start failing
    pub send_channel_capacity: usize,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            host: fc.host.clone(),
            port: fc.port,
            send_channel_capacity: fc.send_channel_capacity.max(1),
        }
    }

    /// Grow the per-connection buffer so a full offline backlog, plus the
    /// greeting sent ahead of it, fits without a reader.
    pub fn with_backlog_room(mut self, queue_capacity: usize) -> Self {
        let needed = queue_capacity.saturating_add(2);
        if self.send_channel_capacity < needed {
            info!(
                configured = self.send_channel_capacity,
                needed,
                "Raising send channel capacity to fit the offline queue"
            );
            self.send_channel_capacity = needed;
        }
        self
    }
}

/// Hub configuration (runtime view).
#[derive(Clone, Debug)]
pub struct HubConfig {
    pub queue_capacity: usize,
    pub default_ttl_secs: u64,
    /// None = idle connections are never force-closed
    pub max_idle: Option<Duration>,
    pub ping_token: String,
    pub pong_token: String,
    pub hibernate_when_idle: bool,
    pub inbox_capacity: usize,
}

impl HubConfig {
    pub fn from_file(fc: &HubFileConfig) -> Self {
        Self {
            queue_capacity: fc.queue_capacity,
            default_ttl_secs: fc.default_ttl_secs,
            max_idle: if fc.max_idle_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(fc.max_idle_secs))
            },
            ping_token: fc.ping_token.clone(),
            pong_token: fc.pong_token.clone(),
            hibernate_when_idle: fc.hibernate_when_idle,
            inbox_capacity: fc.inbox_capacity,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_file(&HubFileConfig::default())
    }
}

// =============================================================================
// Directory layout config (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct PitchHubConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl PitchHubConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".pitch_hub"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("hub.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
