use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;
use super::protocol::FitMode;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub transports: TransportsConfig,
    #[serde(default)]
    pub mount: MountConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
}

/// Timing and budget knobs for the playback engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Channel mounted on startup.  Empty means "wait for a SetChannel command".
    #[serde(default)]
    pub channel_id: String,
    /// Failed connect attempts tolerated per low-latency session.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    /// Consecutive decode failures before the codec is downgraded.
    #[serde(default = "default_decode_failure_threshold")]
    pub decode_failure_threshold: u32,
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
}

impl EngineConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(1))
    }
}

/// Where stream metadata comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// URL template; `{channel}` is replaced with the channel id.
    #[serde(default = "default_metadata_url")]
    pub url_template: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl MetadataConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(100))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportsConfig {
    /// Legacy tier URL template; `{channel}` is replaced with the channel id.
    /// Empty disables the legacy tier.
    #[serde(default = "default_legacy_url")]
    pub legacy_url_template: String,
    #[serde(default = "default_primary_codec")]
    pub primary_codec: String,
    #[serde(default = "default_fallback_codec")]
    pub fallback_codec: String,
}

/// Per-mount presentation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    #[serde(default)]
    pub fit: FitMode,
    /// Mute locally (admin/production preview must not echo).
    #[serde(default)]
    pub muted: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Mobile viewports skip the blurred background layer.
    #[serde(default)]
    pub mobile: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpvConfig {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_id: String::new(),
            retry_budget: default_retry_budget(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            decode_failure_threshold: default_decode_failure_threshold(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            url_template: default_metadata_url(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for TransportsConfig {
    fn default() -> Self {
        Self {
            legacy_url_template: default_legacy_url(),
            primary_codec: default_primary_codec(),
            fallback_codec: default_fallback_codec(),
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            fit: FitMode::default(),
            muted: false,
            enabled: true,
            mobile: false,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_retry_budget() -> u32 {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    3_000
}

fn default_join_timeout_ms() -> u64 {
    30_000
}

fn default_decode_failure_threshold() -> u32 {
    3
}

fn default_reconcile_interval_ms() -> u64 {
    500
}

fn default_metadata_url() -> String {
    "http://127.0.0.1:8080/api/channels/{channel}/stream".to_string()
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_legacy_url() -> String {
    String::new()
}

fn default_primary_codec() -> String {
    "h264".to_string()
}

fn default_fallback_codec() -> String {
    "vp8".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_volume() -> f32 {
    0.8
}

/// Substitute `{channel}` in a URL template.
pub fn expand_channel(template: &str, channel_id: &str) -> String {
    template.replace("{channel}", channel_id)
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
