//! Configuration system.
//!
//! Loads sync configuration from JSON strings or files. Every field has a
//! default, so `{}` is a valid config.

use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Root configuration shared by the client, server, and load harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Server address, e.g. `127.0.0.1:40000`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Display name announced to other players.
    #[serde(default = "default_player_name")]
    pub player_name: String,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub chunks: ChunkConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub tester: TesterConfig,
    #[serde(default)]
    pub load_test: LoadTestConfig,
}

fn default_server_addr() -> String {
    "127.0.0.1:40000".to_string()
}

fn default_player_name() -> String {
    "Pilot".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            player_name: default_player_name(),
            connection: ConnectionConfig::default(),
            chunks: ChunkConfig::default(),
            monitor: MonitorConfig::default(),
            tester: TesterConfig::default(),
            load_test: LoadTestConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }
}

/// Reconnection, heartbeat, and outbound queue policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval_ms: u64,
    /// Pong deadline after a ping. Also bounds each connect/auth attempt.
    pub heartbeat_timeout_ms: u64,
    /// Capture a session snapshot on unintended disconnect.
    pub preserve_state: bool,
    /// Pending message cap; the oldest message is dropped past it.
    pub max_pending_messages: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            heartbeat_enabled: true,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 10_000,
            preserve_state: true,
            max_pending_messages: 100,
        }
    }
}

impl ConnectionConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Spatial partitioning and remote player smoothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Edge length of one chunk in world units.
    pub chunk_size: f32,
    /// Minimum interval between two `player:move` sends.
    pub position_send_interval_ms: u64,
    /// Duration over which a remote player glides to its latest position.
    pub interpolation_ms: u64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000.0,
            position_send_interval_ms: 100,
            interpolation_ms: 100,
        }
    }
}

impl ChunkConfig {
    pub fn position_send_interval(&self) -> Duration {
        Duration::from_millis(self.position_send_interval_ms)
    }

    pub fn interpolation(&self) -> Duration {
        Duration::from_millis(self.interpolation_ms)
    }
}

/// Alert thresholds evaluated against every metric sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub memory_usage_bytes: u64,
    pub max_chunk_entities: usize,
    pub max_reconnect_ms: f64,
    pub max_heartbeat_rtt_ms: f64,
    pub max_pending_messages: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            memory_usage_bytes: 100 * 1024 * 1024,
            max_chunk_entities: 500,
            max_reconnect_ms: 5_000.0,
            max_heartbeat_rtt_ms: 250.0,
            max_pending_messages: 50,
        }
    }
}

/// Performance monitor sampling and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_ms: u64,
    pub max_history_size: usize,
    pub max_alerts: usize,
    pub thresholds: Thresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            max_history_size: 720,
            max_alerts: 100,
            thresholds: Thresholds::default(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Connection tester timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TesterConfig {
    pub max_reconnect_time_ms: u64,
    pub stress_cooldown_ms: u64,
    pub automated: bool,
    pub automated_interval_ms: u64,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            max_reconnect_time_ms: 10_000,
            stress_cooldown_ms: 2_000,
            automated: false,
            automated_interval_ms: 300_000,
        }
    }
}

impl TesterConfig {
    pub fn max_reconnect_time(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_time_ms)
    }

    pub fn stress_cooldown(&self) -> Duration {
        Duration::from_millis(self.stress_cooldown_ms)
    }

    pub fn automated_interval(&self) -> Duration {
        Duration::from_millis(self.automated_interval_ms)
    }
}

/// Load harness shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadTestConfig {
    pub server_url: String,
    pub max_concurrent_players: u32,
    pub test_duration_secs: u64,
    pub ramp_up_secs: u64,
    pub ramp_down_secs: u64,
    pub movement_interval_ms: u64,
    /// Maximum distance of one random-walk step.
    pub step_size: f32,
    pub output_dir: String,
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_addr(),
            max_concurrent_players: 100,
            test_duration_secs: 60,
            ramp_up_secs: 10,
            ramp_down_secs: 10,
            movement_interval_ms: 1_000,
            step_size: 250.0,
            output_dir: "load-test-results".to_string(),
        }
    }
}

impl LoadTestConfig {
    pub fn test_duration(&self) -> Duration {
        Duration::from_secs(self.test_duration_secs)
    }

    pub fn ramp_up(&self) -> Duration {
        Duration::from_secs(self.ramp_up_secs)
    }

    pub fn ramp_down(&self) -> Duration {
        Duration::from_secs(self.ramp_down_secs)
    }

    pub fn movement_interval(&self) -> Duration {
        Duration::from_millis(self.movement_interval_ms)
    }
}
