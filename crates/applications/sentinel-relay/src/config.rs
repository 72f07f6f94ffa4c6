//! Relay configuration
//!
//! Loaded from a JSON file. Every section except `clusters` and `sentinels` has
//! defaults, so a minimal file is:
//!
//! ```json
//! {
//!   "clusters":  [{ "name": "cache", "external_port": 6379 }],
//!   "sentinels": [{ "host": "10.0.0.5", "port": 26379 }]
//! }
//! ```

use crate::error::{RelayError, Result};
use crate::types::Sentinel;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Clusters whose masters are tracked
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,

    /// Sentinels to monitor at startup
    #[serde(default)]
    pub sentinels: Vec<Sentinel>,

    /// Monitor timings and reconnect policy
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Status API
    #[serde(default)]
    pub api: ApiConfig,

    /// Where switches go
    #[serde(default)]
    pub flipper: FlipperConfig,

    /// Log sinks
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A cluster and the port clients use to reach its master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Sentinel master-name
    pub name: String,

    /// Externally exposed port for this cluster
    pub external_port: u16,
}

/// Monitor timings and channel sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Liveness ping interval when no message arrives
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Upper bound on connecting to a sentinel
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Transport read timeout; `None` disables timeout markers
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,

    /// Capacity of the shared master-switch channel
    #[serde(default = "default_switch_channel_capacity")]
    pub switch_channel_capacity: usize,

    /// Reconnect policy for lost sentinels
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_switch_channel_capacity() -> usize {
    64
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: None,
            switch_channel_capacity: default_switch_channel_capacity(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Heartbeat interval as a `Duration`
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Read timeout as a `Duration`, if set
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }
}

/// Reconnect policy after a sentinel is lost
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Reconnect lost sentinels at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// First delay before reconnecting
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Cap on the doubling delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl ReconnectConfig {
    /// Never reconnect
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// First reconnect delay, never below one millisecond
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms.max(1))
    }

    /// Largest reconnect delay
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Delay following `current`: doubled, capped at `max_backoff`, never
    /// below `initial_backoff`
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current
            .saturating_mul(2)
            .min(self.max_backoff())
            .max(self.initial_backoff())
    }
}

/// Status API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Serve the status API at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

/// Which flipper receives master switches
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlipperConfig {
    /// Only log switches
    #[default]
    Log,

    /// Run an external program per switch
    Command {
        /// Program to run
        program: String,
        /// Arguments placed before the switch arguments
        #[serde(default)]
        args: Vec<String>,
        /// Kill the program after this long
        #[serde(default = "default_flipper_timeout_ms")]
        timeout_ms: u64,
    },

    /// POST each switch as JSON
    Webhook {
        /// Endpoint URL
        url: String,
        /// Request timeout
        #[serde(default = "default_flipper_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_flipper_timeout_ms() -> u64 {
    10_000
}

/// Log sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for daily-rolling log files; stdout only when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Log file name prefix
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

fn default_file_prefix() -> String {
    "sentinel-relay.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            file_prefix: default_file_prefix(),
        }
    }
}

impl RelayConfig {
    /// Read and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json(&raw)?;
        Ok(config)
    }

    /// Parse and validate JSON
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Cluster name -> configured external port
    pub fn external_ports(&self) -> HashMap<String, u16> {
        self.clusters
            .iter()
            .map(|c| (c.name.clone(), c.external_port))
            .collect()
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.clusters.is_empty() {
            return Err(RelayError::config("at least one cluster is required"));
        }

        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if cluster.name.trim().is_empty() {
                return Err(RelayError::config("cluster name must not be empty"));
            }
            if !names.insert(cluster.name.as_str()) {
                return Err(RelayError::config(format!(
                    "cluster {} is configured twice",
                    cluster.name
                )));
            }
        }

        for sentinel in &self.sentinels {
            if sentinel.host.trim().is_empty() {
                return Err(RelayError::config("sentinel host must not be empty"));
            }
            if sentinel.port == 0 {
                return Err(RelayError::config(format!(
                    "sentinel {} has port 0",
                    sentinel.host
                )));
            }
        }

        if self.monitor.heartbeat_interval_ms == 0 {
            return Err(RelayError::config("heartbeat_interval_ms must be positive"));
        }
        if self.monitor.switch_channel_capacity == 0 {
            return Err(RelayError::config("switch_channel_capacity must be positive"));
        }

        let reconnect = &self.monitor.reconnect;
        if reconnect.initial_backoff_ms == 0 {
            return Err(RelayError::config("reconnect.initial_backoff_ms must be positive"));
        }
        if reconnect.max_backoff_ms < reconnect.initial_backoff_ms {
            return Err(RelayError::config(format!(
                "reconnect.max_backoff_ms ({}) is below initial_backoff_ms ({})",
                reconnect.max_backoff_ms, reconnect.initial_backoff_ms
            )));
        }

        match &self.flipper {
            FlipperConfig::Command { program, .. } if program.trim().is_empty() => {
                Err(RelayError::config("command flipper needs a program"))
            }
            FlipperConfig::Webhook { url, .. } if url.trim().is_empty() => {
                Err(RelayError::config("webhook flipper needs a url"))
            }
            _ => Ok(()),
        }
    }
}
