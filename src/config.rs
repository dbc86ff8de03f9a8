//! ChatSync Configuration
//!
//! Static cluster description loaded once at process start: the member
//! list plus timing tunables. Not hot-reloadable.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::state::{Member, Roster};

/// Main ChatSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSyncConfig {
    /// Cluster timing configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Static cluster membership
    #[serde(default)]
    pub members: Vec<Member>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Cluster timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Interval between liveness announcements in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Interval between reachability sweeps in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Silence after which a member is considered unreachable
    #[serde(default = "default_failure_threshold_ms")]
    pub failure_threshold_ms: u64,

    /// Per-attempt client connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound on a single datagram receive wait
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,

    /// A client that stays silent this long is disconnected
    #[serde(default = "default_client_idle_timeout_ms")]
    pub client_idle_timeout_ms: u64,

    /// Pause between full failover sweeps of the member list
    #[serde(default = "default_failover_backoff_ms")]
    pub failover_backoff_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Cluster tunables resolved into durations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterTimings {
    pub heartbeat_interval: Duration,
    pub sweep_interval: Duration,
    pub failure_threshold: Duration,
    pub connect_timeout: Duration,
    pub receive_timeout: Duration,
    pub client_idle_timeout: Duration,
    pub failover_backoff: Duration,
}

// Default value functions
fn default_heartbeat_interval_ms() -> u64 {
    2000
}

fn default_sweep_interval_ms() -> u64 {
    500
}

fn default_failure_threshold_ms() -> u64 {
    8000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_receive_timeout_ms() -> u64 {
    1000
}

fn default_client_idle_timeout_ms() -> u64 {
    30000
}

fn default_failover_backoff_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            failure_threshold_ms: default_failure_threshold_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            receive_timeout_ms: default_receive_timeout_ms(),
            client_idle_timeout_ms: default_client_idle_timeout_ms(),
            failover_backoff_ms: default_failover_backoff_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ChatSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ChatSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("cannot render configuration: {}", e)))
    }

    /// Write the configuration to a file
    pub fn write_to(&self, path: &PathBuf) -> crate::Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// Any ambiguity in election order is fatal: the process refuses to
    /// start rather than run with two members sharing a ring position.
    pub fn validate(&self) -> crate::Result<()> {
        if self.members.is_empty() {
            return Err(crate::Error::Config("members cannot be empty".into()));
        }

        let mut ids = HashSet::new();
        let mut positions = HashSet::new();
        let mut endpoints = HashSet::new();

        for member in &self.members {
            if member.id.trim().is_empty() {
                return Err(crate::Error::Config("member id cannot be empty".into()));
            }
            if member.host.trim().is_empty() {
                return Err(crate::Error::Config(format!(
                    "member {} has an empty host",
                    member.id
                )));
            }
            if !ids.insert(member.id.as_str()) {
                return Err(crate::Error::Config(format!(
                    "duplicate member id: {}",
                    member.id
                )));
            }
            if !positions.insert(member.ring_position) {
                return Err(crate::Error::Config(format!(
                    "duplicate ring_position {} (member {})",
                    member.ring_position, member.id
                )));
            }
            if member.client_port == member.cluster_port {
                return Err(crate::Error::Config(format!(
                    "member {} uses port {} for both client and cluster traffic",
                    member.id, member.client_port
                )));
            }
            for port in [member.client_port, member.cluster_port] {
                if !endpoints.insert((member.host.as_str(), port)) {
                    return Err(crate::Error::Config(format!(
                        "endpoint {}:{} is assigned twice",
                        member.host, port
                    )));
                }
            }
        }

        let cluster = &self.cluster;
        for (name, value) in [
            ("heartbeat_interval_ms", cluster.heartbeat_interval_ms),
            ("sweep_interval_ms", cluster.sweep_interval_ms),
            ("failure_threshold_ms", cluster.failure_threshold_ms),
            ("connect_timeout_ms", cluster.connect_timeout_ms),
            ("receive_timeout_ms", cluster.receive_timeout_ms),
            ("client_idle_timeout_ms", cluster.client_idle_timeout_ms),
        ] {
            if value == 0 {
                return Err(crate::Error::Config(format!("cluster.{} must be > 0", name)));
            }
        }

        if cluster.failure_threshold_ms <= cluster.heartbeat_interval_ms {
            return Err(crate::Error::Config(format!(
                "cluster.failure_threshold_ms ({}) must exceed heartbeat_interval_ms ({})",
                cluster.failure_threshold_ms, cluster.heartbeat_interval_ms
            )));
        }

        Ok(())
    }

    /// Look up a member by id
    pub fn member(&self, id: &str) -> crate::Result<&Member> {
        self.members
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| crate::Error::MemberNotFound(id.to_string()))
    }

    /// Build the immutable roster as seen by member `self_id`
    pub fn roster(&self, self_id: &str) -> crate::Result<Roster> {
        Roster::new(self_id, self.members.clone())
    }

    /// Resolve cluster tunables into durations
    pub fn timings(&self) -> ClusterTimings {
        let c = &self.cluster;
        ClusterTimings {
            heartbeat_interval: Duration::from_millis(c.heartbeat_interval_ms),
            sweep_interval: Duration::from_millis(c.sweep_interval_ms),
            failure_threshold: Duration::from_millis(c.failure_threshold_ms),
            connect_timeout: Duration::from_millis(c.connect_timeout_ms),
            receive_timeout: Duration::from_millis(c.receive_timeout_ms),
            client_idle_timeout: Duration::from_millis(c.client_idle_timeout_ms),
            failover_backoff: Duration::from_millis(c.failover_backoff_ms),
        }
    }

    /// Three members on localhost with ring positions 0/1/2
    pub fn local_three_node() -> Self {
        let members = (0..3u16)
            .map(|i| Member {
                id: format!("server{}", i + 1),
                host: "127.0.0.1".to_string(),
                client_port: 8000 + i,
                cluster_port: 8020 + i,
                ring_position: u32::from(i),
            })
            .collect();

        Self {
            cluster: ClusterConfig::default(),
            members,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ClusterTimings {
    fn default() -> Self {
        ChatSyncConfig::local_three_node().timings()
    }
}
