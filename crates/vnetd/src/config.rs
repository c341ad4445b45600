//! Configuration file support for vnetd
//!
//! Loads and validates vnetd configuration from TOML files.
//! Default location: /etc/vnetd/vnetd.toml

use crate::error::{Result, VnetdError};
use crate::settings::interval_in_range;
use crate::vnet::Intervals;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use tracing::warn;

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vnetd/vnetd.toml";

const HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";

/// Publish queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Prefix prepended to every record
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Slow-path queue capacity
    #[serde(default = "default_channel_depth")]
    pub channel_depth: usize,

    /// High-frequency queue capacity
    #[serde(default = "default_hf_channel_depth")]
    pub hf_channel_depth: usize,

    /// Host field of high-frequency lines; read from the kernel when unset
    #[serde(default)]
    pub hostname: Option<String>,
}

/// Poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: f64,

    #[serde(default = "default_fast_interval_ms")]
    pub fast_interval_ms: f64,

    #[serde(default = "default_unresolved_arp_interval_secs")]
    pub unresolved_arp_interval_secs: f64,

    /// Skip entities without a kernel network device
    #[serde(default = "default_unix_interfaces_only")]
    pub unix_interfaces_only: bool,
}

/// Redis sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub db: u32,

    /// Hash receiving slow-path records
    #[serde(default = "default_hash")]
    pub hash: String,

    /// Channel receiving high-frequency lines
    #[serde(default = "default_hf_channel")]
    pub hf_channel: String,
}

/// Control endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Simulated platform layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_ports")]
    pub ports: u16,

    #[serde(default = "default_subports")]
    pub subports: u16,
}

/// Complete vnetd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VnetdConfig {
    #[serde(default)]
    pub publish: PublishConfig,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub control: ControlConfig,

    #[serde(default)]
    pub platform: PlatformConfig,
}

// Default functions
fn default_namespace() -> String {
    "vnet.".to_string()
}

fn default_channel_depth() -> usize {
    65536
}

fn default_hf_channel_depth() -> usize {
    64
}

fn default_interval_secs() -> f64 {
    5.0
}

fn default_fast_interval_ms() -> f64 {
    200.0
}

fn default_unresolved_arp_interval_secs() -> f64 {
    1.0
}

fn default_unix_interfaces_only() -> bool {
    true
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_hash() -> String {
    "platina-mk1".to_string()
}

fn default_hf_channel() -> String {
    "hf-counters".to_string()
}

fn default_listen() -> String {
    "127.0.0.1:8091".to_string()
}

fn default_ports() -> u16 {
    32
}

fn default_subports() -> u16 {
    1
}

// Default implementations
impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            channel_depth: default_channel_depth(),
            hf_channel_depth: default_hf_channel_depth(),
            hostname: None,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            fast_interval_ms: default_fast_interval_ms(),
            unresolved_arp_interval_secs: default_unresolved_arp_interval_secs(),
            unix_interfaces_only: default_unix_interfaces_only(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            hash: default_hash(),
            hf_channel: default_hf_channel(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            ports: default_ports(),
            subports: default_subports(),
        }
    }
}

impl VnetdConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => {
                let config = toml::from_str(&content).map_err(|e| {
                    VnetdError::Configuration(format!(
                        "Failed to parse config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(VnetdError::Io(e)),
        }
    }

    /// Poll periods the scheduler starts with
    pub fn intervals(&self) -> Intervals {
        Intervals {
            poll: self.poll.interval_secs,
            fast_poll_ms: self.poll.fast_interval_ms,
            unresolved_arp: self.poll.unresolved_arp_interval_secs,
        }
    }

    /// Configured hostname, else the kernel's, else `localhost`
    pub fn hostname(&self) -> String {
        if let Some(hostname) = &self.publish.hostname {
            return hostname.clone();
        }
        fs::read_to_string(HOSTNAME_PATH)
            .map(|s| s.trim().to_string())
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.control.listen.parse().map_err(|e| {
            VnetdError::Configuration(format!("invalid listen address {}: {}", self.control.listen, e))
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.publish.channel_depth == 0 {
            return Err(VnetdError::Configuration(
                "channel_depth must be > 0".to_string(),
            ));
        }

        if self.publish.hf_channel_depth == 0 {
            return Err(VnetdError::Configuration(
                "hf_channel_depth must be > 0".to_string(),
            ));
        }

        let intervals = [
            ("interval_secs", self.poll.interval_secs, 1.0, "1 second"),
            ("fast_interval_ms", self.poll.fast_interval_ms, 1000.0, "1 millisecond"),
            (
                "unresolved_arp_interval_secs",
                self.poll.unresolved_arp_interval_secs,
                1.0,
                "1 second",
            ),
        ];
        for (name, value, per_second, minimum) in intervals {
            if !interval_in_range(value, per_second) {
                return Err(VnetdError::Configuration(format!(
                    "{} must be between {} and one day, got {}",
                    name, minimum, value
                )));
            }
        }

        if self.redis.port == 0 {
            return Err(VnetdError::Configuration("redis port must be > 0".to_string()));
        }

        if self.platform.ports == 0 {
            return Err(VnetdError::Configuration("ports must be > 0".to_string()));
        }

        self.listen_addr()?;

        Ok(())
    }
}
