use std::{
    collections::HashMap,
    fs::{self, File},
    io::prelude::*,
    net::{SocketAddr, ToSocketAddrs},
    path::Path,
};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::policy::Policy;

/// Top-level configuration, loaded from a TOML file.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SluiceConfig {
    /// Worker threads; 0 starts one per CPU.
    #[serde(default)]
    pub workers: usize,

    /// Session pool capacity per worker.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Descriptor table size per worker. Sockets numbered at or above it are
    /// refused.
    #[serde(default = "default_max_fds")]
    pub max_fds: usize,

    /// Upper bound on one poll when nothing is pending.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Bytes per packet buffer.
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,

    /// Packet buffers per worker.
    #[serde(default = "default_packet_pool")]
    pub packet_pool: usize,

    /// Output packets a side may hold before its peer stops reading.
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,

    #[serde(default = "default_backlog")]
    pub backlog: i32,

    /// Interval between metric publications, 0 disables them.
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,

    #[serde(default)]
    pub nodelay: bool,

    #[serde(default)]
    pub affinity: Option<AffinityConfig>,

    #[serde(default)]
    pub policy: Vec<PolicyConfig>,

    #[serde(flatten)]
    pub other_fields: HashMap<String, toml::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AffinityConfig {
    pub algorithm: AffinityAlgorithm,
    pub range: CpuRange,
}

/// How worker threads are spread over the allowed CPUs.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AffinityAlgorithm {
    /// Worker `i` on the `i`th CPU of the range, wrapping.
    #[default]
    RoundRobin,
    /// Round robin over odd-numbered CPUs.
    Odd,
    /// Round robin over even-numbered CPUs.
    Even,
    /// Every worker may run on every CPU of the range.
    Full,
}

/// Which CPUs placement may use.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CpuRange {
    #[default]
    Full,
    /// Lower half.
    Low,
    /// Upper half.
    High,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Address to accept clients on, e.g. "0.0.0.0:8080".
    pub listen: String,
    /// Backend addresses, picked round robin.
    pub backends: Vec<String>,
}

fn default_max_sessions() -> usize {
    4096
}

fn default_max_fds() -> usize {
    16384
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_packet_size() -> usize {
    16 * 1024
}

fn default_packet_pool() -> usize {
    8192
}

fn default_queue_limit() -> usize {
    16
}

fn default_backlog() -> i32 {
    1024
}

fn default_report_interval_ms() -> u64 {
    10_000
}

impl Default for SluiceConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_sessions: default_max_sessions(),
            max_fds: default_max_fds(),
            poll_timeout_ms: default_poll_timeout_ms(),
            packet_size: default_packet_size(),
            packet_pool: default_packet_pool(),
            queue_limit: default_queue_limit(),
            backlog: default_backlog(),
            report_interval_ms: default_report_interval_ms(),
            nodelay: false,
            affinity: None,
            policy: vec![PolicyConfig {
                listen: "0.0.0.0:8080".to_string(),
                backends: vec!["127.0.0.1:9000".to_string()],
            }],
            other_fields: HashMap::new(),
        }
    }
}

impl SluiceConfig {
    pub fn load(path: &Path) -> Result<Self, SluiceConfigLoadError> {
        let raw = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;

        for (key, value) in &config.other_fields {
            warn!("Unknown configuration '{key}' with value {value:?}");
        }

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let config_str = toml::to_string(&self)?;
        let mut file = File::create(path)?;
        file.write_all(config_str.as_bytes())?;
        Ok(())
    }

    /// Worker count with 0 resolved to the number of CPUs.
    pub fn worker_count(&self) -> usize {
        match self.workers {
            0 => num_cpus::get().max(1),
            n => n,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("max_sessions", self.max_sessions),
            ("max_fds", self.max_fds),
            ("packet_size", self.packet_size),
            ("packet_pool", self.packet_pool),
            ("queue_limit", self.queue_limit),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.policy.is_empty() {
            return Err(ConfigError::NoPolicy);
        }
        for (index, policy) in self.policy.iter().enumerate() {
            policy.to_policy(index)?;
        }
        Ok(())
    }

    pub fn policies(&self) -> Result<Vec<Policy>, ConfigError> {
        self.policy
            .iter()
            .enumerate()
            .map(|(index, cfg)| cfg.to_policy(index))
            .collect()
    }
}

impl PolicyConfig {
    pub fn to_policy(&self, index: usize) -> Result<Policy, ConfigError> {
        let listen = resolve(&self.listen)?;
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends(index));
        }
        let backends = self
            .backends
            .iter()
            .map(|spec| resolve(spec))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Policy::new(listen, backends))
    }
}

fn resolve(spec: &str) -> Result<SocketAddr, ConfigError> {
    let trimmed = spec.trim();
    trimmed
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::BadAddress(trimmed.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum SluiceConfigLoadError {
    #[error("Could not open config")]
    Io(#[from] std::io::Error),
    #[error("Could not parse")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("'{0}' must be greater than zero")]
    Zero(&'static str),
    #[error("no [[policy]] configured")]
    NoPolicy,
    #[error("policy {0} has no backends")]
    NoBackends(usize),
    #[error("invalid address '{0}'")]
    BadAddress(String),
}
