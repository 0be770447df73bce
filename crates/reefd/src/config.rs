//! TOML configuration for the Reef daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reef_node::RuntimeConfig;
use reef_types::{BackendKind, NodeAddr};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Node identity and data directory.
    pub node: NodeSection,
    /// Cluster bootstrap.
    pub cluster: ClusterSection,
    /// Value storage.
    pub storage: StorageSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Address for inter-node communication; also this node's identity.
    pub listen_addr: String,
    /// Directory for persistent data (spilled value blobs).
    pub data_dir: PathBuf,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".reef"))
            .unwrap_or_else(|| PathBuf::from(".reef"));
        Self {
            listen_addr: "127.0.0.1:4820".to_string(),
            data_dir,
        }
    }
}

/// `[cluster]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// How many members to wait for before serving.
    pub expected_size: usize,
    /// Peer addresses to contact on startup (`"a.b.c.d:port"`).
    pub seeds: Vec<String>,
    /// Milliseconds between heartbeat rounds.
    pub heartbeat_interval_ms: Option<u64>,
    /// Members silent for this long are dropped from the view.
    pub staleness_ms: Option<u64>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            expected_size: 1,
            seeds: Vec::new(),
            heartbeat_interval_ms: None,
            staleness_ms: None,
        }
    }
}

/// `[storage]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Backend for spilled values: `"memory"` (default) or `"disk"`.
    pub backend: String,
    /// Values at least this many bytes are spilled after publishing.
    /// Omit to keep everything resident.
    pub spill_threshold: Option<u64>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            spill_threshold: None,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                Ok(toml::from_str(&content)?)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// The parsed listen address.
    pub fn listen_addr(&self) -> anyhow::Result<NodeAddr> {
        Ok(self.node.listen_addr.parse()?)
    }

    /// The parsed seed addresses.
    pub fn seeds(&self) -> anyhow::Result<Vec<NodeAddr>> {
        self.cluster
            .seeds
            .iter()
            .map(|s| Ok(s.parse()?))
            .collect()
    }

    /// Effective heartbeat interval (default 1s).
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms.unwrap_or(1_000))
    }

    /// Effective staleness window (default 10s).
    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.cluster.staleness_ms.unwrap_or(10_000))
    }

    /// The configured spill backend.
    pub fn backend_kind(&self) -> BackendKind {
        match self.storage.backend.as_str() {
            "disk" => BackendKind::Disk,
            _ => BackendKind::Memory,
        }
    }

    /// Effective spill threshold.
    pub fn spill_threshold(&self) -> Option<usize> {
        self.storage.spill_threshold.map(|v| v as usize)
    }

    /// The runtime configuration derived from this file.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            heartbeat_interval: self.heartbeat_interval(),
            staleness: self.staleness(),
            spill_backend: self.backend_kind(),
            spill_threshold: self.spill_threshold(),
            ..RuntimeConfig::default()
        }
    }
}
