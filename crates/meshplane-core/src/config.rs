//! meshplane.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct MeshConfig {
    pub store: StoreConfig,
    pub allocator: AllocatorConfig,
    pub vpn_defaults: VpnDefaults,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the redb database file.
    pub path: PathBuf,
}

/// Retry policy of the address allocator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Upper bound on loop iterations for a single allocation.
    pub max_attempts: u32,
    /// Base delay after a lost claim race.
    pub retry_delay_ms: u64,
    /// Random extra delay added on top of `retry_delay_ms`.
    pub retry_jitter_ms: u64,
}

/// Parameters applied to newly created Global VPNs unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VpnDefaults {
    pub cidr: String,
    pub allocatable_cidr_suffix: u8,
    pub reserved_ips_for_non_cluster_use: u64,
    pub dns_suffix: String,
    /// `host:port` of the central gateway device, if it is publicly reachable.
    pub gateway_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Cluster that hosts the gateway and device peers.
    pub platform_cluster: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/meshplane/meshplane.redb"),
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 128,
            retry_delay_ms: 20,
            retry_jitter_ms: 30,
        }
    }
}

impl Default for VpnDefaults {
    fn default() -> Self {
        Self {
            cidr: "100.64.0.0/10".to_string(),
            allocatable_cidr_suffix: 24,
            reserved_ips_for_non_cluster_use: 65536,
            dns_suffix: "mesh.internal".to_string(),
            gateway_endpoint: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            platform_cluster: "platform".to_string(),
        }
    }
}

impl MeshConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MeshConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Read `path` when it exists, fall back to defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) if p.exists() => Self::from_file(p),
            _ => Ok(Self::default()),
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
