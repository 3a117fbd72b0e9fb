//! Domain types for the meshplane state store.
//!
//! These types represent the persisted state of Global VPNs, their
//! connections and devices, and the free/claim ledgers backing address
//! allocation. All types are serializable to/from JSON for storage in
//! redb tables.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Account (tenant) name.
pub type AccountName = String;

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Sync status ────────────────────────────────────────────────────

/// Desired action queued for the remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    #[default]
    Apply,
    Delete,
}

/// Where a synchronized record stands relative to its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    InQueue,
    UpdatedAtAgent,
    DeletingAtAgent,
    ErroredAtAgent,
    ReceivedUpdateFromAgent,
}

/// Sync bookkeeping embedded in every remotely dispatched record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncStatus {
    pub state: SyncState,
    pub action: SyncAction,
    /// Monotonic per-record version; 0 means never dispatched.
    pub record_version: u64,
    /// Unix timestamp of the last accepted agent message.
    pub last_synced_at: Option<u64>,
    pub error: Option<String>,
}

/// Kubernetes-style object metadata mirrored between control plane and agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub generation: i64,
}

impl ObjectMeta {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// Lifecycle of a resource as reported by its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourcePhase {
    #[default]
    Applying,
    Ready,
    Deleting,
}

/// Agent-reported status of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceStatus {
    pub phase: ResourcePhase,
    pub message: Option<String>,
    /// Unix timestamp at which the agent observed this status.
    pub observed_at: u64,
}

// ── WireGuard peers ───────────────────────────────────────────────

/// One `[Peer]` entry of a WireGuard interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Mesh address of the peer's interface.
    pub ip: Option<Ipv4Addr>,
    pub public_key: String,
    /// `host:port`; `None` for peers that can only be reached through a relay.
    pub endpoint: Option<String>,
    pub dns_suffix: Option<String>,
    pub allowed_ips: Vec<Ipv4Net>,
}

// ── Global VPN ────────────────────────────────────────────────────

/// A per-account mesh network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalVpn {
    pub account: AccountName,
    pub name: String,
    /// Base CIDR every device IP and cluster CIDR is carved from.
    pub cidr: Ipv4Net,
    /// Prefix length of cluster CIDR blocks.
    pub allocatable_cidr_suffix: u8,
    pub num_allocated_cluster_cidrs: u64,
    pub num_allocated_devices: u64,
    /// Leading addresses of `cidr` kept for devices (non-cluster use).
    pub num_reserved_ips_for_non_cluster_use: u64,
    pub gateway_device: String,
    pub cluster_local_device: String,
    pub dns_suffix: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Allocation counters of a [`GlobalVpn`], advanced only through the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnCounter {
    ClusterCidrs,
    Devices,
}

impl GlobalVpn {
    /// Build the composite key for the global VPNs table.
    pub fn table_key(&self) -> String {
        vpn_key(&self.account, &self.name)
    }

    pub fn counter(&self, counter: VpnCounter) -> u64 {
        match counter {
            VpnCounter::ClusterCidrs => self.num_allocated_cluster_cidrs,
            VpnCounter::Devices => self.num_allocated_devices,
        }
    }

    fn counter_mut(&mut self, counter: VpnCounter) -> &mut u64 {
        match counter {
            VpnCounter::ClusterCidrs => &mut self.num_allocated_cluster_cidrs,
            VpnCounter::Devices => &mut self.num_allocated_devices,
        }
    }

    /// Advance `counter` by one if it still reads `observed`.
    ///
    /// Returns whether the counter moved.
    pub(crate) fn advance_counter(&mut self, counter: VpnCounter, observed: u64) -> bool {
        let slot = self.counter_mut(counter);
        if *slot == observed {
            *slot += 1;
            true
        } else {
            false
        }
    }
}

// ── Connection ────────────────────────────────────────────────────

/// Whether a cluster gateway is directly reachable by other clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

/// WireGuard parameters reported by a cluster's agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgParams {
    pub public_key: String,
    pub node_port: Option<u16>,
}

/// A cluster's gateway membership in a Global VPN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalVpnConnection {
    pub account: AccountName,
    pub vpn_name: String,
    pub cluster_name: String,
    pub metadata: ObjectMeta,
    pub cluster_cidr: Ipv4Net,
    /// Mesh address of the cluster's gateway interface.
    pub gateway_ip: Ipv4Addr,
    /// Public host of the gateway, combined with the reported node port.
    pub public_endpoint: Option<String>,
    pub visibility: Visibility,
    pub wg: Option<WgParams>,
    pub peers: Vec<Peer>,
    pub sync_status: SyncStatus,
    pub status: ResourceStatus,
    pub marked_for_deletion: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl GlobalVpnConnection {
    /// Build the composite key for the connections table.
    pub fn table_key(&self) -> String {
        child_key(&self.account, &self.vpn_name, &self.cluster_name)
    }

    pub fn public_key(&self) -> Option<&str> {
        self.wg
            .as_ref()
            .map(|wg| wg.public_key.as_str())
            .filter(|k| !k.is_empty())
    }

    /// `host:port` once both the host and the node port are known.
    pub fn endpoint(&self) -> Option<String> {
        let host = self.public_endpoint.as_deref()?;
        let port = self.wg.as_ref()?.node_port?;
        Some(format!("{host}:{port}"))
    }
}

// ── Device ────────────────────────────────────────────────────────

/// How a device came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationMethod {
    /// Created by the control plane together with its Global VPN.
    System,
    User,
}

/// A single WireGuard peer identity in a Global VPN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalVpnDevice {
    pub account: AccountName,
    pub vpn_name: String,
    pub name: String,
    pub metadata: ObjectMeta,
    pub ip: Ipv4Addr,
    pub private_key: Option<String>,
    pub public_key: Option<String>,
    pub public_endpoint: Option<String>,
    pub creation_method: CreationMethod,
    pub peers: Vec<Peer>,
    pub sync_status: SyncStatus,
    pub status: ResourceStatus,
    pub marked_for_deletion: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl GlobalVpnDevice {
    /// Build the composite key for the devices table.
    pub fn table_key(&self) -> String {
        child_key(&self.account, &self.vpn_name, &self.name)
    }

    pub fn public_key(&self) -> Option<&str> {
        self.public_key.as_deref().filter(|k| !k.is_empty())
    }
}

// ── Address pools ─────────────────────────────────────────────────

/// The two allocation domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    DeviceIp,
    ClusterCidr,
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolKind::DeviceIp => f.write_str("device-ip"),
            PoolKind::ClusterCidr => f.write_str("cluster-cidr"),
        }
    }
}

/// (account, Global VPN) pair every pool record is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolScope {
    pub account: AccountName,
    pub vpn: String,
}

impl PoolScope {
    pub fn new(account: &str, vpn: &str) -> Self {
        Self {
            account: account.to_string(),
            vpn: vpn.to_string(),
        }
    }

    pub fn prefix(&self) -> String {
        format!("{}/{}/", self.account, self.vpn)
    }
}

/// A released unit waiting to be reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeRecord {
    pub scope: PoolScope,
    /// A `/32` for device IPs, a cluster-sized block for CIDRs.
    pub unit: Ipv4Net,
    pub created_at: u64,
}

/// A unit currently owned by `claimed_by`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub scope: PoolScope,
    pub unit: Ipv4Net,
    pub claimed_by: String,
    pub claimed_at: u64,
}

pub type FreeIp = FreeRecord;
pub type ClaimIp = ClaimRecord;
pub type FreeClusterSvcCidr = FreeRecord;
pub type ClaimClusterSvcCidr = ClaimRecord;

impl FreeRecord {
    pub fn table_key(&self) -> String {
        unit_key(&self.scope, &self.unit)
    }
}

impl ClaimRecord {
    pub fn table_key(&self) -> String {
        unit_key(&self.scope, &self.unit)
    }

    pub fn owner_key(&self) -> String {
        owner_key(&self.scope, &self.claimed_by)
    }
}

// ── Keys ──────────────────────────────────────────────────────────

pub fn vpn_key(account: &str, vpn: &str) -> String {
    format!("{account}/{vpn}")
}

/// Key of a connection or device: `{account}/{vpn}/{name}`.
pub fn child_key(account: &str, vpn: &str, name: &str) -> String {
    format!("{account}/{vpn}/{name}")
}

/// Pool key; the hex network address keeps iteration in numeric order.
pub fn unit_key(scope: &PoolScope, unit: &Ipv4Net) -> String {
    format!(
        "{}{:08x}/{:02}",
        scope.prefix(),
        u32::from(unit.network()),
        unit.prefix_len()
    )
}

pub fn owner_key(scope: &PoolScope, owner: &str) -> String {
    format!("{}{owner}", scope.prefix())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_keys_sort_numerically() {
        let scope = PoolScope::new("acc", "default");
        let low: Ipv4Net = "10.0.0.2/32".parse().unwrap();
        let high: Ipv4Net = "10.0.0.10/32".parse().unwrap();
        assert!(unit_key(&scope, &low) < unit_key(&scope, &high));
    }

    #[test]
    fn connection_endpoint_requires_host_and_port() {
        let mut conn = GlobalVpnConnection {
            account: "acc".to_string(),
            vpn_name: "default".to_string(),
            cluster_name: "c1".to_string(),
            metadata: ObjectMeta::named("c1"),
            cluster_cidr: "10.1.0.0/24".parse().unwrap(),
            gateway_ip: "10.0.0.5".parse().unwrap(),
            public_endpoint: Some("1.2.3.4".to_string()),
            visibility: Visibility::Public,
            wg: None,
            peers: vec![],
            sync_status: SyncStatus::default(),
            status: ResourceStatus::default(),
            marked_for_deletion: false,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(conn.endpoint(), None);

        conn.wg = Some(WgParams {
            public_key: "pk".to_string(),
            node_port: Some(31820),
        });
        assert_eq!(conn.endpoint().as_deref(), Some("1.2.3.4:31820"));
        assert_eq!(conn.public_key(), Some("pk"));

        // An empty key means the agent has not finished its key exchange.
        conn.wg = Some(WgParams {
            public_key: String::new(),
            node_port: Some(31820),
        });
        assert_eq!(conn.public_key(), None);
    }

    #[test]
    fn counter_advances_only_from_observed_value() {
        let mut vpn = GlobalVpn {
            account: "acc".to_string(),
            name: "default".to_string(),
            cidr: "10.0.0.0/16".parse().unwrap(),
            allocatable_cidr_suffix: 24,
            num_allocated_cluster_cidrs: 0,
            num_allocated_devices: 3,
            num_reserved_ips_for_non_cluster_use: 256,
            gateway_device: "gateway".to_string(),
            cluster_local_device: "cluster-local".to_string(),
            dns_suffix: "mesh.internal".to_string(),
            created_at: 0,
            updated_at: 0,
        };
        assert!(!vpn.advance_counter(VpnCounter::Devices, 2));
        assert!(vpn.advance_counter(VpnCounter::Devices, 3));
        assert_eq!(vpn.counter(VpnCounter::Devices), 4);
        assert_eq!(vpn.counter(VpnCounter::ClusterCidrs), 0);
    }
}
