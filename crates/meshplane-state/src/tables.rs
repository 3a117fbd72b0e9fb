//! redb table definitions for the meshplane state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Entity keys follow `{account}/{vpn}` or `{account}/{vpn}/{name}`; pool keys
//! follow `{account}/{vpn}/{network:08x}/{prefix:02}`.

use redb::TableDefinition;

use crate::types::PoolKind;

pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Global VPNs keyed by `{account}/{name}`.
pub const GLOBAL_VPNS: JsonTable = TableDefinition::new("global_vpns");

/// Connections keyed by `{account}/{vpn}/{cluster}`.
pub const CONNECTIONS: JsonTable = TableDefinition::new("connections");

/// Devices keyed by `{account}/{vpn}/{device}`.
pub const DEVICES: JsonTable = TableDefinition::new("devices");

/// Released device IPs.
pub const FREE_IPS: JsonTable = TableDefinition::new("free_ips");

/// Claimed device IPs; the key is the uniqueness index.
pub const CLAIM_IPS: JsonTable = TableDefinition::new("claim_ips");

/// Device IP claims keyed by `{account}/{vpn}/{owner}`.
pub const CLAIM_IP_OWNERS: JsonTable = TableDefinition::new("claim_ip_owners");

/// Released cluster service CIDRs.
pub const FREE_CLUSTER_CIDRS: JsonTable = TableDefinition::new("free_cluster_cidrs");

/// Claimed cluster service CIDRs; the key is the uniqueness index.
pub const CLAIM_CLUSTER_CIDRS: JsonTable = TableDefinition::new("claim_cluster_cidrs");

/// Cluster CIDR claims keyed by `{account}/{vpn}/{owner}`.
pub const CLAIM_CLUSTER_CIDR_OWNERS: JsonTable =
    TableDefinition::new("claim_cluster_cidr_owners");

/// The free/claim/owner triple backing one allocation domain.
#[derive(Clone, Copy)]
pub struct PoolTables {
    pub free: JsonTable,
    pub claims: JsonTable,
    pub owners: JsonTable,
}

impl PoolTables {
    pub fn of(kind: PoolKind) -> Self {
        match kind {
            PoolKind::DeviceIp => Self {
                free: FREE_IPS,
                claims: CLAIM_IPS,
                owners: CLAIM_IP_OWNERS,
            },
            PoolKind::ClusterCidr => Self {
                free: FREE_CLUSTER_CIDRS,
                claims: CLAIM_CLUSTER_CIDRS,
                owners: CLAIM_CLUSTER_CIDR_OWNERS,
            },
        }
    }
}

pub const ALL_TABLES: [JsonTable; 9] = [
    GLOBAL_VPNS,
    CONNECTIONS,
    DEVICES,
    FREE_IPS,
    CLAIM_IPS,
    CLAIM_IP_OWNERS,
    FREE_CLUSTER_CIDRS,
    CLAIM_CLUSTER_CIDRS,
    CLAIM_CLUSTER_CIDR_OWNERS,
];
