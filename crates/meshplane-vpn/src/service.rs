//! VpnService: the entry point for every Global VPN mutation.
//!
//! Each call runs to completion against the state store; there is no
//! in-process scheduler. Mutations persist first and dispatch second, so a
//! failed dispatch leaves the record stored `InQueue` for a later resync.

use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

use meshplane_alloc::{Allocator, RetryPolicy};
use meshplane_core::MeshConfig;
use meshplane_state::{GlobalVpn, GlobalVpnConnection, GlobalVpnDevice, StateStore, epoch_secs};
use meshplane_sync::{ResourceDispatcher, dispatch, mark_for_apply};
use meshplane_topology::{MeshView, PeerTarget, plan};

use crate::error::{VpnError, VpnResult};

/// Allocation owner of a cluster's service CIDR.
pub(crate) fn cluster_owner(cluster: &str) -> String {
    format!("cluster/{cluster}")
}

/// Allocation owner of a cluster's mesh interface address.
pub(crate) fn gateway_owner(cluster: &str) -> String {
    format!("gateway/{cluster}")
}

pub(crate) fn device_owner(device: &str) -> String {
    format!("device/{device}")
}

/// Outcome of one topology pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyReport {
    /// Members whose peer list changed and was dispatched.
    pub updated: Vec<PeerTarget>,
    /// Members whose new peer list is stored but could not be dispatched.
    pub failed: Vec<PeerTarget>,
}

impl TopologyReport {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct VpnService {
    pub(crate) store: StateStore,
    pub(crate) allocator: Allocator,
    pub(crate) dispatcher: Arc<dyn ResourceDispatcher>,
    pub(crate) config: MeshConfig,
}

impl VpnService {
    pub fn new(store: StateStore, dispatcher: Arc<dyn ResourceDispatcher>, config: MeshConfig) -> Self {
        let allocator = Allocator::new(store.clone(), RetryPolicy::from(&config.allocator));
        Self {
            store,
            allocator,
            dispatcher,
            config,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Cluster hosting the gateway and every device record.
    pub(crate) fn platform_cluster(&self) -> &str {
        &self.config.sync.platform_cluster
    }

    pub(crate) fn load_vpn(&self, account: &str, name: &str) -> VpnResult<GlobalVpn> {
        self.store
            .get_vpn(account, name)?
            .ok_or_else(|| VpnError::not_found("global vpn", format!("{account}/{name}")))
    }

    pub(crate) fn load_connection(
        &self,
        account: &str,
        vpn: &str,
        cluster: &str,
    ) -> VpnResult<GlobalVpnConnection> {
        self.store
            .get_connection(account, vpn, cluster)?
            .ok_or_else(|| VpnError::not_found("connection", format!("{account}/{vpn}/{cluster}")))
    }

    pub(crate) fn load_device(&self, account: &str, vpn: &str, name: &str) -> VpnResult<GlobalVpnDevice> {
        self.store
            .get_device(account, vpn, name)?
            .ok_or_else(|| VpnError::not_found("device", format!("{account}/{vpn}/{name}")))
    }

    /// Return a device IP claimed by a mutation that then failed.
    pub(crate) fn release_ip_after_failure(&self, account: &str, vpn: &str, ip: Ipv4Addr) {
        match self.allocator.release_device_ip(account, vpn, ip) {
            Ok(_) => debug!(%account, %vpn, %ip, "device ip released after failed mutation"),
            Err(e) => warn!(%account, %vpn, %ip, error = %e, "device ip not released"),
        }
    }

    /// Return a cluster CIDR claimed by a mutation that then failed.
    pub(crate) fn release_cidr_after_failure(&self, account: &str, vpn: &str, cidr: Ipv4Net) {
        match self.allocator.release_cluster_cidr(account, vpn, cidr) {
            Ok(_) => debug!(%account, %vpn, %cidr, "cluster cidr released after failed mutation"),
            Err(e) => warn!(%account, %vpn, %cidr, error = %e, "cluster cidr not released"),
        }
    }

    /// Recompute every member's peers and dispatch the lists that changed.
    ///
    /// Dispatch failures are reported, not returned: the new peer list is
    /// already stored `InQueue` and a resync will deliver it.
    pub async fn sync_topology(&self, account: &str, vpn_name: &str) -> VpnResult<TopologyReport> {
        let vpn = self.load_vpn(account, vpn_name)?;
        let mut connections = self.store.list_connections(account, vpn_name)?;
        let mut devices = self.store.list_devices(account, vpn_name)?;

        let changes = plan(&MeshView {
            vpn: &vpn,
            connections: &connections,
            devices: &devices,
        });

        let mut report = TopologyReport::default();
        let now = epoch_secs();
        for change in changes {
            let result = match &change.target {
                PeerTarget::Connection(name) => {
                    let Some(conn) = connections.iter_mut().find(|c| &c.cluster_name == name) else {
                        continue;
                    };
                    conn.peers = change.peers;
                    mark_for_apply(conn, now);
                    self.store.put_connection(conn)?;
                    dispatch(self.dispatcher.as_ref(), &conn.cluster_name, &*conn).await
                }
                PeerTarget::Device(name) => {
                    let Some(device) = devices.iter_mut().find(|d| &d.name == name) else {
                        continue;
                    };
                    device.peers = change.peers;
                    mark_for_apply(device, now);
                    self.store.put_device(device)?;
                    dispatch(self.dispatcher.as_ref(), self.platform_cluster(), &*device).await
                }
            };
            match result {
                Ok(()) => report.updated.push(change.target),
                Err(e) => {
                    warn!(
                        %account,
                        vpn = %vpn_name,
                        target = %change.target,
                        error = %e,
                        "peer update not dispatched"
                    );
                    report.failed.push(change.target);
                }
            }
        }

        if !report.is_empty() {
            info!(
                %account,
                vpn = %vpn_name,
                updated = report.updated.len(),
                failed = report.failed.len(),
                "topology synced"
            );
        }
        Ok(report)
    }

    /// Store a created or patched connection with freshly computed peers,
    /// bring the rest of the mesh up to date, then dispatch it.
    pub(crate) async fn commit_connection(
        &self,
        vpn: &GlobalVpn,
        mut conn: GlobalVpnConnection,
    ) -> VpnResult<GlobalVpnConnection> {
        let mut connections = self.store.list_connections(&vpn.account, &vpn.name)?;
        connections.retain(|c| c.cluster_name != conn.cluster_name);
        connections.push(conn.clone());
        let devices = self.store.list_devices(&vpn.account, &vpn.name)?;

        conn.peers = MeshView {
            vpn,
            connections: &connections,
            devices: &devices,
        }
        .connection_peers(&conn);
        mark_for_apply(&mut conn, epoch_secs());
        self.store.put_connection(&conn)?;

        self.sync_topology(&vpn.account, &vpn.name).await?;
        dispatch(self.dispatcher.as_ref(), &conn.cluster_name, &conn).await?;
        Ok(conn)
    }

    /// Device counterpart of [`Self::commit_connection`].
    pub(crate) async fn commit_device(
        &self,
        vpn: &GlobalVpn,
        mut device: GlobalVpnDevice,
    ) -> VpnResult<GlobalVpnDevice> {
        let connections = self.store.list_connections(&vpn.account, &vpn.name)?;
        let mut devices = self.store.list_devices(&vpn.account, &vpn.name)?;
        devices.retain(|d| d.name != device.name);
        devices.push(device.clone());

        device.peers = MeshView {
            vpn,
            connections: &connections,
            devices: &devices,
        }
        .device_peers(&device);
        mark_for_apply(&mut device, epoch_secs());
        self.store.put_device(&device)?;

        self.sync_topology(&vpn.account, &vpn.name).await?;
        dispatch(self.dispatcher.as_ref(), self.platform_cluster(), &device).await?;
        Ok(device)
    }
}
