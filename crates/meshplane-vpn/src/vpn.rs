//! Global VPN lifecycle.

use ipnet::Ipv4Net;
use tracing::{info, warn};

use meshplane_alloc::cidr;
use meshplane_state::{CreationMethod, GlobalVpn, PoolScope, epoch_secs};
use meshplane_sync::{dispatch, mark_for_delete};

use crate::error::{VpnError, VpnResult};
use crate::names::{validate_name, validate_vpn_name};
use crate::service::VpnService;

/// Overrides for a new Global VPN; unset fields come from `[vpn_defaults]`.
#[derive(Debug, Clone, Default)]
pub struct CreateVpnParams {
    pub cidr: Option<String>,
    pub allocatable_cidr_suffix: Option<u8>,
    pub reserved_ips_for_non_cluster_use: Option<u64>,
    pub dns_suffix: Option<String>,
    pub gateway_endpoint: Option<String>,
}

impl VpnService {
    /// Create a Global VPN together with its gateway and cluster-local devices.
    pub async fn create_global_vpn(
        &self,
        account: &str,
        name: &str,
        params: CreateVpnParams,
    ) -> VpnResult<GlobalVpn> {
        validate_name("account", account)?;
        validate_vpn_name(name)?;
        let defaults = &self.config.vpn_defaults;
        let cidr_text = params.cidr.unwrap_or_else(|| defaults.cidr.clone());
        let base: Ipv4Net = cidr_text
            .parse()
            .map_err(|e| VpnError::InvalidConfig(format!("cidr {cidr_text}: {e}")))?;
        let suffix = params
            .allocatable_cidr_suffix
            .unwrap_or(defaults.allocatable_cidr_suffix);
        let reserved = params
            .reserved_ips_for_non_cluster_use
            .unwrap_or(defaults.reserved_ips_for_non_cluster_use);
        cidr::validate_layout(base, suffix, reserved)
            .map_err(|e| VpnError::InvalidConfig(e.to_string()))?;
        if cidr::device_ip_at(base, reserved, 1).is_none() {
            return Err(VpnError::InvalidConfig(format!(
                "{base} has no room for the gateway and cluster-local devices"
            )));
        }

        let now = epoch_secs();
        let vpn = GlobalVpn {
            account: account.to_string(),
            name: name.to_string(),
            cidr: base,
            allocatable_cidr_suffix: suffix,
            num_allocated_cluster_cidrs: 0,
            num_allocated_devices: 0,
            num_reserved_ips_for_non_cluster_use: reserved,
            gateway_device: format!("{name}-gateway"),
            cluster_local_device: format!("{name}-cluster-local"),
            dns_suffix: params.dns_suffix.unwrap_or_else(|| defaults.dns_suffix.clone()),
            created_at: now,
            updated_at: now,
        };
        self.store.create_vpn(&vpn).map_err(|e| {
            if e.is_conflict() {
                VpnError::already_exists("global vpn", format!("{account}/{name}"))
            } else {
                e.into()
            }
        })?;
        info!(%account, vpn = %name, cidr = %base, suffix, reserved, "global vpn created");

        let gateway_endpoint = params
            .gateway_endpoint
            .or_else(|| defaults.gateway_endpoint.clone());
        self.create_device_record(
            &vpn,
            &vpn.gateway_device,
            gateway_endpoint,
            CreationMethod::System,
        )
        .await?;
        self.create_device_record(&vpn, &vpn.cluster_local_device, None, CreationMethod::System)
            .await?;

        self.load_vpn(account, name)
    }

    pub fn get_global_vpn(&self, account: &str, name: &str) -> VpnResult<GlobalVpn> {
        self.load_vpn(account, name)
    }

    pub fn list_global_vpns(&self, account: &str) -> VpnResult<Vec<GlobalVpn>> {
        Ok(self.store.list_vpns(account)?)
    }

    /// Delete a Global VPN that no cluster or user device uses any more.
    ///
    /// System devices are removed directly, their addresses released, and
    /// every pool record of the VPN dropped.
    pub async fn delete_global_vpn(&self, account: &str, name: &str) -> VpnResult<()> {
        let vpn = self.load_vpn(account, name)?;
        let connections = self.store.list_connections(account, name)?;
        let devices = self.store.list_devices(account, name)?;
        let user_devices = devices
            .iter()
            .filter(|d| d.creation_method == CreationMethod::User)
            .count();
        if !connections.is_empty() || user_devices > 0 {
            return Err(VpnError::InUse {
                name: format!("{account}/{name}"),
                connections: connections.len(),
                devices: user_devices,
            });
        }

        for mut device in devices {
            mark_for_delete(&mut device, epoch_secs());
            if let Err(e) = dispatch(self.dispatcher.as_ref(), self.platform_cluster(), &device).await {
                warn!(
                    %account,
                    vpn = %name,
                    device = %device.name,
                    error = %e,
                    "system device delete not dispatched"
                );
            }
            self.store.delete_device(account, name, &device.name)?;
            self.allocator.release_device_ip(account, name, device.ip)?;
        }

        let purged = self.store.purge_pools(&PoolScope::new(account, name))?;
        self.store.delete_vpn(account, name)?;
        info!(%account, vpn = %vpn.name, purged, "global vpn deleted");
        Ok(())
    }
}
