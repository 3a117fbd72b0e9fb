//! Devices: WireGuard peer identities dispatched to the platform cluster.

use tracing::{debug, info};

use meshplane_state::{
    CreationMethod, GlobalVpn, GlobalVpnDevice, ObjectMeta, ResourceStatus, SyncStatus, epoch_secs,
};
use meshplane_sync::{
    AgentUpdate, UpdateOutcome, dispatch, mark_agent_error, mark_for_delete, reconcile_update,
    resync,
};
use meshplane_topology::{InterfaceConfig, generate_key_pair, render_wg_config};

use crate::callbacks::DeleteOutcome;
use crate::error::{VpnError, VpnResult};
use crate::names::validate_name;
use crate::service::{VpnService, device_owner};

/// Fields of a device that can be changed after creation.
#[derive(Debug, Clone, Default)]
pub struct DevicePatch {
    /// `Some(None)` clears the endpoint.
    pub public_endpoint: Option<Option<String>>,
}

impl VpnService {
    /// Allocate, key, store and dispatch a new device.
    pub(crate) async fn create_device_record(
        &self,
        vpn: &GlobalVpn,
        name: &str,
        public_endpoint: Option<String>,
        creation_method: CreationMethod,
    ) -> VpnResult<GlobalVpnDevice> {
        validate_name("device", name)?;
        if self.store.get_device(&vpn.account, &vpn.name, name)?.is_some() {
            return Err(VpnError::already_exists(
                "device",
                format!("{}/{}/{name}", vpn.account, vpn.name),
            ));
        }

        let ip = self
            .allocator
            .allocate_device_ip(&vpn.account, &vpn.name, &device_owner(name))
            .await?;
        let keys = generate_key_pair();
        let now = epoch_secs();
        let device = GlobalVpnDevice {
            account: vpn.account.clone(),
            vpn_name: vpn.name.clone(),
            name: name.to_string(),
            metadata: ObjectMeta::named(name),
            ip,
            private_key: Some(keys.private_key),
            public_key: Some(keys.public_key),
            public_endpoint,
            creation_method,
            peers: Vec::new(),
            sync_status: SyncStatus::default(),
            status: ResourceStatus::default(),
            marked_for_deletion: false,
            created_at: now,
            updated_at: now,
        };
        info!(
            account = %vpn.account,
            vpn = %vpn.name,
            device = %name,
            %ip,
            method = ?creation_method,
            "device created"
        );
        match self.commit_device(vpn, device).await {
            Ok(device) => Ok(device),
            Err(e) => {
                // Without a stored record nothing would ever release the IP.
                let stored = self.store.get_device(&vpn.account, &vpn.name, name);
                if !matches!(stored, Ok(Some(_))) {
                    self.release_ip_after_failure(&vpn.account, &vpn.name, ip);
                }
                Err(e)
            }
        }
    }

    /// Create a user device with a fresh key pair and mesh address.
    pub async fn create_device(
        &self,
        account: &str,
        vpn_name: &str,
        name: &str,
        public_endpoint: Option<String>,
    ) -> VpnResult<GlobalVpnDevice> {
        let vpn = self.load_vpn(account, vpn_name)?;
        self.create_device_record(&vpn, name, public_endpoint, CreationMethod::User)
            .await
    }

    pub async fn update_device(
        &self,
        account: &str,
        vpn_name: &str,
        name: &str,
        patch: DevicePatch,
    ) -> VpnResult<GlobalVpnDevice> {
        let vpn = self.load_vpn(account, vpn_name)?;
        let mut device = self.load_device(account, vpn_name, name)?;
        if device.marked_for_deletion {
            return Err(VpnError::not_found("device", format!("{account}/{vpn_name}/{name}")));
        }
        if let Some(endpoint) = patch.public_endpoint {
            device.public_endpoint = endpoint;
        }
        self.commit_device(&vpn, device).await
    }

    /// Mark a user device for deletion and dispatch the delete.
    ///
    /// The record and its IP stay until the agent confirms through
    /// [`Self::on_device_delete`].
    pub async fn delete_device(
        &self,
        account: &str,
        vpn_name: &str,
        name: &str,
    ) -> VpnResult<GlobalVpnDevice> {
        let mut device = self.load_device(account, vpn_name, name)?;
        if device.creation_method == CreationMethod::System {
            return Err(VpnError::SystemDevice(name.to_string()));
        }
        if device.marked_for_deletion {
            debug!(%account, vpn = %vpn_name, device = %name, "device already marked for deletion");
            return Ok(device);
        }

        mark_for_delete(&mut device, epoch_secs());
        self.store.put_device(&device)?;
        self.sync_topology(account, vpn_name).await?;
        dispatch(self.dispatcher.as_ref(), self.platform_cluster(), &device).await?;
        Ok(device)
    }

    pub fn get_device(&self, account: &str, vpn_name: &str, name: &str) -> VpnResult<GlobalVpnDevice> {
        self.load_device(account, vpn_name, name)
    }

    pub fn list_devices(&self, account: &str, vpn_name: &str) -> VpnResult<Vec<GlobalVpnDevice>> {
        Ok(self.store.list_devices(account, vpn_name)?)
    }

    /// Render the device's WireGuard configuration.
    ///
    /// DNS points at the cluster-local device when it exists.
    pub fn device_wg_config(&self, account: &str, vpn_name: &str, name: &str) -> VpnResult<String> {
        let vpn = self.load_vpn(account, vpn_name)?;
        let device = self.load_device(account, vpn_name, name)?;
        let private_key = device
            .private_key
            .clone()
            .ok_or_else(|| VpnError::InvalidConfig(format!("device {name} has no private key")))?;
        let dns = self
            .store
            .get_device(account, vpn_name, &vpn.cluster_local_device)?
            .filter(|d| d.name != device.name)
            .map(|d| d.ip);

        Ok(render_wg_config(
            &InterfaceConfig {
                address: device.ip,
                private_key,
                dns,
            },
            &device.peers,
        ))
    }

    /// Re-dispatch a device's last desired action.
    pub async fn resync_device(
        &self,
        account: &str,
        vpn_name: &str,
        name: &str,
    ) -> VpnResult<GlobalVpnDevice> {
        let mut device = self.load_device(account, vpn_name, name)?;
        let result = resync(self.dispatcher.as_ref(), self.platform_cluster(), &mut device).await;
        self.store.put_device(&device)?;
        result?;
        Ok(device)
    }

    // ── Agent callbacks ────────────────────────────────────────────

    pub async fn on_device_update(
        &self,
        account: &str,
        vpn_name: &str,
        name: &str,
        update: AgentUpdate,
    ) -> VpnResult<UpdateOutcome> {
        let mut device = self.load_device(account, vpn_name, name)?;
        let outcome = reconcile_update(&mut device, &update);
        match &outcome {
            UpdateOutcome::Resync { .. } => {
                let result =
                    resync(self.dispatcher.as_ref(), self.platform_cluster(), &mut device).await;
                self.store.put_device(&device)?;
                result?;
            }
            UpdateOutcome::Accepted { .. } => {
                self.store.put_device(&device)?;
                self.sync_topology(account, vpn_name).await?;
            }
        }
        Ok(outcome)
    }

    /// The agent removed the device. Completes a pending delete; a delete
    /// for a device that should exist triggers a resync instead.
    pub async fn on_device_delete(
        &self,
        account: &str,
        vpn_name: &str,
        name: &str,
        timestamp: u64,
    ) -> VpnResult<DeleteOutcome> {
        let Some(mut device) = self.store.get_device(account, vpn_name, name)? else {
            debug!(%account, vpn = %vpn_name, device = %name, "delete for unknown device ignored");
            return Ok(DeleteOutcome::Missing);
        };

        if !device.marked_for_deletion {
            let result =
                resync(self.dispatcher.as_ref(), self.platform_cluster(), &mut device).await;
            self.store.put_device(&device)?;
            result?;
            return Ok(DeleteOutcome::Resynced);
        }

        self.store.delete_device(account, vpn_name, name)?;
        self.allocator.release_device_ip(account, vpn_name, device.ip)?;
        info!(%account, vpn = %vpn_name, device = %name, ip = %device.ip, timestamp, "device removed");
        self.sync_topology(account, vpn_name).await?;
        Ok(DeleteOutcome::Removed)
    }

    pub fn on_device_apply_error(
        &self,
        account: &str,
        vpn_name: &str,
        name: &str,
        error: &str,
        timestamp: u64,
    ) -> VpnResult<GlobalVpnDevice> {
        let mut device = self.load_device(account, vpn_name, name)?;
        mark_agent_error(&mut device, error, timestamp);
        self.store.put_device(&device)?;
        Ok(device)
    }
}
