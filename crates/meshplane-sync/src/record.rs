//! The capability set the reconciler needs from a synchronized record.

use serde_json::json;

use meshplane_state::{
    CreationMethod, GlobalVpnConnection, GlobalVpnDevice, ObjectMeta, ResourceStatus, SyncStatus,
};

use crate::dispatcher::ResourceObject;

pub const API_VERSION: &str = "meshplane.io/v1";

/// A locally stored record whose desired state is mirrored by a remote agent.
pub trait SyncedRecord {
    fn kind(&self) -> &'static str;

    fn sync_status(&self) -> &SyncStatus;
    fn sync_status_mut(&mut self) -> &mut SyncStatus;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn resource_status_mut(&mut self) -> &mut ResourceStatus;

    fn marked_for_deletion(&self) -> bool;
    fn set_marked_for_deletion(&mut self, marked: bool);

    fn set_updated_at(&mut self, now: u64);

    /// The object handed to the dispatcher, without the version annotation.
    fn to_object(&self) -> ResourceObject;

    /// Passively mirrored records accept every agent report as-is.
    fn tracks_record_version(&self) -> bool {
        true
    }

    fn record_version(&self) -> u64 {
        self.sync_status().record_version
    }

    fn name(&self) -> &str {
        &self.metadata().name
    }
}

impl SyncedRecord for GlobalVpnConnection {
    fn kind(&self) -> &'static str {
        "GlobalVpnConnection"
    }

    fn sync_status(&self) -> &SyncStatus {
        &self.sync_status
    }

    fn sync_status_mut(&mut self) -> &mut SyncStatus {
        &mut self.sync_status
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn resource_status_mut(&mut self) -> &mut ResourceStatus {
        &mut self.status
    }

    fn marked_for_deletion(&self) -> bool {
        self.marked_for_deletion
    }

    fn set_marked_for_deletion(&mut self, marked: bool) {
        self.marked_for_deletion = marked;
    }

    fn set_updated_at(&mut self, now: u64) {
        self.updated_at = now;
    }

    fn to_object(&self) -> ResourceObject {
        ResourceObject {
            api_version: API_VERSION.to_string(),
            kind: self.kind().to_string(),
            metadata: self.metadata.clone(),
            spec: json!({
                "globalVpn": self.vpn_name,
                "clusterCidr": self.cluster_cidr,
                "gatewayIp": self.gateway_ip,
                "visibility": self.visibility,
                "publicEndpoint": self.public_endpoint,
                "peers": self.peers,
            }),
        }
    }
}

impl SyncedRecord for GlobalVpnDevice {
    fn kind(&self) -> &'static str {
        "GlobalVpnDevice"
    }

    fn sync_status(&self) -> &SyncStatus {
        &self.sync_status
    }

    fn sync_status_mut(&mut self) -> &mut SyncStatus {
        &mut self.sync_status
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn resource_status_mut(&mut self) -> &mut ResourceStatus {
        &mut self.status
    }

    fn marked_for_deletion(&self) -> bool {
        self.marked_for_deletion
    }

    fn set_marked_for_deletion(&mut self, marked: bool) {
        self.marked_for_deletion = marked;
    }

    fn set_updated_at(&mut self, now: u64) {
        self.updated_at = now;
    }

    fn to_object(&self) -> ResourceObject {
        // Only system devices run inside the platform cluster and need their key there.
        let private_key = match self.creation_method {
            CreationMethod::System => self.private_key.clone(),
            CreationMethod::User => None,
        };
        ResourceObject {
            api_version: API_VERSION.to_string(),
            kind: self.kind().to_string(),
            metadata: self.metadata.clone(),
            spec: json!({
                "globalVpn": self.vpn_name,
                "ip": self.ip,
                "publicKey": self.public_key,
                "privateKey": private_key,
                "publicEndpoint": self.public_endpoint,
                "creationMethod": self.creation_method,
                "peers": self.peers,
            }),
        }
    }
}
