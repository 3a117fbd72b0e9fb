//! Cluster connections: a cluster's gateway membership in a Global VPN.

use tracing::{debug, info};

use meshplane_state::{
    GlobalVpnConnection, ObjectMeta, ResourceStatus, SyncStatus, Visibility, epoch_secs,
};
use meshplane_sync::{
    UpdateOutcome, dispatch, mark_agent_error, mark_for_delete, reconcile_update, resync,
};

use meshplane_topology::validate_public_key;

use crate::callbacks::{ConnectionUpdate, DeleteOutcome};
use crate::error::{VpnError, VpnResult};
use crate::names::validate_name;
use crate::service::{VpnService, cluster_owner, gateway_owner};

#[derive(Debug, Clone, Default)]
pub struct AttachParams {
    pub visibility: Visibility,
    /// Host under which the cluster's WireGuard node port is reachable.
    pub public_endpoint: Option<String>,
}

/// Fields of a connection that can be changed after attaching.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPatch {
    pub visibility: Option<Visibility>,
    /// `Some(None)` clears the endpoint.
    pub public_endpoint: Option<Option<String>>,
}

impl VpnService {
    /// Join a cluster to a Global VPN.
    ///
    /// Claims the cluster's service CIDR and its mesh interface address,
    /// then dispatches the connection to the cluster itself.
    pub async fn attach_cluster(
        &self,
        account: &str,
        vpn_name: &str,
        cluster: &str,
        params: AttachParams,
    ) -> VpnResult<GlobalVpnConnection> {
        validate_name("cluster", cluster)?;
        let vpn = self.load_vpn(account, vpn_name)?;
        if self.store.get_connection(account, vpn_name, cluster)?.is_some() {
            return Err(VpnError::already_exists(
                "connection",
                format!("{account}/{vpn_name}/{cluster}"),
            ));
        }

        let cluster_cidr = self
            .allocator
            .allocate_cluster_cidr(account, vpn_name, &cluster_owner(cluster))
            .await?;
        let gateway_ip = match self
            .allocator
            .allocate_device_ip(account, vpn_name, &gateway_owner(cluster))
            .await
        {
            Ok(ip) => ip,
            Err(e) => {
                self.release_cidr_after_failure(account, vpn_name, cluster_cidr);
                return Err(e.into());
            }
        };

        let now = epoch_secs();
        let conn = GlobalVpnConnection {
            account: account.to_string(),
            vpn_name: vpn_name.to_string(),
            cluster_name: cluster.to_string(),
            metadata: ObjectMeta::named(cluster),
            cluster_cidr,
            gateway_ip,
            public_endpoint: params.public_endpoint,
            visibility: params.visibility,
            wg: None,
            peers: Vec::new(),
            sync_status: SyncStatus::default(),
            status: ResourceStatus::default(),
            marked_for_deletion: false,
            created_at: now,
            updated_at: now,
        };
        info!(
            %account,
            vpn = %vpn_name,
            %cluster,
            %cluster_cidr,
            %gateway_ip,
            visibility = ?conn.visibility,
            "cluster attached"
        );
        match self.commit_connection(&vpn, conn).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                // A stored record keeps its claims until detach; an unstored
                // one would hold them forever.
                let stored = self.store.get_connection(account, vpn_name, cluster);
                if !matches!(stored, Ok(Some(_))) {
                    self.release_cidr_after_failure(account, vpn_name, cluster_cidr);
                    self.release_ip_after_failure(account, vpn_name, gateway_ip);
                }
                Err(e)
            }
        }
    }

    pub async fn update_connection(
        &self,
        account: &str,
        vpn_name: &str,
        cluster: &str,
        patch: ConnectionPatch,
    ) -> VpnResult<GlobalVpnConnection> {
        let vpn = self.load_vpn(account, vpn_name)?;
        let mut conn = self.load_connection(account, vpn_name, cluster)?;
        if conn.marked_for_deletion {
            return Err(VpnError::not_found(
                "connection",
                format!("{account}/{vpn_name}/{cluster}"),
            ));
        }
        if let Some(visibility) = patch.visibility {
            conn.visibility = visibility;
        }
        if let Some(endpoint) = patch.public_endpoint {
            conn.public_endpoint = endpoint;
        }
        self.commit_connection(&vpn, conn).await
    }

    /// Mark a connection for deletion and dispatch the delete to its cluster.
    ///
    /// Its CIDR and gateway IP stay claimed until the agent confirms through
    /// [`Self::on_connection_delete`].
    pub async fn detach_cluster(
        &self,
        account: &str,
        vpn_name: &str,
        cluster: &str,
    ) -> VpnResult<GlobalVpnConnection> {
        let mut conn = self.load_connection(account, vpn_name, cluster)?;
        if conn.marked_for_deletion {
            debug!(%account, vpn = %vpn_name, %cluster, "connection already marked for deletion");
            return Ok(conn);
        }

        mark_for_delete(&mut conn, epoch_secs());
        self.store.put_connection(&conn)?;
        self.sync_topology(account, vpn_name).await?;
        dispatch(self.dispatcher.as_ref(), cluster, &conn).await?;
        info!(%account, vpn = %vpn_name, %cluster, "cluster detach dispatched");
        Ok(conn)
    }

    pub fn get_connection(
        &self,
        account: &str,
        vpn_name: &str,
        cluster: &str,
    ) -> VpnResult<GlobalVpnConnection> {
        self.load_connection(account, vpn_name, cluster)
    }

    pub fn list_connections(&self, account: &str, vpn_name: &str) -> VpnResult<Vec<GlobalVpnConnection>> {
        Ok(self.store.list_connections(account, vpn_name)?)
    }

    /// Re-dispatch a connection's last desired action.
    pub async fn resync_connection(
        &self,
        account: &str,
        vpn_name: &str,
        cluster: &str,
    ) -> VpnResult<GlobalVpnConnection> {
        let mut conn = self.load_connection(account, vpn_name, cluster)?;
        let result = resync(self.dispatcher.as_ref(), cluster, &mut conn).await;
        self.store.put_connection(&conn)?;
        result?;
        Ok(conn)
    }

    // ── Agent callbacks ────────────────────────────────────────────

    /// Reconcile a cluster agent's report.
    ///
    /// An accepted report stores the agent's WireGuard parameters and
    /// rebuilds the mesh topology; a stale one re-dispatches the stored state.
    pub async fn on_connection_update(
        &self,
        account: &str,
        cluster: &str,
        report: ConnectionUpdate,
    ) -> VpnResult<UpdateOutcome> {
        if let Some(wg) = &report.wg {
            validate_public_key(&wg.public_key)?;
        }
        let mut conn = self.load_connection(account, &report.vpn, cluster)?;
        let outcome = reconcile_update(&mut conn, &report.update);
        match &outcome {
            UpdateOutcome::Resync { .. } => {
                let result = resync(self.dispatcher.as_ref(), cluster, &mut conn).await;
                self.store.put_connection(&conn)?;
                result?;
            }
            UpdateOutcome::Accepted { .. } => {
                if let Some(wg) = report.wg {
                    conn.wg = Some(wg);
                }
                self.store.put_connection(&conn)?;
                self.sync_topology(account, &report.vpn).await?;
            }
        }
        Ok(outcome)
    }

    /// The agent removed the connection. Completes a pending detach and
    /// returns its CIDR and gateway IP to the free pools.
    pub async fn on_connection_delete(
        &self,
        account: &str,
        cluster: &str,
        vpn_name: &str,
        timestamp: u64,
    ) -> VpnResult<DeleteOutcome> {
        let Some(mut conn) = self.store.get_connection(account, vpn_name, cluster)? else {
            debug!(%account, vpn = %vpn_name, %cluster, "delete for unknown connection ignored");
            return Ok(DeleteOutcome::Missing);
        };

        if !conn.marked_for_deletion {
            let result = resync(self.dispatcher.as_ref(), cluster, &mut conn).await;
            self.store.put_connection(&conn)?;
            result?;
            return Ok(DeleteOutcome::Resynced);
        }

        self.store.delete_connection(account, vpn_name, cluster)?;
        self.allocator
            .release_cluster_cidr(account, vpn_name, conn.cluster_cidr)?;
        self.allocator
            .release_device_ip(account, vpn_name, conn.gateway_ip)?;
        info!(
            %account,
            vpn = %vpn_name,
            %cluster,
            cidr = %conn.cluster_cidr,
            timestamp,
            "connection removed"
        );
        self.sync_topology(account, vpn_name).await?;
        Ok(DeleteOutcome::Removed)
    }

    pub fn on_connection_apply_error(
        &self,
        account: &str,
        cluster: &str,
        vpn_name: &str,
        error: &str,
        timestamp: u64,
    ) -> VpnResult<GlobalVpnConnection> {
        let mut conn = self.load_connection(account, vpn_name, cluster)?;
        mark_agent_error(&mut conn, error, timestamp);
        self.store.put_connection(&conn)?;
        Ok(conn)
    }
}
