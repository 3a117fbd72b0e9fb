//! The address pool seam the allocator runs against.

use std::collections::HashSet;

use ipnet::Ipv4Net;
use meshplane_state::{
    ClaimRecord, FreeRecord, GlobalVpn, PoolKind, PoolScope, StateResult, StateStore, VpnCounter,
    epoch_secs,
};

use crate::cidr;
use crate::error::{AllocError, AllocResult};

/// One allocation domain of one Global VPN.
///
/// Implementations must make `create_claim` fail with a conflict when the
/// unit is already claimed; the allocator's correctness rests on that.
pub trait AddressPool {
    fn kind(&self) -> PoolKind;

    /// The CIDR units are carved from, for error reporting.
    fn pool_cidr(&self) -> Ipv4Net;

    fn existing_claim(&self, owner: &str) -> StateResult<Option<Ipv4Net>>;

    fn find_free(&self, exclude: &HashSet<Ipv4Net>) -> StateResult<Option<Ipv4Net>>;

    /// Current value of the running allocation counter.
    fn allocated(&self) -> AllocResult<u64>;

    /// The unit minted at counter value `allocated`, or `None` past the end.
    fn candidate(&self, allocated: u64) -> Option<Ipv4Net>;

    fn create_free(&self, unit: Ipv4Net) -> StateResult<()>;

    /// Move the counter past `observed`. Returns the new counter value.
    fn advance(&self, observed: u64) -> StateResult<u64>;

    fn create_claim(&self, unit: Ipv4Net, owner: &str) -> StateResult<()>;

    /// Return a claimed unit to the free pool.
    fn release(&self, unit: Ipv4Net) -> StateResult<bool>;
}

/// [`AddressPool`] over the redb state store.
///
/// Holds a snapshot of the VPN's immutable layout; counters are always
/// read from and advanced in the store.
#[derive(Clone)]
pub struct StorePool {
    store: StateStore,
    kind: PoolKind,
    scope: PoolScope,
    cidr: Ipv4Net,
    suffix: u8,
    reserved: u64,
}

impl StorePool {
    pub fn new(store: StateStore, kind: PoolKind, vpn: &GlobalVpn) -> Self {
        Self {
            store,
            kind,
            scope: PoolScope::new(&vpn.account, &vpn.name),
            cidr: vpn.cidr,
            suffix: vpn.allocatable_cidr_suffix,
            reserved: vpn.num_reserved_ips_for_non_cluster_use,
        }
    }

    /// Load the VPN and build its pool for `kind`.
    pub fn load(store: &StateStore, kind: PoolKind, account: &str, vpn: &str) -> AllocResult<Self> {
        let record = store
            .get_vpn(account, vpn)?
            .ok_or_else(|| AllocError::VpnNotFound(format!("{account}/{vpn}")))?;
        Ok(Self::new(store.clone(), kind, &record))
    }

    pub fn scope(&self) -> &PoolScope {
        &self.scope
    }

    fn counter(&self) -> VpnCounter {
        match self.kind {
            PoolKind::DeviceIp => VpnCounter::Devices,
            PoolKind::ClusterCidr => VpnCounter::ClusterCidrs,
        }
    }
}

impl AddressPool for StorePool {
    fn kind(&self) -> PoolKind {
        self.kind
    }

    fn pool_cidr(&self) -> Ipv4Net {
        self.cidr
    }

    fn existing_claim(&self, owner: &str) -> StateResult<Option<Ipv4Net>> {
        Ok(self
            .store
            .find_claim_by_owner(self.kind, &self.scope, owner)?
            .map(|claim| claim.unit))
    }

    fn find_free(&self, exclude: &HashSet<Ipv4Net>) -> StateResult<Option<Ipv4Net>> {
        Ok(self
            .store
            .find_free(self.kind, &self.scope, exclude)?
            .map(|free| free.unit))
    }

    fn allocated(&self) -> AllocResult<u64> {
        let vpn = self
            .store
            .get_vpn(&self.scope.account, &self.scope.vpn)?
            .ok_or_else(|| {
                AllocError::VpnNotFound(format!("{}/{}", self.scope.account, self.scope.vpn))
            })?;
        Ok(vpn.counter(self.counter()))
    }

    fn candidate(&self, allocated: u64) -> Option<Ipv4Net> {
        match self.kind {
            PoolKind::DeviceIp => cidr::device_ip_at(self.cidr, self.reserved, allocated),
            PoolKind::ClusterCidr => {
                cidr::cluster_cidr_at(self.cidr, self.suffix, self.reserved, allocated)
            }
        }
    }

    fn create_free(&self, unit: Ipv4Net) -> StateResult<()> {
        self.store.create_free(
            self.kind,
            &FreeRecord {
                scope: self.scope.clone(),
                unit,
                created_at: epoch_secs(),
            },
        )
    }

    fn advance(&self, observed: u64) -> StateResult<u64> {
        self.store.advance_vpn_counter(
            &self.scope.account,
            &self.scope.vpn,
            self.counter(),
            observed,
        )
    }

    fn create_claim(&self, unit: Ipv4Net, owner: &str) -> StateResult<()> {
        self.store.create_claim(
            self.kind,
            &ClaimRecord {
                scope: self.scope.clone(),
                unit,
                claimed_by: owner.to_string(),
                claimed_at: epoch_secs(),
            },
        )
    }

    fn release(&self, unit: Ipv4Net) -> StateResult<bool> {
        self.store.release_claim(self.kind, &self.scope, &unit)
    }
}
