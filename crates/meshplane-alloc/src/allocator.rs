//! The allocation loop: reuse a claim, take a free unit, or extend the pool.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use ipnet::Ipv4Net;
use rand::Rng;
use tracing::{debug, info, warn};

use meshplane_core::AllocatorConfig;
use meshplane_state::{PoolKind, StateStore};

use crate::error::{AllocError, AllocResult};
use crate::pool::{AddressPool, StorePool};

/// Bounds and pacing of the allocation loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Every loop iteration counts, whether it mints, reuses or loses a race.
    pub max_attempts: u32,
    pub delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&AllocatorConfig::default())
    }
}

impl From<&AllocatorConfig> for RetryPolicy {
    fn from(config: &AllocatorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: Duration::from_millis(config.retry_delay_ms),
            jitter: Duration::from_millis(config.retry_jitter_ms),
        }
    }
}

impl RetryPolicy {
    /// No sleeping between attempts (for testing).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

/// Hands out device IPs and cluster CIDRs for Global VPNs.
#[derive(Clone)]
pub struct Allocator {
    store: StateStore,
    policy: RetryPolicy,
}

impl Allocator {
    pub fn new(store: StateStore, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Claim a device IP for `owner`. Calling again for the same owner
    /// returns the same IP.
    pub async fn allocate_device_ip(
        &self,
        account: &str,
        vpn: &str,
        owner: &str,
    ) -> AllocResult<Ipv4Addr> {
        let pool = StorePool::load(&self.store, PoolKind::DeviceIp, account, vpn)?;
        let unit = self.allocate(&pool, owner).await?;
        Ok(unit.addr())
    }

    /// Claim a cluster service CIDR for `owner`. Calling again for the same
    /// owner returns the same block.
    pub async fn allocate_cluster_cidr(
        &self,
        account: &str,
        vpn: &str,
        owner: &str,
    ) -> AllocResult<Ipv4Net> {
        let pool = StorePool::load(&self.store, PoolKind::ClusterCidr, account, vpn)?;
        self.allocate(&pool, owner).await
    }

    /// Return a device IP to the free pool.
    pub fn release_device_ip(&self, account: &str, vpn: &str, ip: Ipv4Addr) -> AllocResult<bool> {
        let pool = StorePool::load(&self.store, PoolKind::DeviceIp, account, vpn)?;
        self.add_to_free_pool(&pool, Ipv4Net::from(ip))
    }

    /// Return a cluster CIDR to the free pool.
    pub fn release_cluster_cidr(&self, account: &str, vpn: &str, cidr: Ipv4Net) -> AllocResult<bool> {
        let pool = StorePool::load(&self.store, PoolKind::ClusterCidr, account, vpn)?;
        self.add_to_free_pool(&pool, cidr)
    }

    pub fn add_to_free_pool<P: AddressPool>(&self, pool: &P, unit: Ipv4Net) -> AllocResult<bool> {
        let released = pool.release(unit)?;
        if released {
            info!(pool = %pool.kind(), %unit, "unit returned to free pool");
        } else {
            warn!(pool = %pool.kind(), %unit, "release of unclaimed unit ignored");
        }
        Ok(released)
    }

    /// Run the allocation loop against `pool` for `owner`.
    pub async fn allocate<P: AddressPool + Sync>(&self, pool: &P, owner: &str) -> AllocResult<Ipv4Net> {
        let kind = pool.kind();
        let mut excluded: HashSet<Ipv4Net> = HashSet::new();

        for attempt in 1..=self.policy.max_attempts {
            if let Some(unit) = pool.existing_claim(owner)? {
                debug!(pool = %kind, %owner, %unit, "owner already holds a claim");
                return Ok(unit);
            }

            let Some(unit) = pool.find_free(&excluded)? else {
                let observed = pool.allocated()?;
                let candidate =
                    pool.candidate(observed)
                        .ok_or_else(|| AllocError::AddressSpaceExhausted {
                            pool: kind,
                            cidr: pool.pool_cidr(),
                        })?;
                let minted = match pool.create_free(candidate) {
                    Ok(()) => true,
                    Err(e) if e.is_conflict() => false,
                    Err(e) => return Err(e.into()),
                };
                let counter = pool.advance(observed)?;
                debug!(pool = %kind, %candidate, minted, counter, attempt, "extended pool");
                if !minted {
                    self.backoff().await;
                }
                continue;
            };

            match pool.create_claim(unit, owner) {
                Ok(()) => {
                    info!(pool = %kind, %owner, %unit, attempt, "unit claimed");
                    return Ok(unit);
                }
                Err(e) if e.is_conflict() => {
                    debug!(pool = %kind, %owner, %unit, attempt, "lost claim race, retrying");
                    excluded.insert(unit);
                    self.backoff().await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(pool = %kind, %owner, attempts = self.policy.max_attempts, "allocation retries exhausted");
        Err(AllocError::RetriesExhausted {
            attempts: self.policy.max_attempts,
        })
    }

    async fn backoff(&self) {
        let jitter_ms = self.policy.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        let wait = self.policy.delay + Duration::from_millis(extra);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use meshplane_state::{GlobalVpn, PoolScope, StateResult};

    fn test_vpn(cidr: &str, suffix: u8, reserved: u64) -> GlobalVpn {
        GlobalVpn {
            account: "acc".to_string(),
            name: "default".to_string(),
            cidr: cidr.parse().unwrap(),
            allocatable_cidr_suffix: suffix,
            num_allocated_cluster_cidrs: 0,
            num_allocated_devices: 0,
            num_reserved_ips_for_non_cluster_use: reserved,
            gateway_device: "gateway".to_string(),
            cluster_local_device: "cluster-local".to_string(),
            dns_suffix: "mesh.internal".to_string(),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn setup(cidr: &str, suffix: u8, reserved: u64) -> (StateStore, Allocator) {
        let store = StateStore::open_in_memory().unwrap();
        store.create_vpn(&test_vpn(cidr, suffix, reserved)).unwrap();
        let allocator = Allocator::new(store.clone(), RetryPolicy::immediate(64));
        (store, allocator)
    }

    /// Pool where a competing writer claims the unit right before us.
    struct RacingPool {
        inner: StorePool,
        steals_left: AtomicU32,
        stolen: AtomicU32,
    }

    impl RacingPool {
        fn new(inner: StorePool, steals: u32) -> Self {
            Self {
                inner,
                steals_left: AtomicU32::new(steals),
                stolen: AtomicU32::new(0),
            }
        }
    }

    impl AddressPool for RacingPool {
        fn kind(&self) -> PoolKind {
            self.inner.kind()
        }
        fn pool_cidr(&self) -> Ipv4Net {
            self.inner.pool_cidr()
        }
        fn existing_claim(&self, owner: &str) -> StateResult<Option<Ipv4Net>> {
            self.inner.existing_claim(owner)
        }
        fn find_free(&self, exclude: &HashSet<Ipv4Net>) -> StateResult<Option<Ipv4Net>> {
            self.inner.find_free(exclude)
        }
        fn allocated(&self) -> AllocResult<u64> {
            self.inner.allocated()
        }
        fn candidate(&self, allocated: u64) -> Option<Ipv4Net> {
            self.inner.candidate(allocated)
        }
        fn create_free(&self, unit: Ipv4Net) -> StateResult<()> {
            self.inner.create_free(unit)
        }
        fn advance(&self, observed: u64) -> StateResult<u64> {
            self.inner.advance(observed)
        }
        fn create_claim(&self, unit: Ipv4Net, owner: &str) -> StateResult<()> {
            if self.steals_left.load(Ordering::SeqCst) > 0 {
                self.steals_left.fetch_sub(1, Ordering::SeqCst);
                let n = self.stolen.fetch_add(1, Ordering::SeqCst);
                self.inner.create_claim(unit, &format!("racer-{n}"))?;
            }
            self.inner.create_claim(unit, owner)
        }
        fn release(&self, unit: Ipv4Net) -> StateResult<bool> {
            self.inner.release(unit)
        }
    }

    #[tokio::test]
    async fn device_ips_are_sequential() {
        let (_store, allocator) = setup("10.0.0.0/16", 24, 256);

        let a = allocator.allocate_device_ip("acc", "default", "a").await.unwrap();
        let b = allocator.allocate_device_ip("acc", "default", "b").await.unwrap();
        assert_eq!(a, "10.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(b, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn allocation_is_idempotent_per_owner() {
        let (store, allocator) = setup("10.0.0.0/16", 24, 256);

        let first = allocator.allocate_device_ip("acc", "default", "laptop").await.unwrap();
        let second = allocator.allocate_device_ip("acc", "default", "laptop").await.unwrap();
        assert_eq!(first, second);

        let vpn = store.get_vpn("acc", "default").unwrap().unwrap();
        assert_eq!(vpn.num_allocated_devices, 1);
    }

    #[tokio::test]
    async fn released_unit_is_reused_before_extending() {
        let (store, allocator) = setup("10.0.0.0/16", 24, 256);

        let a = allocator.allocate_device_ip("acc", "default", "a").await.unwrap();
        let _b = allocator.allocate_device_ip("acc", "default", "b").await.unwrap();
        assert!(allocator.release_device_ip("acc", "default", a).unwrap());

        let c = allocator.allocate_device_ip("acc", "default", "c").await.unwrap();
        assert_eq!(c, a);

        let vpn = store.get_vpn("acc", "default").unwrap().unwrap();
        assert_eq!(vpn.num_allocated_devices, 2);
    }

    #[tokio::test]
    async fn third_device_in_slash_30_exhausts() {
        let (_store, allocator) = setup("10.0.0.0/30", 32, 0);

        allocator.allocate_device_ip("acc", "default", "a").await.unwrap();
        allocator.allocate_device_ip("acc", "default", "b").await.unwrap();
        let err = allocator
            .allocate_device_ip("acc", "default", "c")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AllocError::AddressSpaceExhausted {
                pool: PoolKind::DeviceIp,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cluster_cidrs_follow_reserved_prefix() {
        let (_store, allocator) = setup("10.0.0.0/16", 24, 256);

        let c1 = allocator.allocate_cluster_cidr("acc", "default", "c1").await.unwrap();
        let c2 = allocator.allocate_cluster_cidr("acc", "default", "c2").await.unwrap();
        assert_eq!(c1, "10.0.1.0/24".parse::<Ipv4Net>().unwrap());
        assert_eq!(c2, "10.0.2.0/24".parse::<Ipv4Net>().unwrap());

        // Device IPs are an independent domain.
        let ip = allocator.allocate_device_ip("acc", "default", "c1").await.unwrap();
        assert_eq!(ip, "10.0.0.1".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn cluster_cidrs_exhaust() {
        let (_store, allocator) = setup("10.0.0.0/23", 24, 256);

        allocator.allocate_cluster_cidr("acc", "default", "c1").await.unwrap();
        let err = allocator
            .allocate_cluster_cidr("acc", "default", "c2")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AllocError::AddressSpaceExhausted {
                pool: PoolKind::ClusterCidr,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn lost_claim_race_moves_to_next_unit() {
        let (store, allocator) = setup("10.0.0.0/16", 24, 256);
        let inner = StorePool::load(&store, PoolKind::DeviceIp, "acc", "default").unwrap();
        let pool = RacingPool::new(inner, 1);

        let unit = allocator.allocate(&pool, "laptop").await.unwrap();
        assert_eq!(unit, "10.0.0.2/32".parse::<Ipv4Net>().unwrap());

        let scope = PoolScope::new("acc", "default");
        let racer = store
            .find_claim_by_owner(PoolKind::DeviceIp, &scope, "racer-0")
            .unwrap()
            .unwrap();
        assert_eq!(racer.unit, "10.0.0.1/32".parse::<Ipv4Net>().unwrap());
    }

    #[tokio::test]
    async fn sustained_races_hit_retry_cap() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_vpn(&test_vpn("10.0.0.0/16", 24, 256)).unwrap();
        let allocator = Allocator::new(store.clone(), RetryPolicy::immediate(4));
        let inner = StorePool::load(&store, PoolKind::DeviceIp, "acc", "default").unwrap();
        let pool = RacingPool::new(inner, u32::MAX);

        let err = allocator.allocate(&pool, "laptop").await.unwrap_err();
        assert!(matches!(err, AllocError::RetriesExhausted { attempts: 4 }));
        assert_eq!(pool.stolen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_counter_still_makes_progress() {
        let (store, allocator) = setup("10.0.0.0/16", 24, 256);
        let scope = PoolScope::new("acc", "default");

        // Someone claimed the first unit but crashed before advancing the counter.
        store
            .create_claim(
                PoolKind::DeviceIp,
                &meshplane_state::ClaimRecord {
                    scope: scope.clone(),
                    unit: "10.0.0.1/32".parse().unwrap(),
                    claimed_by: "crashed".to_string(),
                    claimed_at: 1000,
                },
            )
            .unwrap();

        let ip = allocator.allocate_device_ip("acc", "default", "laptop").await.unwrap();
        assert_eq!(ip, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn missing_vpn_is_reported() {
        let store = StateStore::open_in_memory().unwrap();
        let allocator = Allocator::new(store, RetryPolicy::immediate(4));

        let err = allocator
            .allocate_device_ip("acc", "nope", "laptop")
            .await
            .unwrap_err();
        assert!(matches!(err, AllocError::VpnNotFound(_)));
    }

    #[test]
    fn release_of_unclaimed_unit_returns_false() {
        let (_store, allocator) = setup("10.0.0.0/16", 24, 256);
        assert!(!allocator
            .release_cluster_cidr("acc", "default", "10.0.1.0/24".parse().unwrap())
            .unwrap());
    }
}
