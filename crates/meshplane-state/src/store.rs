//! StateStore: redb-backed state persistence for meshplane.
//!
//! Provides typed CRUD over Global VPNs, connections and devices, plus the
//! address pool contract used by the allocator: free/claim records for
//! device IPs and cluster CIDRs. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use ipnet::Ipv4Net;
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in ALL_TABLES {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON helpers ───────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn remove_key(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Global VPNs ────────────────────────────────────────────────

    /// Insert a new Global VPN. Fails with `Conflict` if the name is taken.
    pub fn create_vpn(&self, vpn: &GlobalVpn) -> StateResult<()> {
        let key = vpn.table_key();
        let value = serde_json::to_vec(vpn).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GLOBAL_VPNS).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!("global vpn {key} already exists")));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "global vpn created");
        Ok(())
    }

    /// Insert or update a Global VPN.
    pub fn put_vpn(&self, vpn: &GlobalVpn) -> StateResult<()> {
        self.put_json(GLOBAL_VPNS, &vpn.table_key(), vpn)
    }

    pub fn get_vpn(&self, account: &str, name: &str) -> StateResult<Option<GlobalVpn>> {
        self.get_json(GLOBAL_VPNS, &vpn_key(account, name))
    }

    /// List all Global VPNs of an account.
    pub fn list_vpns(&self, account: &str) -> StateResult<Vec<GlobalVpn>> {
        self.list_json(GLOBAL_VPNS, &format!("{account}/"))
    }

    /// Delete a Global VPN by name. Returns true if it existed.
    pub fn delete_vpn(&self, account: &str, name: &str) -> StateResult<bool> {
        let key = vpn_key(account, name);
        let existed = self.remove_key(GLOBAL_VPNS, &key)?;
        debug!(%key, existed, "global vpn deleted");
        Ok(existed)
    }

    /// Advance an allocation counter by one, provided it still reads `observed`.
    ///
    /// Read and write happen in one write transaction, so concurrent callers
    /// that derived a candidate from the same value move the counter once.
    /// Returns the counter value after the call.
    pub fn advance_vpn_counter(
        &self,
        account: &str,
        name: &str,
        counter: VpnCounter,
        observed: u64,
    ) -> StateResult<u64> {
        let key = vpn_key(account, name);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let current;
        {
            let mut table = txn.open_table(GLOBAL_VPNS).map_err(map_err!(Table))?;
            let raw = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StateError::NotFound(format!("global vpn {key}")))?;
            let mut vpn: GlobalVpn =
                serde_json::from_slice(&raw).map_err(map_err!(Deserialize))?;
            if vpn.advance_counter(counter, observed) {
                vpn.updated_at = epoch_secs();
                let value = serde_json::to_vec(&vpn).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            current = vpn.counter(counter);
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, ?counter, observed, current, "vpn counter advanced");
        Ok(current)
    }

    // ── Connections ────────────────────────────────────────────────

    /// Insert or update a connection.
    pub fn put_connection(&self, conn: &GlobalVpnConnection) -> StateResult<()> {
        let key = conn.table_key();
        self.put_json(CONNECTIONS, &key, conn)?;
        debug!(%key, record_version = conn.sync_status.record_version, "connection stored");
        Ok(())
    }

    pub fn get_connection(
        &self,
        account: &str,
        vpn: &str,
        cluster: &str,
    ) -> StateResult<Option<GlobalVpnConnection>> {
        self.get_json(CONNECTIONS, &child_key(account, vpn, cluster))
    }

    /// List all connections of a Global VPN.
    pub fn list_connections(&self, account: &str, vpn: &str) -> StateResult<Vec<GlobalVpnConnection>> {
        self.list_json(CONNECTIONS, &format!("{}/", vpn_key(account, vpn)))
    }

    /// Delete a connection. Returns true if it existed.
    pub fn delete_connection(&self, account: &str, vpn: &str, cluster: &str) -> StateResult<bool> {
        self.remove_key(CONNECTIONS, &child_key(account, vpn, cluster))
    }

    // ── Devices ────────────────────────────────────────────────────

    /// Insert or update a device.
    pub fn put_device(&self, device: &GlobalVpnDevice) -> StateResult<()> {
        let key = device.table_key();
        self.put_json(DEVICES, &key, device)?;
        debug!(%key, record_version = device.sync_status.record_version, "device stored");
        Ok(())
    }

    pub fn get_device(
        &self,
        account: &str,
        vpn: &str,
        name: &str,
    ) -> StateResult<Option<GlobalVpnDevice>> {
        self.get_json(DEVICES, &child_key(account, vpn, name))
    }

    /// List all devices of a Global VPN.
    pub fn list_devices(&self, account: &str, vpn: &str) -> StateResult<Vec<GlobalVpnDevice>> {
        self.list_json(DEVICES, &format!("{}/", vpn_key(account, vpn)))
    }

    /// Delete a device. Returns true if it existed.
    pub fn delete_device(&self, account: &str, vpn: &str, name: &str) -> StateResult<bool> {
        self.remove_key(DEVICES, &child_key(account, vpn, name))
    }

    // ── Address pools ──────────────────────────────────────────────

    /// First free unit of the scope in address order, skipping `exclude`.
    pub fn find_free(
        &self,
        kind: PoolKind,
        scope: &PoolScope,
        exclude: &HashSet<Ipv4Net>,
    ) -> StateResult<Option<FreeRecord>> {
        let prefix = scope.prefix();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(PoolTables::of(kind).free)
            .map_err(map_err!(Table))?;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                continue;
            }
            let record: FreeRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if !exclude.contains(&record.unit) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Insert a free record.
    ///
    /// Fails with `Conflict` when the unit is already free or currently
    /// claimed, so a late minter cannot put a claimed unit back in the pool.
    pub fn create_free(&self, kind: PoolKind, record: &FreeRecord) -> StateResult<()> {
        let tables = PoolTables::of(kind);
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let claims = txn.open_table(tables.claims).map_err(map_err!(Table))?;
            if claims.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!(
                    "{kind} {} is claimed",
                    record.unit
                )));
            }
            let mut free = txn.open_table(tables.free).map_err(map_err!(Table))?;
            if free.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!(
                    "{kind} {} is already free",
                    record.unit
                )));
            }
            free.insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%kind, unit = %record.unit, "free record created");
        Ok(())
    }

    /// Delete a free record. Returns true if it existed.
    pub fn delete_free(&self, kind: PoolKind, scope: &PoolScope, unit: &Ipv4Net) -> StateResult<bool> {
        self.remove_key(PoolTables::of(kind).free, &unit_key(scope, unit))
    }

    /// List the free records of a scope in address order.
    pub fn list_free(&self, kind: PoolKind, scope: &PoolScope) -> StateResult<Vec<FreeRecord>> {
        self.list_json(PoolTables::of(kind).free, &scope.prefix())
    }

    /// Claim a unit for `claim.claimed_by`.
    ///
    /// Fails with `Conflict` if the unit is already claimed or the owner
    /// already holds a claim in this scope. On success the unit's free
    /// record, if any, is consumed in the same transaction.
    pub fn create_claim(&self, kind: PoolKind, claim: &ClaimRecord) -> StateResult<()> {
        let tables = PoolTables::of(kind);
        let key = claim.table_key();
        let owner = claim.owner_key();
        let value = serde_json::to_vec(claim).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut claims = txn.open_table(tables.claims).map_err(map_err!(Table))?;
            if claims.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!(
                    "{kind} {} already claimed",
                    claim.unit
                )));
            }
            let mut owners = txn.open_table(tables.owners).map_err(map_err!(Table))?;
            if owners.get(owner.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!(
                    "{} already holds a {kind} claim",
                    claim.claimed_by
                )));
            }
            claims
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            owners
                .insert(owner.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            let mut free = txn.open_table(tables.free).map_err(map_err!(Table))?;
            free.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%kind, unit = %claim.unit, owner = %claim.claimed_by, "claim created");
        Ok(())
    }

    /// The claim currently held by `owner`, if any.
    pub fn find_claim_by_owner(
        &self,
        kind: PoolKind,
        scope: &PoolScope,
        owner: &str,
    ) -> StateResult<Option<ClaimRecord>> {
        self.get_json(PoolTables::of(kind).owners, &owner_key(scope, owner))
    }

    pub fn get_claim(
        &self,
        kind: PoolKind,
        scope: &PoolScope,
        unit: &Ipv4Net,
    ) -> StateResult<Option<ClaimRecord>> {
        self.get_json(PoolTables::of(kind).claims, &unit_key(scope, unit))
    }

    /// List the claims of a scope in address order.
    pub fn list_claims(&self, kind: PoolKind, scope: &PoolScope) -> StateResult<Vec<ClaimRecord>> {
        self.list_json(PoolTables::of(kind).claims, &scope.prefix())
    }

    /// Delete a claim without returning the unit to the free pool.
    pub fn delete_claim(&self, kind: PoolKind, scope: &PoolScope, unit: &Ipv4Net) -> StateResult<bool> {
        Ok(self.take_claim(kind, scope, unit, false)?.is_some())
    }

    /// Delete a claim and insert a free record for its unit, atomically.
    ///
    /// Returns false if the unit was not claimed; nothing is freed then.
    pub fn release_claim(&self, kind: PoolKind, scope: &PoolScope, unit: &Ipv4Net) -> StateResult<bool> {
        let released = self.take_claim(kind, scope, unit, true)?;
        if let Some(claim) = &released {
            debug!(%kind, %unit, owner = %claim.claimed_by, "claim released to free pool");
        }
        Ok(released.is_some())
    }

    fn take_claim(
        &self,
        kind: PoolKind,
        scope: &PoolScope,
        unit: &Ipv4Net,
        to_free_pool: bool,
    ) -> StateResult<Option<ClaimRecord>> {
        let tables = PoolTables::of(kind);
        let key = unit_key(scope, unit);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let claim;
        {
            let mut claims = txn.open_table(tables.claims).map_err(map_err!(Table))?;
            let raw = claims
                .remove(key.as_str())
                .map_err(map_err!(Write))?
                .map(|guard| guard.value().to_vec());
            claim = match raw {
                Some(raw) => Some(
                    serde_json::from_slice::<ClaimRecord>(&raw).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            if let Some(c) = &claim {
                let mut owners = txn.open_table(tables.owners).map_err(map_err!(Table))?;
                owners
                    .remove(c.owner_key().as_str())
                    .map_err(map_err!(Write))?;
                if to_free_pool {
                    let record = FreeRecord {
                        scope: scope.clone(),
                        unit: *unit,
                        created_at: epoch_secs(),
                    };
                    let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                    let mut free = txn.open_table(tables.free).map_err(map_err!(Table))?;
                    free.insert(key.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(claim)
    }

    /// Drop every free and claim record of a scope, in both domains.
    /// Returns the number of records removed.
    pub fn purge_pools(&self, scope: &PoolScope) -> StateResult<u32> {
        let prefix = scope.prefix();
        let pool_tables: Vec<JsonTable> = [PoolKind::DeviceIp, PoolKind::ClusterCidr]
            .into_iter()
            .flat_map(|kind| {
                let t = PoolTables::of(kind);
                [t.free, t.claims, t.owners]
            })
            .collect();

        // Collect keys in a read transaction first.
        let mut doomed: Vec<(JsonTable, Vec<String>)> = Vec::new();
        {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            for def in &pool_tables {
                let table = txn.open_table(*def).map_err(map_err!(Table))?;
                let keys: Vec<String> = table
                    .iter()
                    .map_err(map_err!(Read))?
                    .filter_map(|entry| {
                        let (key, _) = entry.ok()?;
                        let k = key.value().to_string();
                        k.starts_with(&prefix).then_some(k)
                    })
                    .collect();
                doomed.push((*def, keys));
            }
        }

        // Delete in a write transaction.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0u32;
        for (def, keys) in &doomed {
            let mut table = txn.open_table(*def).map_err(map_err!(Table))?;
            for key in keys {
                if table.remove(key.as_str()).map_err(map_err!(Write))?.is_some() {
                    count += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(account = %scope.account, vpn = %scope.vpn, count, "pool records purged");
        Ok(count)
    }
}
