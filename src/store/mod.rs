//! The in-memory zone store.
//!
//! Every authoritative zone, record and ACL rule lives here, loaded from the
//! backing store at startup and mutated only by transfer and update
//! operations.  The layout follows the classic shared-region design: bounded
//! pools for zones, records and ACL rules, a per-zone hash table over record
//! names (bucket index `djb2(lowercase(name)) mod 65536`), and one
//! reader-writer lock mediating everything.  Readers traverse a consistent
//! chain; writers hold the exclusive lock across all chain mutations, so a
//! failed bulk operation can restore the pre-image before anyone sees it.

use std::fmt;
use std::sync::{Arc, RwLock};

use palisade_proto::rdata::RdataTextError;
use palisade_proto::{Name, Rdata, Rtype, Soa};

use crate::acl::AclRule;
use crate::db::{RecordRow, ZoneRow};
use crate::metrics::{bump, Metrics};

/// The number of hash buckets in each per-zone record table.
const BUCKET_COUNT: u32 = 65536;

/// The layout version of the store region.  Attaching to a region created by
/// a build with a different layout must fail rather than misread it.
const REGION_VERSION: u32 = 3;

//----------- Limits -----------------------------------------------------------

/// Pool bounds, fixed at creation.
#[derive(Clone, Copy, Debug)]
pub struct StoreLimits {
    pub max_zones: usize,
    pub max_records: usize,
    pub max_acl_rules: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_zones: 4096,
            max_records: 1_000_000,
            max_acl_rules: 4096,
        }
    }
}

//----------- StoredRecord -----------------------------------------------------

/// A record as the store holds it.
///
/// `ttl` may be zero, in which case answers substitute the zone's SOA
/// minimum.  `aux` is the type-specific priority kept for write-back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    pub name: Name,
    pub rtype: Rtype,
    pub ttl: u32,
    pub aux: u32,
    pub rdata: Rdata,
}

impl StoredRecord {
    /// Build a stored record from a backing-store row.
    pub fn from_row(row: &RecordRow) -> Result<Self, RdataTextError> {
        Ok(Self {
            name: row.name.clone(),
            rtype: row.rtype,
            ttl: row.ttl,
            aux: row.aux,
            rdata: Rdata::from_text(row.rtype, row.aux, &row.rdata)?,
        })
    }
}

//----------- ZoneMeta ---------------------------------------------------------

/// Zone identity and SOA data as the scheduler and resolver see it.
#[derive(Clone, Debug)]
pub struct ZoneMeta {
    pub zone_id: u32,
    pub origin: Name,
    pub soa: Soa,
    /// TTL of the SOA record itself.
    pub soa_ttl: u32,
    pub active: bool,
    pub slave_mode: bool,
    pub updated: u64,
    pub update_policy: crate::db::UpdatePolicy,
}

//----------- Edit -------------------------------------------------------------

/// One staged mutation of a zone, applied through [`Store::apply_edits`].
#[derive(Clone, Debug)]
pub enum Edit {
    Add(StoredRecord),
    /// Delete records matching owner, type and rdata exactly.
    DeleteExact {
        name: Name,
        rtype: Rtype,
        rdata: Rdata,
    },
    /// Delete the whole RRset at (owner, type).
    DeleteRrset {
        name: Name,
        rtype: Rtype,
    },
    /// Delete every RRset at the owner.
    DeleteName {
        name: Name,
    },
}

//----------- StoreError -------------------------------------------------------

/// A zone-store failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// A pool is exhausted; the mutation was refused.
    Full,
    /// The zone id is unknown.
    NoSuchZone,
    /// The region was created by an incompatible build.
    VersionMismatch,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full => "store pool exhausted",
            Self::NoSuchZone => "no such zone",
            Self::VersionMismatch => "store region has incompatible version",
        })
    }
}

impl std::error::Error for StoreError {}

//----------- Pool -------------------------------------------------------------

/// A bounded arena.  Freed slots are reused before the vector grows.
#[derive(Debug)]
struct Pool<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
    len: usize,
    cap: usize,
}

impl<T> Pool<T> {
    fn new(cap: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            cap,
        }
    }

    fn alloc(&mut self, value: T) -> Result<u32, StoreError> {
        if self.len >= self.cap {
            return Err(StoreError::Full);
        }
        self.len += 1;
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(value);
                Ok(slot)
            }
            None => {
                self.slots.push(Some(value));
                Ok((self.slots.len() - 1) as u32)
            }
        }
    }

    fn release(&mut self, slot: u32) -> Option<T> {
        let value = self.slots[slot as usize].take();
        if value.is_some() {
            self.len -= 1;
            self.free.push(slot);
        }
        value
    }

    fn get(&self, slot: u32) -> Option<&T> {
        self.slots.get(slot as usize).and_then(Option::as_ref)
    }
}

//----------- ZoneEntry --------------------------------------------------------

#[derive(Debug)]
struct ZoneEntry {
    meta: ZoneMeta,
    /// Bucket index → chain of RR-pool slots.
    buckets: foldhash::HashMap<u16, Vec<u32>>,
    record_count: usize,
}

impl ZoneEntry {
    fn new(meta: ZoneMeta) -> Self {
        Self {
            meta,
            buckets: Default::default(),
            record_count: 0,
        }
    }
}

fn bucket_of(name: &Name) -> u16 {
    (name.djb2() % BUCKET_COUNT) as u16
}

//----------- Store ------------------------------------------------------------

/// A handle onto the store region.
///
/// Handles are cheap to clone; they share the region and its lock.
#[derive(Clone, Debug)]
pub struct Store {
    region: Arc<Region>,
}

#[derive(Debug)]
struct Region {
    version: u32,
    state: RwLock<State>,
    metrics: Arc<Metrics>,
}

#[derive(Debug)]
struct State {
    zones: Pool<ZoneEntry>,
    /// zone_id → zone pool slot.
    zone_index: foldhash::HashMap<u32, u32>,
    /// origin → zone_id, for name-keyed lookup.
    origin_index: foldhash::HashMap<Name, u32>,
    rr_pool: Pool<StoredRecord>,
    acl_rules: Vec<AclRule>,
    max_acl_rules: usize,
}

/// The counters and gauges `stats()` reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub zones: u64,
    pub records: u64,
    pub queries: u64,
    pub hits: u64,
    pub misses: u64,
    pub acl_checks: u64,
    pub acl_denies: u64,
}

impl Store {
    /// Create a fresh region: zeroed pools, counters at zero.
    pub fn create(limits: StoreLimits, metrics: Arc<Metrics>) -> Self {
        Self {
            region: Arc::new(Region {
                version: REGION_VERSION,
                state: RwLock::new(State {
                    zones: Pool::new(limits.max_zones),
                    zone_index: Default::default(),
                    origin_index: Default::default(),
                    rr_pool: Pool::new(limits.max_records),
                    acl_rules: Vec::new(),
                    max_acl_rules: limits.max_acl_rules,
                }),
                metrics,
            }),
        }
    }

    /// Attach to an existing region, checking the layout version tag.
    pub fn attach(other: &Store) -> Result<Self, StoreError> {
        if other.region.version != REGION_VERSION {
            return Err(StoreError::VersionMismatch);
        }
        Ok(Self {
            region: other.region.clone(),
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.region.metrics
    }

    //--- Zone management

    /// Insert or update a zone.  On insert the zone pool may report `Full`.
    pub fn add_zone(&self, row: &ZoneRow, now: u64) -> Result<(), StoreError> {
        let meta = ZoneMeta {
            zone_id: row.id,
            origin: row.origin.clone(),
            soa: Soa {
                mname: row.ns.clone(),
                rname: row.mbox.clone(),
                serial: row.serial,
                refresh: row.refresh,
                retry: row.retry,
                expire: row.expire,
                minimum: row.minimum,
            },
            soa_ttl: row.ttl,
            active: row.active,
            slave_mode: row.slave_mode,
            updated: now,
            update_policy: row.update_policy.clone(),
        };

        let mut state = self.region.state.write().unwrap();
        if let Some(&slot) = state.zone_index.get(&row.id) {
            let old_origin = {
                let entry = state.zones.slots[slot as usize]
                    .as_mut()
                    .expect("indexed slot is live");
                let old = entry.meta.origin.clone();
                entry.meta = meta;
                old
            };
            state.origin_index.remove(&old_origin);
            state.origin_index.insert(row.origin.clone(), row.id);
            return Ok(());
        }

        let slot = state.zones.alloc(ZoneEntry::new(meta))?;
        state.zone_index.insert(row.id, slot);
        state.origin_index.insert(row.origin.clone(), row.id);
        Ok(())
    }

    /// Remove a zone and everything in it.
    pub fn remove_zone(&self, zone_id: u32) -> Result<(), StoreError> {
        let mut state = self.region.state.write().unwrap();
        let slot = *state
            .zone_index
            .get(&zone_id)
            .ok_or(StoreError::NoSuchZone)?;
        delete_zone_records(&mut state, slot);
        let entry = state.zones.release(slot).expect("indexed slot is live");
        state.zone_index.remove(&zone_id);
        state.origin_index.remove(&entry.meta.origin);
        Ok(())
    }

    /// Find the zone whose origin is the longest suffix of `qname`.
    pub fn find_zone(&self, qname: &Name) -> Option<ZoneMeta> {
        let state = self.region.state.read().unwrap();
        let mut candidate = Some(qname.clone());
        while let Some(name) = candidate {
            if let Some(&zone_id) = state.origin_index.get(&name) {
                let meta = zone_meta(&state, zone_id)?;
                if meta.active {
                    return Some(meta);
                }
            }
            candidate = name.parent();
        }
        None
    }

    pub fn get_zone(&self, zone_id: u32) -> Option<ZoneMeta> {
        let state = self.region.state.read().unwrap();
        zone_meta(&state, zone_id)
    }

    /// Metadata of every zone, for the transfer scheduler.
    pub fn zones(&self) -> Vec<ZoneMeta> {
        let state = self.region.state.read().unwrap();
        state
            .zone_index
            .values()
            .filter_map(|&slot| state.zones.get(slot))
            .map(|entry| entry.meta.clone())
            .collect()
    }

    pub fn get_soa(&self, zone_id: u32) -> Option<(Soa, u32)> {
        self.get_zone(zone_id).map(|meta| {
            let ttl = meta.soa_ttl;
            (meta.soa, ttl)
        })
    }

    //--- Record operations

    /// Add one record.
    ///
    /// If an RRset already exists at (name, type), the inserted record
    /// inherits its TTL so that all members of an RRset share one.
    pub fn add_rr(&self, zone_id: u32, mut record: StoredRecord) -> Result<(), StoreError> {
        let mut state = self.region.state.write().unwrap();
        let slot = *state
            .zone_index
            .get(&zone_id)
            .ok_or(StoreError::NoSuchZone)?;
        if let Some(ttl) = rrset_ttl(&state, slot, &record.name, record.rtype) {
            record.ttl = ttl;
        }
        insert_record(&mut state, slot, record)
    }

    /// Delete every record of a zone.
    pub fn delete_all_rr(&self, zone_id: u32) -> Result<usize, StoreError> {
        let mut state = self.region.state.write().unwrap();
        let slot = *state
            .zone_index
            .get(&zone_id)
            .ok_or(StoreError::NoSuchZone)?;
        Ok(delete_zone_records(&mut state, slot))
    }

    /// Look up records by owner and type.  `Rtype::ANY` matches all types.
    ///
    /// Zero record TTLs are substituted with the zone's SOA minimum, which
    /// is what answers must carry.
    pub fn query(&self, zone_id: u32, name: &Name, rtype: Rtype) -> Vec<StoredRecord> {
        let metrics = &self.region.metrics;
        bump(&metrics.queries);

        let state = self.region.state.read().unwrap();
        let Some(&slot) = state.zone_index.get(&zone_id) else {
            bump(&metrics.query_misses);
            return Vec::new();
        };
        let entry = state.zones.get(slot).expect("indexed slot is live");
        let minimum = entry.meta.soa.minimum;

        let mut found = Vec::new();
        if let Some(chain) = entry.buckets.get(&bucket_of(name)) {
            for &rr_slot in chain {
                let record = state.rr_pool.get(rr_slot).expect("chained slot is live");
                if record.name == *name && (rtype == Rtype::ANY || record.rtype == rtype) {
                    let mut record = record.clone();
                    if record.ttl == 0 {
                        record.ttl = minimum;
                    }
                    found.push(record);
                }
            }
        }

        if found.is_empty() {
            bump(&metrics.query_misses);
        } else {
            bump(&metrics.query_hits);
        }
        found
    }

    /// Whether any record exists at the owner name (NODATA vs NXDOMAIN).
    pub fn name_exists(&self, zone_id: u32, name: &Name) -> bool {
        let state = self.region.state.read().unwrap();
        let Some(&slot) = state.zone_index.get(&zone_id) else {
            return false;
        };
        let entry = state.zones.get(slot).expect("indexed slot is live");
        entry
            .buckets
            .get(&bucket_of(name))
            .is_some_and(|chain| {
                chain.iter().any(|&rr_slot| {
                    state
                        .rr_pool
                        .get(rr_slot)
                        .expect("chained slot is live")
                        .name
                        == *name
                })
            })
    }

    /// Every RRset of a zone: (owner, type, ttl, rdatas).  The expensive
    /// consumer is the DNSSEC chain builder, which wants them grouped.
    pub fn zone_rrsets(&self, zone_id: u32) -> Vec<(Name, Rtype, u32, Vec<Rdata>)> {
        let state = self.region.state.read().unwrap();
        let Some(&slot) = state.zone_index.get(&zone_id) else {
            return Vec::new();
        };
        let entry = state.zones.get(slot).expect("indexed slot is live");
        let minimum = entry.meta.soa.minimum;

        let mut rrsets: Vec<(Name, Rtype, u32, Vec<Rdata>)> = Vec::new();
        for chain in entry.buckets.values() {
            for &rr_slot in chain {
                let record = state.rr_pool.get(rr_slot).expect("chained slot is live");
                let ttl = if record.ttl == 0 { minimum } else { record.ttl };
                match rrsets
                    .iter_mut()
                    .find(|(name, rtype, _, _)| *name == record.name && *rtype == record.rtype)
                {
                    Some((_, _, _, rdatas)) => rdatas.push(record.rdata.clone()),
                    None => rrsets.push((record.name.clone(), record.rtype, ttl, vec![
                        record.rdata.clone(),
                    ])),
                }
            }
        }
        rrsets
    }

    //--- Bulk mutation

    /// Replace a zone's entire contents, as a completed AXFR does.
    ///
    /// The swap happens under one write-lock hold: readers observe either
    /// the full pre-image or the full post-image.  On failure the pre-image
    /// is restored and the error returned.
    pub fn replace_zone(
        &self,
        zone_id: u32,
        soa: Soa,
        soa_ttl: u32,
        records: Vec<StoredRecord>,
        now: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.region.state.write().unwrap();
        let slot = *state
            .zone_index
            .get(&zone_id)
            .ok_or(StoreError::NoSuchZone)?;

        let saved = snapshot_zone(&state, slot);
        delete_zone_records(&mut state, slot);

        for record in records {
            if let Err(err) = insert_record(&mut state, slot, record) {
                restore_zone(&mut state, slot, saved);
                return Err(err);
            }
        }

        let entry = state.zones.slots[slot as usize]
            .as_mut()
            .expect("indexed slot is live");
        // Serials never move backwards (RFC 1982 wrap is handled by the
        // probe logic; here a plain max keeps restarts honest).
        entry.meta.soa = Soa {
            serial: soa.serial.max(entry.meta.soa.serial),
            ..soa
        };
        entry.meta.soa_ttl = soa_ttl;
        entry.meta.updated = now;
        Ok(())
    }

    /// Apply a set of edits atomically; used by IXFR and dynamic UPDATE.
    ///
    /// On success the SOA serial is raised to `serial` (or incremented when
    /// `None`) and the new serial returned.  On failure the zone is exactly
    /// as before.
    pub fn apply_edits(
        &self,
        zone_id: u32,
        edits: &[Edit],
        serial: Option<u32>,
        now: u64,
    ) -> Result<u32, StoreError> {
        let mut state = self.region.state.write().unwrap();
        let slot = *state
            .zone_index
            .get(&zone_id)
            .ok_or(StoreError::NoSuchZone)?;

        let saved = snapshot_zone(&state, slot);

        for edit in edits {
            let result = match edit {
                Edit::Add(record) => {
                    let mut record = record.clone();
                    if let Some(ttl) = rrset_ttl(&state, slot, &record.name, record.rtype) {
                        record.ttl = ttl;
                    }
                    insert_record(&mut state, slot, record)
                }
                Edit::DeleteExact { name, rtype, rdata } => {
                    remove_matching(&mut state, slot, name, |r| {
                        r.rtype == *rtype && r.rdata == *rdata
                    });
                    Ok(())
                }
                Edit::DeleteRrset { name, rtype } => {
                    remove_matching(&mut state, slot, name, |r| r.rtype == *rtype);
                    Ok(())
                }
                Edit::DeleteName { name } => {
                    remove_matching(&mut state, slot, name, |_| true);
                    Ok(())
                }
            };
            if let Err(err) = result {
                restore_zone(&mut state, slot, saved);
                return Err(err);
            }
        }

        let entry = state.zones.slots[slot as usize]
            .as_mut()
            .expect("indexed slot is live");
        let old = entry.meta.soa.serial;
        let new = match serial {
            Some(serial) => serial.max(old),
            None => old.wrapping_add(1).max(old),
        };
        entry.meta.soa.serial = new;
        entry.meta.updated = now;
        Ok(new)
    }

    //--- ACL pool

    /// Replace the ACL rule pool.
    pub fn set_acl(&self, rules: Vec<AclRule>) -> Result<(), StoreError> {
        let mut state = self.region.state.write().unwrap();
        if rules.len() > state.max_acl_rules {
            return Err(StoreError::Full);
        }
        state.acl_rules = rules;
        Ok(())
    }

    /// Run `f` over the ACL rules under the read lock.
    pub fn with_acl<R>(&self, f: impl FnOnce(&[AclRule]) -> R) -> R {
        let state = self.region.state.read().unwrap();
        f(&state.acl_rules)
    }

    //--- Stats

    pub fn stats(&self) -> StoreStats {
        let snap = self.region.metrics.snapshot();
        let state = self.region.state.read().unwrap();
        StoreStats {
            zones: state.zones.len as u64,
            records: state.rr_pool.len as u64,
            queries: snap.queries,
            hits: snap.query_hits,
            misses: snap.query_misses,
            acl_checks: snap.acl_checks,
            acl_denies: snap.acl_denies,
        }
    }
}

//--- Internal helpers, all called with the write lock held

fn zone_meta(state: &State, zone_id: u32) -> Option<ZoneMeta> {
    let &slot = state.zone_index.get(&zone_id)?;
    state.zones.get(slot).map(|entry| entry.meta.clone())
}

fn rrset_ttl(state: &State, slot: u32, name: &Name, rtype: Rtype) -> Option<u32> {
    let entry = state.zones.get(slot).expect("indexed slot is live");
    let chain = entry.buckets.get(&bucket_of(name))?;
    chain.iter().find_map(|&rr_slot| {
        let record = state.rr_pool.get(rr_slot).expect("chained slot is live");
        (record.name == *name && record.rtype == rtype).then_some(record.ttl)
    })
}

fn insert_record(state: &mut State, slot: u32, record: StoredRecord) -> Result<(), StoreError> {
    let bucket = bucket_of(&record.name);
    let rr_slot = state.rr_pool.alloc(record)?;
    let entry = state.zones.slots[slot as usize]
        .as_mut()
        .expect("indexed slot is live");
    entry.buckets.entry(bucket).or_default().push(rr_slot);
    entry.record_count += 1;
    Ok(())
}

fn delete_zone_records(state: &mut State, slot: u32) -> usize {
    let entry = state.zones.slots[slot as usize]
        .as_mut()
        .expect("indexed slot is live");
    let buckets = std::mem::take(&mut entry.buckets);
    let removed = entry.record_count;
    entry.record_count = 0;
    for chain in buckets.into_values() {
        for rr_slot in chain {
            state.rr_pool.release(rr_slot);
        }
    }
    removed
}

fn remove_matching(
    state: &mut State,
    slot: u32,
    name: &Name,
    matches: impl Fn(&StoredRecord) -> bool,
) {
    let bucket = bucket_of(name);
    let entry = state.zones.slots[slot as usize]
        .as_mut()
        .expect("indexed slot is live");
    let Some(chain) = entry.buckets.get_mut(&bucket) else {
        return;
    };

    let mut removed = Vec::new();
    chain.retain(|&rr_slot| {
        let record = state.rr_pool.slots[rr_slot as usize]
            .as_ref()
            .expect("chained slot is live");
        if record.name == *name && matches(record) {
            removed.push(rr_slot);
            false
        } else {
            true
        }
    });
    if chain.is_empty() {
        entry.buckets.remove(&bucket);
    }
    entry.record_count -= removed.len();
    for rr_slot in removed {
        state.rr_pool.release(rr_slot);
    }
}

struct ZoneSnapshot {
    soa: Soa,
    soa_ttl: u32,
    updated: u64,
    records: Vec<StoredRecord>,
}

fn snapshot_zone(state: &State, slot: u32) -> ZoneSnapshot {
    let entry = state.zones.get(slot).expect("indexed slot is live");
    let mut records = Vec::with_capacity(entry.record_count);
    for chain in entry.buckets.values() {
        for &rr_slot in chain {
            records.push(
                state
                    .rr_pool
                    .get(rr_slot)
                    .expect("chained slot is live")
                    .clone(),
            );
        }
    }
    ZoneSnapshot {
        soa: entry.meta.soa.clone(),
        soa_ttl: entry.meta.soa_ttl,
        updated: entry.meta.updated,
        records,
    }
}

fn restore_zone(state: &mut State, slot: u32, saved: ZoneSnapshot) {
    delete_zone_records(state, slot);
    for record in saved.records {
        // Re-inserting what was just freed cannot exhaust the pool.
        insert_record(state, slot, record).expect("pre-image fits the pool");
    }
    let entry = state.zones.slots[slot as usize]
        .as_mut()
        .expect("indexed slot is live");
    entry.meta.soa = saved.soa;
    entry.meta.soa_ttl = saved.soa_ttl;
    entry.meta.updated = saved.updated;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn test_store(limits: StoreLimits) -> Store {
        Store::create(limits, Arc::new(Metrics::new()))
    }

    fn zone_row(id: u32, origin: &str, serial: u32) -> ZoneRow {
        ZoneRow {
            id,
            origin: name(origin),
            ns: name(&format!("ns1.{origin}")),
            mbox: name(&format!("hostmaster.{origin}")),
            serial,
            refresh: 7200,
            retry: 1800,
            expire: 1209600,
            minimum: 600,
            ttl: 3600,
            active: true,
            slave_mode: false,
            update_policy: Default::default(),
        }
    }

    fn a_rr(owner: &str, addr: &str, ttl: u32) -> StoredRecord {
        StoredRecord {
            name: name(owner),
            rtype: Rtype::A,
            ttl,
            aux: 0,
            rdata: Rdata::A(addr.parse().unwrap()),
        }
    }

    #[test]
    fn query_is_case_insensitive() {
        let store = test_store(StoreLimits::default());
        store.add_zone(&zone_row(1, "example.com.", 1), 0).unwrap();
        store.add_rr(1, a_rr("www.example.com.", "192.0.2.1", 300)).unwrap();

        let lower = store.query(1, &name("www.example.com."), Rtype::A);
        let upper = store.query(1, &name("WWW.EXAMPLE.COM."), Rtype::A);
        assert_eq!(lower, upper);
        assert_eq!(lower.len(), 1);
    }

    #[test]
    fn any_matches_all_types() {
        let store = test_store(StoreLimits::default());
        store.add_zone(&zone_row(1, "example.com.", 1), 0).unwrap();
        store.add_rr(1, a_rr("host.example.com.", "192.0.2.1", 300)).unwrap();
        store
            .add_rr(1, StoredRecord {
                name: name("host.example.com."),
                rtype: Rtype::TXT,
                ttl: 300,
                aux: 0,
                rdata: Rdata::Txt(vec![b"x".to_vec()]),
            })
            .unwrap();

        assert_eq!(store.query(1, &name("host.example.com."), Rtype::ANY).len(), 2);
        assert_eq!(store.query(1, &name("host.example.com."), Rtype::TXT).len(), 1);
    }

    #[test]
    fn zero_ttl_answers_with_soa_minimum() {
        let store = test_store(StoreLimits::default());
        store.add_zone(&zone_row(1, "example.com.", 1), 0).unwrap();
        store.add_rr(1, a_rr("www.example.com.", "192.0.2.1", 0)).unwrap();

        let found = store.query(1, &name("www.example.com."), Rtype::A);
        assert_eq!(found[0].ttl, 600);
    }

    #[test]
    fn rr_pool_exhaustion_is_full() {
        let store = test_store(StoreLimits {
            max_records: 2,
            ..StoreLimits::default()
        });
        store.add_zone(&zone_row(1, "example.com.", 1), 0).unwrap();
        store.add_rr(1, a_rr("a.example.com.", "192.0.2.1", 60)).unwrap();
        store.add_rr(1, a_rr("b.example.com.", "192.0.2.2", 60)).unwrap();
        assert_eq!(
            store.add_rr(1, a_rr("c.example.com.", "192.0.2.3", 60)),
            Err(StoreError::Full)
        );
        // The pool frees up again after deletion.
        store.delete_all_rr(1).unwrap();
        store.add_rr(1, a_rr("c.example.com.", "192.0.2.3", 60)).unwrap();
    }

    #[test]
    fn longest_suffix_zone_wins() {
        let store = test_store(StoreLimits::default());
        store.add_zone(&zone_row(1, "example.com.", 1), 0).unwrap();
        store.add_zone(&zone_row(2, "sub.example.com.", 1), 0).unwrap();

        let meta = store.find_zone(&name("www.sub.example.com.")).unwrap();
        assert_eq!(meta.zone_id, 2);
        let meta = store.find_zone(&name("www.example.com.")).unwrap();
        assert_eq!(meta.zone_id, 1);
        assert!(store.find_zone(&name("example.org.")).is_none());
    }

    #[test]
    fn replace_zone_rolls_back_on_pool_exhaustion() {
        let store = test_store(StoreLimits {
            max_records: 3,
            ..StoreLimits::default()
        });
        store.add_zone(&zone_row(1, "example.com.", 5), 0).unwrap();
        store.add_rr(1, a_rr("www.example.com.", "192.0.2.1", 300)).unwrap();

        let before = store.query(1, &name("www.example.com."), Rtype::A);
        let (soa, ttl) = store.get_soa(1).unwrap();
        let too_many: Vec<_> = (0..5)
            .map(|i| a_rr(&format!("h{i}.example.com."), "198.51.100.1", 60))
            .collect();
        assert_eq!(
            store.replace_zone(1, Soa { serial: 6, ..soa }, ttl, too_many, 1),
            Err(StoreError::Full)
        );

        // Pre-image intact, serial untouched.
        assert_eq!(store.query(1, &name("www.example.com."), Rtype::A), before);
        assert_eq!(store.get_soa(1).unwrap().0.serial, 5);
        assert!(store.query(1, &name("h0.example.com."), Rtype::A).is_empty());
    }

    #[test]
    fn serial_never_decreases() {
        let store = test_store(StoreLimits::default());
        store.add_zone(&zone_row(1, "example.com.", 10), 0).unwrap();
        let (soa, ttl) = store.get_soa(1).unwrap();

        store
            .replace_zone(1, Soa { serial: 3, ..soa.clone() }, ttl, Vec::new(), 1)
            .unwrap();
        assert_eq!(store.get_soa(1).unwrap().0.serial, 10);

        let serial = store.apply_edits(1, &[], None, 2).unwrap();
        assert_eq!(serial, 11);
    }

    #[test]
    fn edits_apply_and_roll_back_atomically() {
        let store = test_store(StoreLimits {
            max_records: 2,
            ..StoreLimits::default()
        });
        store.add_zone(&zone_row(1, "example.com.", 1), 0).unwrap();
        store.add_rr(1, a_rr("host.example.com.", "10.0.0.1", 120)).unwrap();

        // A failing batch: the second add overflows the two-slot pool.
        let result = store.apply_edits(
            1,
            &[
                Edit::Add(a_rr("x.example.com.", "10.0.0.2", 120)),
                Edit::Add(a_rr("y.example.com.", "10.0.0.3", 120)),
            ],
            None,
            5,
        );
        assert_eq!(result, Err(StoreError::Full));
        assert!(store.query(1, &name("x.example.com."), Rtype::A).is_empty());
        assert_eq!(store.get_soa(1).unwrap().0.serial, 1);

        // A working batch: replace the address.
        store
            .apply_edits(
                1,
                &[
                    Edit::DeleteRrset {
                        name: name("host.example.com."),
                        rtype: Rtype::A,
                    },
                    Edit::Add(a_rr("host.example.com.", "10.0.0.9", 120)),
                ],
                None,
                6,
            )
            .unwrap();
        let found = store.query(1, &name("host.example.com."), Rtype::A);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rdata, Rdata::A("10.0.0.9".parse().unwrap()));
        assert_eq!(store.get_soa(1).unwrap().0.serial, 2);
    }

    #[test]
    fn attach_checks_version() {
        let store = test_store(StoreLimits::default());
        let handle = Store::attach(&store).unwrap();
        handle.add_zone(&zone_row(1, "example.com.", 1), 0).unwrap();
        assert_eq!(store.stats().zones, 1);
    }
}
