//! Maintaining and reporting runtime counters.
//!
//! The counters the components scatter around (store lookups, ACL decisions,
//! cache behavior, transfer outcomes) are collected into one structure so a
//! periodic log line can report the state of the world.  There is no metrics
//! exposition endpoint; the admin plane is a separate consumer of the backing
//! store and out of scope here.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

//----------- Metrics ----------------------------------------------------------

/// Process-wide counters.  All increments are relaxed; the numbers are for
/// operators, not for synchronization.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Authoritative lookups answered from the zone store.
    pub queries: AtomicU64,
    pub query_hits: AtomicU64,
    pub query_misses: AtomicU64,

    /// ACL evaluations and denials across all targets.
    pub acl_checks: AtomicU64,
    pub acl_denies: AtomicU64,

    /// Recursive cache behavior.
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_inserts: AtomicU64,
    pub cache_evictions: AtomicU64,

    /// Upstream forwarding failures (all upstreams exhausted).
    pub upstream_failures: AtomicU64,

    /// Zone transfers.
    pub transfers: AtomicU64,
    pub transfer_failures: AtomicU64,
    pub notifies: AtomicU64,

    /// Dynamic updates.
    pub updates: AtomicU64,
    pub update_refusals: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Snapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        Snapshot {
            queries: load(&self.queries),
            query_hits: load(&self.query_hits),
            query_misses: load(&self.query_misses),
            acl_checks: load(&self.acl_checks),
            acl_denies: load(&self.acl_denies),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            cache_inserts: load(&self.cache_inserts),
            cache_evictions: load(&self.cache_evictions),
            upstream_failures: load(&self.upstream_failures),
            transfers: load(&self.transfers),
            transfer_failures: load(&self.transfer_failures),
            notifies: load(&self.notifies),
            updates: load(&self.updates),
            update_refusals: load(&self.update_refusals),
        }
    }
}

/// Bump a counter by one.
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

//----------- Snapshot ---------------------------------------------------------

/// A point-in-time copy of every counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub queries: u64,
    pub query_hits: u64,
    pub query_misses: u64,
    pub acl_checks: u64,
    pub acl_denies: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_inserts: u64,
    pub cache_evictions: u64,
    pub upstream_failures: u64,
    pub transfers: u64,
    pub transfer_failures: u64,
    pub notifies: u64,
    pub updates: u64,
    pub update_refusals: u64,
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queries={} (hit {}, miss {}) acl={}|{} cache={}|{} (ins {}, evict {}) \
             xfr={}|{} notify={} update={}|{} upstream_fail={}",
            self.queries,
            self.query_hits,
            self.query_misses,
            self.acl_checks,
            self.acl_denies,
            self.cache_hits,
            self.cache_misses,
            self.cache_inserts,
            self.cache_evictions,
            self.transfers,
            self.transfer_failures,
            self.notifies,
            self.updates,
            self.update_refusals,
            self.upstream_failures,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_bumps() {
        let metrics = Metrics::new();
        bump(&metrics.queries);
        bump(&metrics.queries);
        bump(&metrics.acl_denies);
        let snap = metrics.snapshot();
        assert_eq!(snap.queries, 2);
        assert_eq!(snap.acl_denies, 1);
        assert_eq!(snap.cache_hits, 0);
    }
}
