//! The recursive cache and upstream forwarder.
//!
//! Queries for names outside every local zone are answered here when the
//! `cache` ACL target allows the client: a hash-table cache with TTL and
//! negative entries in front of round-robin UDP forwarding to the
//! configured upstreams.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, trace, warn};

use palisade_proto::{Message, Name, Rcode, Rdata, Record, Rtype};

use crate::metrics::{bump, Metrics};
use crate::util::{clamp_ttl, Clock};

/// Bucket count of the cache table; same scheme as the zone store.
const BUCKET_COUNT: u32 = 65536;

/// How long to wait for an upstream answer.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive failures after which an upstream is sidelined until every
/// server is failing.
const UPSTREAM_FAILURE_THRESHOLD: u32 = 3;

//----------- Cache configuration ----------------------------------------------

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl_min: u32,
    pub ttl_max: u32,
    /// Negative TTL when the upstream NXDOMAIN carries no SOA.
    pub negative_ttl: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 65536,
            ttl_min: 60,
            ttl_max: 86400,
            negative_ttl: 300,
        }
    }
}

//----------- Cache ------------------------------------------------------------

/// The state of a cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    Valid,
    /// Caches an NXDOMAIN; carries no records.
    Negative,
}

#[derive(Clone, Debug)]
struct CacheEntry {
    name: Name,
    rtype: Rtype,
    records: Vec<Record>,
    expires: u64,
    state: EntryState,
}

/// A cache hit as handed to the responder.
#[derive(Clone, Debug)]
pub struct CachedAnswer {
    pub records: Vec<Record>,
    pub state: EntryState,
}

/// The record cache.
#[derive(Debug)]
pub struct Cache {
    table: RwLock<CacheTable>,
    config: CacheConfig,
    metrics: Arc<Metrics>,
}

#[derive(Debug, Default)]
struct CacheTable {
    buckets: foldhash::HashMap<u16, Vec<CacheEntry>>,
    count: usize,
}

fn bucket_of(name: &Name) -> u16 {
    (name.djb2() % BUCKET_COUNT) as u16
}

impl Cache {
    pub fn new(config: CacheConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            table: RwLock::new(CacheTable::default()),
            config,
            metrics,
        }
    }

    /// Look up an unexpired entry.  Hit records come back with their TTL
    /// reduced to the remaining lifetime.
    pub fn lookup(&self, name: &Name, rtype: Rtype, now: u64) -> Option<CachedAnswer> {
        let table = self.table.read().unwrap();
        let entry = table
            .buckets
            .get(&bucket_of(name))?
            .iter()
            .find(|e| e.name == *name && e.rtype == rtype && e.expires > now);

        match entry {
            Some(entry) => {
                bump(&self.metrics.cache_hits);
                let remaining = (entry.expires - now) as u32;
                let records = entry
                    .records
                    .iter()
                    .map(|r| Record {
                        ttl: r.ttl.min(remaining),
                        ..r.clone()
                    })
                    .collect();
                Some(CachedAnswer {
                    records,
                    state: entry.state,
                })
            }
            None => {
                bump(&self.metrics.cache_misses);
                None
            }
        }
    }

    /// Insert a positive answer.  The TTL is clamped into the configured
    /// window before use.
    pub fn insert(&self, name: Name, rtype: Rtype, records: Vec<Record>, ttl: u32, now: u64) {
        self.insert_entry(name, rtype, records, ttl, now, EntryState::Valid);
    }

    /// Insert a negative (NXDOMAIN) entry with the SOA-derived TTL.
    pub fn insert_negative(&self, name: Name, rtype: Rtype, ttl: u32, now: u64) {
        self.insert_entry(name, rtype, Vec::new(), ttl, now, EntryState::Negative);
    }

    fn insert_entry(
        &self,
        name: Name,
        rtype: Rtype,
        records: Vec<Record>,
        ttl: u32,
        now: u64,
        state: EntryState,
    ) {
        let ttl = clamp_ttl(ttl, self.config.ttl_min, self.config.ttl_max);
        let bucket = bucket_of(&name);
        let mut table = self.table.write().unwrap();

        // Replace an existing entry for the same key in place.
        let chain = table.buckets.entry(bucket).or_default();
        if let Some(existing) = chain
            .iter_mut()
            .find(|e| e.name == name && e.rtype == rtype)
        {
            existing.records = records;
            existing.expires = now + u64::from(ttl);
            existing.state = state;
            return;
        }

        // Full: first drop expired entries in this bucket, then the oldest
        // one; an empty bucket under pressure rejects the insert.
        if table.count >= self.config.max_entries {
            let chain = table.buckets.get_mut(&bucket).expect("entry created above");
            let before = chain.len();
            chain.retain(|e| e.expires > now);
            let dropped = before - chain.len();
            table.count -= dropped;

            if table.count >= self.config.max_entries {
                let chain = table.buckets.get_mut(&bucket).expect("entry created above");
                if let Some((oldest, _)) = chain
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| e.expires)
                    .map(|(i, e)| (i, e.expires))
                {
                    chain.remove(oldest);
                    table.count -= 1;
                    bump(&self.metrics.cache_evictions);
                } else {
                    trace!("cache full, dropping insert for {name}");
                    return;
                }
            }
        }

        table
            .buckets
            .get_mut(&bucket)
            .expect("entry created above")
            .push(CacheEntry {
                name,
                rtype,
                records,
                expires: now + u64::from(ttl),
                state,
            });
        table.count += 1;
        bump(&self.metrics.cache_inserts);
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn sweep(&self, now: u64) -> usize {
        let mut table = self.table.write().unwrap();
        let mut removed = 0;
        table.buckets.retain(|_, chain| {
            let before = chain.len();
            chain.retain(|e| e.expires > now);
            removed += before - chain.len();
            !chain.is_empty()
        });
        table.count -= removed;
        removed
    }

    pub fn len(&self) -> usize {
        self.table.read().unwrap().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//----------- Upstreams --------------------------------------------------------

/// The upstream servers, walked round-robin with per-server failure
/// tracking.
#[derive(Debug)]
pub struct Upstreams {
    servers: Vec<SocketAddr>,
    next: AtomicUsize,
    failures: Vec<AtomicU32>,
}

impl Upstreams {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        let failures = servers.iter().map(|_| AtomicU32::new(0)).collect();
        Self {
            servers,
            next: AtomicUsize::new(0),
            failures,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// The order to try servers in for one query: round-robin from the
    /// rotation point, healthy servers first.
    fn attempt_order(&self) -> Vec<usize> {
        let n = self.servers.len();
        if n == 0 {
            return Vec::new();
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % n;
        let rotated = (0..n).map(|i| (start + i) % n);
        let (healthy, sidelined): (Vec<usize>, Vec<usize>) = rotated.partition(|&i| {
            self.failures[i].load(Ordering::Relaxed) < UPSTREAM_FAILURE_THRESHOLD
        });
        healthy.into_iter().chain(sidelined).collect()
    }

    fn record_success(&self, index: usize) {
        self.failures[index].store(0, Ordering::Relaxed);
    }

    fn record_failure(&self, index: usize) {
        self.failures[index].fetch_add(1, Ordering::Relaxed);
    }
}

//----------- UpstreamError ----------------------------------------------------

/// Recursive forwarding failed; the client gets SERVFAIL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpstreamError {
    /// No upstream is configured.
    NoUpstreams,
    /// Every upstream timed out or errored.
    Exhausted,
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoUpstreams => f.write_str("no upstream servers configured"),
            Self::Exhausted => f.write_str("all upstream servers failed"),
        }
    }
}

impl std::error::Error for UpstreamError {}

//----------- Recursor ---------------------------------------------------------

/// Cache plus forwarding: the whole recursive path.
#[derive(Debug)]
pub struct Recursor {
    cache: Cache,
    upstreams: Upstreams,
    clock: Clock,
    metrics: Arc<Metrics>,
}

impl Recursor {
    pub fn new(
        config: CacheConfig,
        upstreams: Vec<SocketAddr>,
        clock: Clock,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cache: Cache::new(config, metrics.clone()),
            upstreams: Upstreams::new(upstreams),
            clock,
            metrics,
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Resolve a query through the cache, forwarding on a miss.
    ///
    /// The ACL gate for the `cache` target is the caller's business; this
    /// path begins at the cache lookup.
    pub async fn resolve(&self, query: &Message) -> Message {
        let mut response = Message::response_to(query);
        response.header.ra = true;

        let [question] = query.questions.as_slice() else {
            response.header.rcode = Rcode::FORMERR;
            return response;
        };
        let now = self.clock.now_unix();

        if let Some(hit) = self.cache.lookup(&question.qname, question.qtype, now) {
            match hit.state {
                EntryState::Valid => response.answers = hit.records,
                EntryState::Negative => response.header.rcode = Rcode::NXDOMAIN,
            }
            return response;
        }

        match self.forward(question.qname.clone(), question.qtype).await {
            Ok(upstream) => {
                let now = self.clock.now_unix();
                if upstream.header.rcode == Rcode::NXDOMAIN {
                    let ttl = negative_ttl_of(&upstream).unwrap_or(self.cache.config.negative_ttl);
                    self.cache
                        .insert_negative(question.qname.clone(), question.qtype, ttl, now);
                    response.header.rcode = Rcode::NXDOMAIN;
                } else {
                    if !upstream.answers.is_empty() {
                        let ttl = upstream.answers.iter().map(|r| r.ttl).min().unwrap_or(0);
                        self.cache.insert(
                            question.qname.clone(),
                            question.qtype,
                            upstream.answers.clone(),
                            ttl,
                            now,
                        );
                    }
                    response.header.rcode = upstream.header.rcode;
                    response.answers = upstream.answers;
                    response.authorities = upstream.authorities;
                }
            }
            Err(err) => {
                warn!("recursive lookup for {} failed: {err}", question.qname);
                bump(&self.metrics.upstream_failures);
                response.header.rcode = Rcode::SERVFAIL;
            }
        }
        response
    }

    /// Forward one question upstream over UDP, trying each server in
    /// rotation until one answers sensibly.
    async fn forward(&self, qname: Name, qtype: Rtype) -> Result<Message, UpstreamError> {
        if self.upstreams.is_empty() {
            return Err(UpstreamError::NoUpstreams);
        }

        for index in self.upstreams.attempt_order() {
            let server = self.upstreams.servers[index];
            match self.forward_one(server, &qname, qtype).await {
                Ok(message) => {
                    self.upstreams.record_success(index);
                    return Ok(message);
                }
                Err(reason) => {
                    debug!("upstream {server} failed: {reason}");
                    self.upstreams.record_failure(index);
                }
            }
        }
        Err(UpstreamError::Exhausted)
    }

    async fn forward_one(
        &self,
        server: SocketAddr,
        qname: &Name,
        qtype: Rtype,
    ) -> Result<Message, String> {
        let id: u16 = rand::random();
        let mut query = Message::query(id, qname.clone(), qtype);
        query.header.rd = true;
        let wire = query.build(palisade_proto::message::UDP_PAYLOAD_LIMIT);

        let socket = tokio::net::UdpSocket::bind(local_any(server))
            .await
            .map_err(|e| e.to_string())?;
        socket
            .send_to(&wire, server)
            .await
            .map_err(|e| e.to_string())?;

        let mut buf = vec![0u8; 4096];
        let (len, from) = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| "timeout".to_string())?
            .map_err(|e| e.to_string())?;
        if from.ip() != server.ip() {
            return Err("response from unexpected address".into());
        }

        let message = Message::parse(&buf[..len]).map_err(|e| e.to_string())?;
        if message.header.id != id {
            return Err("response id mismatch".into());
        }
        let echoes = message
            .questions
            .first()
            .is_some_and(|q| q.qname == *qname && q.qtype == qtype);
        if !echoes {
            return Err("response question does not echo query".into());
        }
        Ok(message)
    }
}

/// The SOA minimum from an NXDOMAIN authority section, for negative TTLs.
fn negative_ttl_of(message: &Message) -> Option<u32> {
    message.authorities.iter().find_map(|record| {
        if let Rdata::Soa(soa) = &record.rdata {
            Some(record.ttl.min(soa.minimum))
        } else {
            None
        }
    })
}

fn local_any(server: SocketAddr) -> SocketAddr {
    if server.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn a_record(owner: &str, addr: &str, ttl: u32) -> Record {
        Record::new(name(owner), Rtype::A, ttl, Rdata::A(addr.parse().unwrap()))
    }

    fn cache(config: CacheConfig) -> Cache {
        Cache::new(config, Arc::new(Metrics::new()))
    }

    #[test]
    fn ttl_is_clamped_on_insert() {
        let cache = cache(CacheConfig {
            ttl_min: 60,
            ttl_max: 3600,
            ..CacheConfig::default()
        });

        cache.insert(
            name("low.test."),
            Rtype::A,
            vec![a_record("low.test.", "192.0.2.1", 5)],
            5,
            1000,
        );
        cache.insert(
            name("high.test."),
            Rtype::A,
            vec![a_record("high.test.", "192.0.2.2", 99999)],
            99999,
            1000,
        );

        // The low entry lives until 1060, the high one until 4600.
        assert!(cache.lookup(&name("low.test."), Rtype::A, 1059).is_some());
        assert!(cache.lookup(&name("low.test."), Rtype::A, 1061).is_none());
        assert!(cache.lookup(&name("high.test."), Rtype::A, 4599).is_some());
        assert!(cache.lookup(&name("high.test."), Rtype::A, 4601).is_none());
    }

    #[test]
    fn negative_entries_cache_nxdomain() {
        let cache = cache(CacheConfig::default());
        cache.insert_negative(name("gone.test."), Rtype::A, 300, 0);

        let hit = cache.lookup(&name("gone.test."), Rtype::A, 100).unwrap();
        assert_eq!(hit.state, EntryState::Negative);
        assert!(hit.records.is_empty());
    }

    #[test]
    fn hit_ttls_count_down() {
        let cache = cache(CacheConfig::default());
        cache.insert(
            name("x.test."),
            Rtype::A,
            vec![a_record("x.test.", "192.0.2.1", 600)],
            600,
            1000,
        );
        let hit = cache.lookup(&name("x.test."), Rtype::A, 1400).unwrap();
        assert_eq!(hit.records[0].ttl, 200);
    }

    #[test]
    fn capacity_pressure_evicts_or_rejects() {
        let cache = cache(CacheConfig {
            max_entries: 4,
            ttl_min: 1,
            ..CacheConfig::default()
        });
        for i in 0..4 {
            cache.insert(
                name(&format!("n{i}.test.")),
                Rtype::A,
                vec![],
                100 + i,
                0,
            );
        }
        assert_eq!(cache.len(), 4);
        cache.insert(name("overflow.test."), Rtype::A, vec![], 500, 0);
        // Either an old entry was evicted in the colliding bucket or the
        // insert was rejected; the bound holds regardless.
        assert!(cache.len() <= 4);
    }

    #[test]
    fn sweep_removes_expired() {
        let cache = cache(CacheConfig {
            ttl_min: 1,
            ttl_max: 86400,
            ..CacheConfig::default()
        });
        cache.insert(name("a.test."), Rtype::A, vec![], 100, 0);
        cache.insert(name("b.test."), Rtype::A, vec![], 5000, 0);
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.sweep(1000), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(&name("b.test."), Rtype::A, 1000).is_some());
    }

    #[test]
    fn reinsert_replaces_in_place() {
        let cache = cache(CacheConfig::default());
        cache.insert(
            name("r.test."),
            Rtype::A,
            vec![a_record("r.test.", "192.0.2.1", 300)],
            300,
            0,
        );
        cache.insert(
            name("r.test."),
            Rtype::A,
            vec![a_record("r.test.", "192.0.2.9", 300)],
            300,
            10,
        );
        assert_eq!(cache.len(), 1);
        let hit = cache.lookup(&name("r.test."), Rtype::A, 20).unwrap();
        assert_eq!(hit.records[0].rdata, Rdata::A("192.0.2.9".parse().unwrap()));
    }

    #[test]
    fn upstream_rotation_sidelines_failing_servers() {
        let upstreams = Upstreams::new(vec![
            "192.0.2.1:53".parse().unwrap(),
            "192.0.2.2:53".parse().unwrap(),
            "192.0.2.3:53".parse().unwrap(),
        ]);

        // Rotation moves the starting point.
        let first = upstreams.attempt_order();
        let second = upstreams.attempt_order();
        assert_eq!(first.len(), 3);
        assert_ne!(first[0], second[0]);

        // A server over the failure threshold drops to the back.
        for _ in 0..UPSTREAM_FAILURE_THRESHOLD {
            upstreams.record_failure(0);
        }
        let order = upstreams.attempt_order();
        assert_eq!(*order.last().unwrap(), 0);

        // Success puts it back into rotation.
        upstreams.record_success(0);
        assert!(upstreams
            .attempt_order()
            .iter()
            .position(|&i| i == 0)
            .unwrap() < 3);
    }

    #[test]
    fn negative_ttl_prefers_upstream_soa() {
        use palisade_proto::Soa;

        let mut message = Message::default();
        message.authorities.push(Record::new(
            name("example.org."),
            Rtype::SOA,
            900,
            Rdata::Soa(Soa {
                mname: name("ns1.example.org."),
                rname: name("host.example.org."),
                serial: 1,
                refresh: 1,
                retry: 1,
                expire: 1,
                minimum: 120,
            }),
        ));
        assert_eq!(negative_ttl_of(&message), Some(120));
        assert_eq!(negative_ttl_of(&Message::default()), None);
    }
}
