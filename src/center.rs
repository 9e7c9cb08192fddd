//! Palisade's central state.
//!
//! One [`Center`] holds everything the units share: the zone store, the ACL
//! pool inside it, the TSIG keyring, the per-zone signers, the recursive
//! cache and the backing-store handle.  It is built once at startup by
//! loading the backing store, then handed around behind an `Arc`.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use palisade_proto::Name;

use crate::acl::AclRule;
use crate::cache::{CacheConfig, Recursor};
use crate::config::Config;
use crate::db::Backend;
use crate::dnssec::{DnssecConfig, SigningKey, ZoneSigner};
use crate::metrics::Metrics;
use crate::resolver::Authority;
use crate::store::{Store, StoredRecord};
use crate::tsig::Keyring;
use crate::update::UpdateHandler;
use crate::util::Clock;

/// How many NOTIFY-triggered refresh requests may queue before the UDP
/// path starts dropping them.
const REFRESH_QUEUE_DEPTH: usize = 64;

//----------- Center -----------------------------------------------------------

/// The shared hub.
#[derive(Debug)]
pub struct Center {
    pub config: Config,
    pub clock: Clock,
    pub metrics: Arc<Metrics>,

    /// The zone store; also owns the ACL pool and the shared counters.
    pub store: Store,

    /// The backing store.
    pub backend: Arc<dyn Backend>,

    /// TSIG keys, swapped wholesale on reload so readers never block.
    pub keyring: Arc<ArcSwap<Keyring>>,

    /// The authoritative query path.
    pub authority: Authority,

    /// The recursive path; absent when no upstreams are configured or the
    /// cache is disabled.
    pub recursor: Option<Recursor>,

    /// The dynamic-update server half.
    pub updates: UpdateHandler,

    /// Serializes UPDATE processing so prerequisite evaluation and apply
    /// act on one consistent snapshot per request.
    pub update_gate: tokio::sync::Mutex<()>,

    /// Queue of zones to refresh out of band (NOTIFY).
    pub refresh_tx: mpsc::Sender<Name>,
}

/// Build the center by loading everything from the backing store.
///
/// Returns the refresh queue receiver alongside; the transfer unit owns it.
pub fn init(
    config: Config,
    backend: Arc<dyn Backend>,
    clock: Clock,
) -> Result<(Arc<Center>, mpsc::Receiver<Name>), String> {
    let metrics = Arc::new(Metrics::new());
    let store = Store::create(config.limits, metrics.clone());
    let now = clock.now_unix();

    // Zones and records.
    let zones = backend
        .load_zones()
        .map_err(|err| format!("cannot load zones: {err}"))?;
    let mut records_loaded = 0usize;
    for zone in &zones {
        if let Err(err) = store.add_zone(zone, now) {
            return Err(format!("cannot add zone '{}': {err}", zone.origin));
        }
        let records = backend
            .load_records(zone.id)
            .map_err(|err| format!("cannot load records for '{}': {err}", zone.origin))?;
        for row in &records {
            let record = match StoredRecord::from_row(row) {
                Ok(record) => record,
                Err(err) => {
                    warn!(
                        "skipping record '{}' {} in zone '{}': {err}",
                        row.name, row.rtype, zone.origin
                    );
                    continue;
                }
            };
            match store.add_rr(zone.id, record) {
                Ok(()) => records_loaded += 1,
                Err(err) => {
                    warn!(
                        "cannot store record '{}' in zone '{}': {err}",
                        row.name, zone.origin
                    );
                }
            }
        }
    }
    info!("loaded {} zones, {records_loaded} records", zones.len());

    // ACL rules, including the config-file recursive allow list.
    let rules = load_acl_rules(&config, &*backend)?;
    store
        .set_acl(rules)
        .map_err(|err| format!("cannot install ACL rules: {err}"))?;

    // TSIG keys from the store plus the zone-masters file.
    let keyring = Arc::new(ArcSwap::from_pointee(load_keyring(&config, &*backend)?));

    // Per-zone DNSSEC signers.
    let mut signers = foldhash::HashMap::default();
    for zone in &zones {
        let rows = backend
            .load_dnssec_keys(zone.id)
            .map_err(|err| format!("cannot load DNSSEC keys for '{}': {err}", zone.origin))?;
        if rows.is_empty() {
            continue;
        }
        let mut keys = Vec::new();
        for row in &rows {
            match SigningKey::from_row(row) {
                Ok(key) => keys.push(Arc::new(key)),
                Err(err) => {
                    warn!("skipping DNSSEC key for '{}': {err}", zone.origin);
                }
            }
        }
        if keys.is_empty() {
            continue;
        }
        let config_row = backend
            .load_dnssec_config(zone.id)
            .map_err(|err| format!("cannot load DNSSEC config for '{}': {err}", zone.origin))?;
        let signer = ZoneSigner::new(
            zone.id,
            zone.origin.clone(),
            DnssecConfig::from_row(&config_row),
            keys,
        );
        debug!("zone '{}' signs with {} keys", zone.origin, signer.dnskey_records(0).len());
        signers.insert(zone.id, Arc::new(signer));
    }
    let signers = Arc::new(signers);

    let authority = Authority::new(store.clone(), signers, clock.clone());

    let recursor = if config.recursive.cache_enabled && !config.recursive.upstreams.is_empty() {
        Some(Recursor::new(
            CacheConfig {
                max_entries: config.recursive.max_entries(),
                ttl_min: config.recursive.ttl_min,
                ttl_max: config.recursive.ttl_max,
                ..CacheConfig::default()
            },
            config.recursive.upstreams.clone(),
            clock.clone(),
            metrics.clone(),
        ))
    } else {
        None
    };

    let updates = UpdateHandler::new(store.clone(), backend.clone(), clock.clone());

    let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_QUEUE_DEPTH);
    let center = Arc::new(Center {
        config,
        clock,
        metrics,
        store,
        backend,
        keyring,
        authority,
        recursor,
        updates,
        update_gate: tokio::sync::Mutex::new(()),
        refresh_tx,
    });
    Ok((center, refresh_rx))
}

/// Load the ACL pool: backing-store rows plus the `recursive-acl` prefixes
/// from the configuration, which become allow rules for the cache target.
pub fn load_acl_rules(config: &Config, backend: &dyn Backend) -> Result<Vec<AclRule>, String> {
    let rows = backend
        .load_acl()
        .map_err(|err| format!("cannot load ACL rules: {err}"))?;

    let mut rules = Vec::with_capacity(rows.len() + config.recursive.acl.len());
    for row in &rows {
        match AclRule::from_row(row) {
            Ok(rule) => rules.push(rule),
            Err(err) => warn!("skipping ACL rule {}: {err}", row.id),
        }
    }

    // Config-sourced cache allow list; ids above the row space.
    for (i, prefix) in config.recursive.acl.iter().enumerate() {
        match crate::acl::parse_cidr(prefix) {
            Some(kind) => rules.push(AclRule {
                id: 1_000_000 + i as u32,
                kind,
                target: crate::acl::Target::Cache,
                action: crate::acl::Action::Allow,
                enabled: true,
            }),
            None => warn!("skipping malformed recursive-acl entry '{prefix}'"),
        }
    }
    Ok(rules)
}

/// Load TSIG keys from the backing store and the zone-masters file.
pub fn load_keyring(config: &Config, backend: &dyn Backend) -> Result<Keyring, String> {
    let mut keyring = Keyring::default();
    let rows = backend
        .load_tsig_keys()
        .map_err(|err| format!("cannot load TSIG keys: {err}"))?;
    for row in &rows {
        match crate::tsig::Key::from_row(row) {
            Some(key) => keyring.insert(key),
            None => warn!("skipping TSIG key '{}': bad algorithm or secret", row.name),
        }
    }

    // Keys declared inline in master blocks.
    if let Ok(text) = std::fs::read_to_string(&config.masters_file) {
        if let Ok(parsed) = crate::config::masters::parse(&text) {
            for key in parsed.keys {
                keyring.insert(key);
            }
        }
    }
    Ok(keyring)
}

/// Reload the hot tables: ACL rules and TSIG keys.  Called every few
/// minutes and on SIGHUP.
pub fn reload_acl(center: &Center) {
    match load_acl_rules(&center.config, &*center.backend) {
        Ok(rules) => {
            let count = rules.len();
            match center.store.set_acl(rules) {
                Ok(()) => debug!("reloaded {count} ACL rules"),
                Err(err) => warn!("ACL reload refused: {err}"),
            }
        }
        Err(err) => warn!("ACL reload failed: {err}"),
    }
    match load_keyring(&center.config, &*center.backend) {
        Ok(keyring) => {
            debug!("reloaded {} TSIG keys", keyring.len());
            center.keyring.store(Arc::new(keyring));
        }
        Err(err) => warn!("TSIG keyring reload failed: {err}"),
    }
}
