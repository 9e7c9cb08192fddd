//! The backing store interface.
//!
//! The relational store and its schema belong to a collaborator; Palisade
//! only consumes the operations below.  Zone and record rows are loaded once
//! at startup into the in-memory store, and transfer/update operations write
//! back through the transactional surface.
//!
//! [`MemBackend`] implements the trait over plain vectors for tests and for
//! running without a database.

use std::fmt;
use std::sync::Mutex;

use palisade_proto::{Name, Rtype};

//----------- Row types --------------------------------------------------------

/// A zone row: identity, SOA columns and operational flags.
#[derive(Clone, Debug)]
pub struct ZoneRow {
    pub id: u32,
    pub origin: Name,
    pub ns: Name,
    pub mbox: Name,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
    /// TTL of the SOA record itself.
    pub ttl: u32,
    pub active: bool,
    /// Whether this zone is refreshed from a master rather than edited
    /// locally.
    pub slave_mode: bool,
    /// What dynamic UPDATE may do to this zone.
    pub update_policy: UpdatePolicy,
}

/// The per-zone dynamic-update permissions, all off by default.
///
/// When `tsig_key` is set, updates must arrive signed by that key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdatePolicy {
    pub allow_add: bool,
    pub allow_delete: bool,
    pub allow_update: bool,
    pub tsig_key: Option<Name>,
}

impl UpdatePolicy {
    /// Everything allowed, unsigned; test and bootstrap convenience.
    pub fn open() -> Self {
        Self {
            allow_add: true,
            allow_delete: true,
            allow_update: true,
            tsig_key: None,
        }
    }
}

/// A resource record row.
///
/// `rdata` is the text form the store keeps; `aux` carries the type-specific
/// priority (MX preference, SRV priority).
#[derive(Clone, Debug)]
pub struct RecordRow {
    pub zone_id: u32,
    pub name: Name,
    pub rtype: Rtype,
    pub ttl: u32,
    pub aux: u32,
    pub rdata: String,
}

/// An access-control rule row.  The typed fields are parsed by the ACL
/// module; `value` stays text here because its shape depends on `kind`.
#[derive(Clone, Debug)]
pub struct AclRow {
    pub id: u32,
    pub kind: String,
    pub target: String,
    pub action: String,
    pub value: String,
    pub enabled: bool,
}

/// A TSIG key row.  The secret is base64.
#[derive(Clone, Debug)]
pub struct TsigKeyRow {
    pub name: Name,
    pub algorithm: String,
    pub secret: String,
}

/// A DNSSEC key row.
///
/// The private key is a base64 PKCS#8 document; the public key is the
/// base64 DNSKEY public-key field.  `key_tag` is recomputed from the DNSKEY
/// RDATA at load time, never trusted from the row.
#[derive(Clone, Debug)]
pub struct DnssecKeyRow {
    pub zone_id: u32,
    pub flags: u16,
    pub algorithm: u8,
    pub public_key: String,
    pub private_key: String,
    pub role: String,
    pub status: String,
    pub created: u64,
    pub activate: u64,
    pub retire: u64,
}

/// Per-zone DNSSEC signing configuration.
#[derive(Clone, Debug, Default)]
pub struct DnssecConfigRow {
    pub zone_id: u32,
    pub enabled: bool,
    /// Use NSEC3 instead of NSEC for denial of existence.
    pub nsec3: bool,
    pub nsec3_iterations: u16,
    /// Hex-encoded salt; decoded when the signing context is built.
    pub nsec3_salt: String,
    /// RRSIG validity in seconds.
    pub signature_validity: u32,
}

//----------- Record text ------------------------------------------------------

/// The text form of record data as the backing store keeps it; the inverse
/// of [`Rdata::from_text`] for the types that have one.  Types without a
/// store text form are hex-encoded so write-back never loses data.
pub fn rdata_text(rdata: &palisade_proto::Rdata) -> String {
    use palisade_proto::Rdata;

    match rdata {
        Rdata::A(addr) => addr.to_string(),
        Rdata::Aaaa(addr) => addr.to_string(),
        Rdata::Ns(name) | Rdata::Cname(name) | Rdata::Ptr(name) => name.to_string(),
        Rdata::Mx { exchange, .. } => exchange.to_string(),
        Rdata::Srv {
            weight,
            port,
            target,
            ..
        } => format!("{weight} {port} {target}"),
        Rdata::Txt(strings) => strings
            .iter()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect::<Vec<_>>()
            .concat(),
        Rdata::Naptr {
            order,
            preference,
            flags,
            services,
            regexp,
            replacement,
        } => format!(
            "{order} {preference} \"{}\" \"{}\" \"{}\" {replacement}",
            String::from_utf8_lossy(flags),
            String::from_utf8_lossy(services),
            String::from_utf8_lossy(regexp),
        ),
        other => {
            let mut builder = palisade_proto::Builder::new(u16::MAX as usize);
            match other.append(&mut builder) {
                Ok(()) => hex::encode(builder.as_slice()),
                Err(_) => String::new(),
            }
        }
    }
}

//----------- SQL statement builders -------------------------------------------

/// The mutation statements handed to [`Backend::exec`].  The schema belongs
/// to the collaborator; these are the shapes its transactional surface
/// accepts.
pub mod sql {
    use palisade_proto::{Name, Rtype};

    fn quote(text: &str) -> String {
        text.replace('\'', "''")
    }

    pub fn insert_rr(
        zone_id: u32,
        name: &Name,
        rtype: Rtype,
        data: &str,
        aux: u32,
        ttl: u32,
    ) -> String {
        format!(
            "INSERT INTO rr (zone, name, type, data, aux, ttl) VALUES \
             ({zone_id}, '{}', '{rtype}', '{}', {aux}, {ttl})",
            quote(&name.to_string()),
            quote(data),
        )
    }

    pub fn delete_rr_exact(zone_id: u32, name: &Name, rtype: Rtype, data: &str) -> String {
        format!(
            "DELETE FROM rr WHERE zone = {zone_id} AND name = '{}' AND type = '{rtype}' \
             AND data = '{}'",
            quote(&name.to_string()),
            quote(data),
        )
    }

    pub fn delete_rrset(zone_id: u32, name: &Name, rtype: Rtype) -> String {
        format!(
            "DELETE FROM rr WHERE zone = {zone_id} AND name = '{}' AND type = '{rtype}'",
            quote(&name.to_string()),
        )
    }

    pub fn delete_name(zone_id: u32, name: &Name) -> String {
        format!(
            "DELETE FROM rr WHERE zone = {zone_id} AND name = '{}'",
            quote(&name.to_string()),
        )
    }

    pub fn delete_zone_rr(zone_id: u32) -> String {
        format!("DELETE FROM rr WHERE zone = {zone_id}")
    }

    pub fn update_serial(zone_id: u32, serial: u32) -> String {
        format!("UPDATE soa SET serial = {serial} WHERE id = {zone_id}")
    }
}

//----------- Backend ----------------------------------------------------------

/// The operations Palisade requires of the backing store.
pub trait Backend: Send + Sync {
    fn load_zones(&self) -> Result<Vec<ZoneRow>, BackendError>;
    fn load_records(&self, zone_id: u32) -> Result<Vec<RecordRow>, BackendError>;
    fn load_acl(&self) -> Result<Vec<AclRow>, BackendError>;
    fn load_tsig_keys(&self) -> Result<Vec<TsigKeyRow>, BackendError>;
    fn load_dnssec_keys(&self, zone_id: u32) -> Result<Vec<DnssecKeyRow>, BackendError>;
    fn load_dnssec_config(&self, zone_id: u32) -> Result<DnssecConfigRow, BackendError>;

    /// Open a transaction.  Transactions do not nest.
    fn begin(&self) -> Result<(), BackendError>;
    fn commit(&self) -> Result<(), BackendError>;
    fn rollback(&self) -> Result<(), BackendError>;

    /// Execute a mutation statement within the open transaction.
    fn exec(&self, sql: &str) -> Result<(), BackendError>;
}

impl fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Backend")
    }
}

//----------- BackendError -----------------------------------------------------

/// A backing-store failure.
#[derive(Clone, Debug)]
pub enum BackendError {
    /// The store rejected or could not execute an operation.
    Failed(String),
    /// `exec` was called with no open transaction, or `begin` twice.
    NoTransaction,
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "backing store failure: {reason}"),
            Self::NoTransaction => f.write_str("no open transaction"),
        }
    }
}

impl std::error::Error for BackendError {}

//----------- MemBackend -------------------------------------------------------

/// An in-memory [`Backend`].
///
/// Mutations are journaled as the statements that would have been executed;
/// tests assert on the journal and on transaction bracketing.
#[derive(Debug, Default)]
pub struct MemBackend {
    state: Mutex<MemState>,
}

#[derive(Debug, Default)]
struct MemState {
    zones: Vec<ZoneRow>,
    records: Vec<RecordRow>,
    acl: Vec<AclRow>,
    tsig_keys: Vec<TsigKeyRow>,
    dnssec_keys: Vec<DnssecKeyRow>,
    dnssec_configs: Vec<DnssecConfigRow>,

    in_txn: bool,
    pending: Vec<String>,
    journal: Vec<String>,
    /// When set, the next `commit` fails once.  Lets tests drive the
    /// rollback paths.
    fail_next_commit: bool,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_zone(&self, zone: ZoneRow) {
        self.state.lock().unwrap().zones.push(zone);
    }

    pub fn push_record(&self, record: RecordRow) {
        self.state.lock().unwrap().records.push(record);
    }

    pub fn push_acl(&self, rule: AclRow) {
        self.state.lock().unwrap().acl.push(rule);
    }

    pub fn push_tsig_key(&self, key: TsigKeyRow) {
        self.state.lock().unwrap().tsig_keys.push(key);
    }

    pub fn push_dnssec_key(&self, key: DnssecKeyRow) {
        self.state.lock().unwrap().dnssec_keys.push(key);
    }

    pub fn push_dnssec_config(&self, config: DnssecConfigRow) {
        self.state.lock().unwrap().dnssec_configs.push(config);
    }

    /// All statements committed so far.
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().unwrap().journal.clone()
    }

    /// Make the next `commit` fail.
    pub fn fail_next_commit(&self) {
        self.state.lock().unwrap().fail_next_commit = true;
    }
}

impl Backend for MemBackend {
    fn load_zones(&self) -> Result<Vec<ZoneRow>, BackendError> {
        Ok(self.state.lock().unwrap().zones.clone())
    }

    fn load_records(&self, zone_id: u32) -> Result<Vec<RecordRow>, BackendError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|r| r.zone_id == zone_id)
            .cloned()
            .collect())
    }

    fn load_acl(&self) -> Result<Vec<AclRow>, BackendError> {
        Ok(self.state.lock().unwrap().acl.clone())
    }

    fn load_tsig_keys(&self) -> Result<Vec<TsigKeyRow>, BackendError> {
        Ok(self.state.lock().unwrap().tsig_keys.clone())
    }

    fn load_dnssec_keys(&self, zone_id: u32) -> Result<Vec<DnssecKeyRow>, BackendError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .dnssec_keys
            .iter()
            .filter(|k| k.zone_id == zone_id)
            .cloned()
            .collect())
    }

    fn load_dnssec_config(&self, zone_id: u32) -> Result<DnssecConfigRow, BackendError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .dnssec_configs
            .iter()
            .find(|c| c.zone_id == zone_id)
            .cloned()
            .unwrap_or_default())
    }

    fn begin(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.in_txn {
            return Err(BackendError::NoTransaction);
        }
        state.in_txn = true;
        state.pending.clear();
        Ok(())
    }

    fn commit(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if !state.in_txn {
            return Err(BackendError::NoTransaction);
        }
        state.in_txn = false;
        if state.fail_next_commit {
            state.fail_next_commit = false;
            state.pending.clear();
            return Err(BackendError::Failed("commit failed".into()));
        }
        let pending = std::mem::take(&mut state.pending);
        state.journal.extend(pending);
        Ok(())
    }

    fn rollback(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.in_txn = false;
        state.pending.clear();
        Ok(())
    }

    fn exec(&self, sql: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if !state.in_txn {
            return Err(BackendError::NoTransaction);
        }
        state.pending.push(sql.to_string());
        Ok(())
    }
}
