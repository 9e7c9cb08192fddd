//! Dynamic UPDATE (RFC 2136).
//!
//! The message sections are reinterpreted: the question is the zone
//! section, answers are prerequisites, authorities are updates.
//! Prerequisites are evaluated against the current zone snapshot; on
//! success the updates apply as one transaction against the backing store
//! and the in-memory zone, and the SOA serial moves forward.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use palisade_proto::{Class, Message, Name, Rcode, Rdata, Record, Rtype};

use crate::acl::{self, Target};
use crate::db::{rdata_text, sql, Backend};
use crate::metrics::bump;
use crate::store::{Edit, Store, StoredRecord, ZoneMeta};
use crate::tsig::Verified;
use crate::util::Clock;

//----------- UpdateError ------------------------------------------------------

/// A refused or failed update, carrying the rcode the client gets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdateError(pub Rcode);

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "update refused with {}", self.0)
    }
}

impl std::error::Error for UpdateError {}

//----------- UpdateHandler ----------------------------------------------------

/// The dynamic-update server half.
pub struct UpdateHandler {
    store: Store,
    backend: Arc<dyn Backend>,
    clock: Clock,
}

impl UpdateHandler {
    pub fn new(store: Store, backend: Arc<dyn Backend>, clock: Clock) -> Self {
        Self {
            store,
            backend,
            clock,
        }
    }

    /// Process one UPDATE message and produce the response.
    ///
    /// `verified` carries the TSIG state the server layer established for
    /// this message, if any.
    pub fn handle(
        &self,
        message: &Message,
        client: IpAddr,
        verified: Option<&Verified>,
    ) -> Message {
        let mut response = Message::response_to(message);
        let metrics = self.store.metrics().clone();

        match self.process(message, client, verified) {
            Ok(serial) => {
                bump(&metrics.updates);
                response.header.rcode = Rcode::NOERROR;
                debug!("update committed at serial {serial}");
            }
            Err(UpdateError(rcode)) => {
                bump(&metrics.update_refusals);
                response.header.rcode = rcode;
            }
        }
        response
    }

    fn process(
        &self,
        message: &Message,
        client: IpAddr,
        verified: Option<&Verified>,
    ) -> Result<u32, UpdateError> {
        // Zone section: exactly one entry, SOA-typed, class IN.
        let [zone_section] = message.questions.as_slice() else {
            return Err(UpdateError(Rcode::FORMERR));
        };
        if zone_section.qtype != Rtype::SOA || zone_section.qclass != Class::IN {
            return Err(UpdateError(Rcode::FORMERR));
        }

        let zone = self
            .store
            .find_zone(&zone_section.qname)
            .ok_or(UpdateError(Rcode::NOTAUTH))?;
        if zone.origin != zone_section.qname {
            return Err(UpdateError(Rcode::NOTZONE));
        }
        if zone.slave_mode {
            // Slaves forward nothing; the master is authoritative for
            // mutations.
            return Err(UpdateError(Rcode::NOTIMP));
        }

        if !acl::evaluate(&self.store, Target::Master, client, None, None).is_allowed() {
            debug!("update for '{}' from {client} denied by ACL", zone.origin);
            return Err(UpdateError(Rcode::REFUSED));
        }

        // A zone keyed for updates accepts only messages signed by that
        // exact key.
        if let Some(required) = &zone.update_policy.tsig_key {
            match verified {
                Some(v) if v.key_name == *required => {}
                _ => {
                    debug!("update for '{}' missing required TSIG key", zone.origin);
                    return Err(UpdateError(Rcode::NOTAUTH));
                }
            }
        }

        self.check_prerequisites(&zone, &message.answers)?;
        let edits = self.plan_updates(&zone, &message.authorities)?;

        let new_serial = self.apply(&zone, &edits).map_err(|err| {
            warn!("update for '{}' failed to apply: {err}", zone.origin);
            UpdateError(Rcode::SERVFAIL)
        })?;
        info!(
            "zone '{}' updated by {client}: {} operations, serial {new_serial}",
            zone.origin,
            edits.len()
        );
        Ok(new_serial)
    }

    /// RFC 2136 §2.4/§3.2: evaluate each prerequisite against the current
    /// zone contents.
    fn check_prerequisites(
        &self,
        zone: &ZoneMeta,
        prereqs: &[Record],
    ) -> Result<(), UpdateError> {
        // Value-dependent prerequisites compare whole RRsets, so collect
        // them per (name, type) first.
        let mut value_sets: Vec<(Name, Rtype, Vec<Rdata>)> = Vec::new();

        for prereq in prereqs {
            if prereq.ttl != 0 {
                return Err(UpdateError(Rcode::FORMERR));
            }
            if !prereq.owner.ends_with(&zone.origin) {
                return Err(UpdateError(Rcode::NOTZONE));
            }

            let empty_rdata = matches!(&prereq.rdata, Rdata::Other(bytes) if bytes.is_empty());
            match prereq.class {
                Class::ANY if prereq.rtype == Rtype::ANY => {
                    // Name is in use.
                    if !self.store.name_exists(zone.zone_id, &prereq.owner) {
                        return Err(UpdateError(Rcode::NXDOMAIN));
                    }
                }
                Class::ANY => {
                    // RRset exists, value independent.
                    if self
                        .store
                        .query(zone.zone_id, &prereq.owner, prereq.rtype)
                        .is_empty()
                    {
                        return Err(UpdateError(Rcode::NXRRSET));
                    }
                }
                Class::NONE if prereq.rtype == Rtype::ANY => {
                    // Name is not in use.
                    if self.store.name_exists(zone.zone_id, &prereq.owner) {
                        return Err(UpdateError(Rcode::YXDOMAIN));
                    }
                }
                Class::NONE => {
                    // RRset does not exist.
                    if !self
                        .store
                        .query(zone.zone_id, &prereq.owner, prereq.rtype)
                        .is_empty()
                    {
                        return Err(UpdateError(Rcode::YXRRSET));
                    }
                }
                Class::IN if !empty_rdata => {
                    // RRset exists with exactly this value set.
                    match value_sets.iter_mut().find(|(name, rtype, _)| {
                        *name == prereq.owner && *rtype == prereq.rtype
                    }) {
                        Some((_, _, rdatas)) => rdatas.push(prereq.rdata.clone()),
                        None => value_sets.push((
                            prereq.owner.clone(),
                            prereq.rtype,
                            vec![prereq.rdata.clone()],
                        )),
                    }
                }
                _ => return Err(UpdateError(Rcode::FORMERR)),
            }
        }

        for (name, rtype, wanted) in value_sets {
            let mut present: Vec<Vec<u8>> = self
                .store
                .query(zone.zone_id, &name, rtype)
                .iter()
                .map(|r| r.rdata.canonical_bytes())
                .collect();
            let mut wanted: Vec<Vec<u8>> =
                wanted.iter().map(Rdata::canonical_bytes).collect();
            present.sort();
            wanted.sort();
            if present != wanted {
                return Err(UpdateError(Rcode::NXRRSET));
            }
        }
        Ok(())
    }

    /// RFC 2136 §2.5/§3.4: validate the update section and stage edits,
    /// enforcing the zone's permission bits.
    fn plan_updates(&self, zone: &ZoneMeta, updates: &[Record]) -> Result<Vec<Edit>, UpdateError> {
        let policy = &zone.update_policy;
        let mut edits = Vec::with_capacity(updates.len());

        for update in updates {
            if !update.owner.ends_with(&zone.origin) {
                return Err(UpdateError(Rcode::NOTZONE));
            }

            match update.class {
                Class::IN => {
                    // ADD.  Meta types and empty rdata are nonsense here.
                    if update.rtype.is_meta() || update.rtype == Rtype::SOA {
                        return Err(UpdateError(Rcode::FORMERR));
                    }
                    let rrset_exists = !self
                        .store
                        .query(zone.zone_id, &update.owner, update.rtype)
                        .is_empty();
                    let allowed = if rrset_exists {
                        policy.allow_update || policy.allow_add
                    } else {
                        policy.allow_add
                    };
                    if !allowed {
                        return Err(UpdateError(Rcode::REFUSED));
                    }
                    let aux = match &update.rdata {
                        Rdata::Mx { preference, .. } => u32::from(*preference),
                        Rdata::Srv { priority, .. } => u32::from(*priority),
                        _ => 0,
                    };
                    edits.push(Edit::Add(StoredRecord {
                        name: update.owner.clone(),
                        rtype: update.rtype,
                        ttl: update.ttl,
                        aux,
                        rdata: update.rdata.clone(),
                    }));
                }
                Class::NONE => {
                    // DELETE matching records.
                    if update.ttl != 0 {
                        return Err(UpdateError(Rcode::FORMERR));
                    }
                    if !policy.allow_delete {
                        return Err(UpdateError(Rcode::REFUSED));
                    }
                    edits.push(Edit::DeleteExact {
                        name: update.owner.clone(),
                        rtype: update.rtype,
                        rdata: update.rdata.clone(),
                    });
                }
                Class::ANY => {
                    if update.ttl != 0 {
                        return Err(UpdateError(Rcode::FORMERR));
                    }
                    if !policy.allow_delete {
                        return Err(UpdateError(Rcode::REFUSED));
                    }
                    if update.rtype == Rtype::ANY {
                        // DELETE_ALL at the owner.
                        edits.push(Edit::DeleteName {
                            name: update.owner.clone(),
                        });
                    } else {
                        // DELETE_RRSET.
                        edits.push(Edit::DeleteRrset {
                            name: update.owner.clone(),
                            rtype: update.rtype,
                        });
                    }
                }
                _ => return Err(UpdateError(Rcode::FORMERR)),
            }
        }
        Ok(edits)
    }

    /// One transaction against the backing store, then the atomic in-memory
    /// application with the serial bump.
    fn apply(&self, zone: &ZoneMeta, edits: &[Edit]) -> Result<u32, String> {
        self.backend.begin().map_err(|e| e.to_string())?;
        let staged = (|| -> Result<(), crate::db::BackendError> {
            for edit in edits {
                let statement = match edit {
                    Edit::Add(record) => sql::insert_rr(
                        zone.zone_id,
                        &record.name,
                        record.rtype,
                        &rdata_text(&record.rdata),
                        record.aux,
                        record.ttl,
                    ),
                    Edit::DeleteExact { name, rtype, rdata } => {
                        sql::delete_rr_exact(zone.zone_id, name, *rtype, &rdata_text(rdata))
                    }
                    Edit::DeleteRrset { name, rtype } => {
                        sql::delete_rrset(zone.zone_id, name, *rtype)
                    }
                    Edit::DeleteName { name } => sql::delete_name(zone.zone_id, name),
                };
                self.backend.exec(&statement)?;
            }
            self.backend
                .exec(&sql::update_serial(zone.zone_id, zone.soa.serial.wrapping_add(1)))?;
            Ok(())
        })();
        if let Err(err) = staged {
            let _ = self.backend.rollback();
            return Err(err.to_string());
        }
        self.backend.commit().map_err(|e| e.to_string())?;

        self.store
            .apply_edits(zone.zone_id, edits, None, self.clock.now_unix())
            .map_err(|e| e.to_string())
    }
}

impl fmt::Debug for UpdateHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateHandler").finish_non_exhaustive()
    }
}
