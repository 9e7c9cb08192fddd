//! The authoritative query path.
//!
//! Parse request → answer from authoritative data, with referral and
//! negative semantics: longest-suffix zone match, ACL gate, CNAME chasing,
//! in-bailiwick glue, NODATA vs NXDOMAIN with the SOA in authority, and
//! DNSSEC attachment when the client asked for it.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use palisade_proto::{Class, Edns, Message, Name, Rcode, Rdata, Record, Rtype};

use crate::acl::{self, Target};
use crate::dnssec::{denial, ZoneSigner};
use crate::store::{Store, StoredRecord, ZoneMeta};
use crate::util::Clock;

/// The EDNS payload size advertised in responses.
pub const ADVERTISED_PAYLOAD: u16 = 1232;

/// CNAME chains longer than this count as loops.
const MAX_CNAME_HOPS: usize = 8;

//----------- Authority --------------------------------------------------------

/// The authoritative resolver over the zone store.
#[derive(Clone, Debug)]
pub struct Authority {
    store: Store,
    signers: Arc<foldhash::HashMap<u32, Arc<ZoneSigner>>>,
    clock: Clock,
}

impl Authority {
    pub fn new(
        store: Store,
        signers: Arc<foldhash::HashMap<u32, Arc<ZoneSigner>>>,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            signers,
            clock,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Whether any local zone covers `qname`.
    pub fn covers(&self, qname: &Name) -> bool {
        self.store.find_zone(qname).is_some()
    }

    /// Answer one query message.  Always produces a response; failures are
    /// expressed as rcodes.
    pub fn answer(&self, query: &Message, client: IpAddr) -> Message {
        let mut response = Message::response_to(query);
        if let Some(edns) = &query.edns {
            response.edns = Some(Edns::new(ADVERTISED_PAYLOAD, edns.do_bit));
        }

        let [question] = query.questions.as_slice() else {
            response.header.rcode = Rcode::FORMERR;
            return response;
        };
        if question.qclass != Class::IN {
            response.header.rcode = Rcode::NOTIMP;
            return response;
        }

        let Some(zone) = self.store.find_zone(&question.qname) else {
            response.header.rcode = Rcode::REFUSED;
            return response;
        };

        let target = if zone.slave_mode {
            Target::Slave
        } else {
            Target::Master
        };
        if !acl::evaluate(&self.store, target, client, None, None).is_allowed() {
            debug!("refusing {} from {client} by ACL", question.qname);
            response.header.rcode = Rcode::REFUSED;
            return response;
        }

        let want_dnssec = query.edns.as_ref().is_some_and(|e| e.do_bit);
        let signer = self.signers.get(&zone.zone_id).cloned();

        self.resolve_into(
            &mut response,
            &zone,
            &question.qname,
            question.qtype,
            want_dnssec.then_some(signer.as_deref()).flatten(),
        );
        response
    }

    fn resolve_into(
        &self,
        response: &mut Message,
        zone: &ZoneMeta,
        qname: &Name,
        qtype: Rtype,
        signer: Option<&ZoneSigner>,
    ) {
        response.header.aa = true;

        // DNSKEY and NSEC3PARAM at the apex exist only as signing output.
        if let Some(data_signer) = self.signers.get(&zone.zone_id) {
            if *qname == zone.origin
                && matches!(qtype, Rtype::DNSKEY | Rtype::NSEC3PARAM)
            {
                self.answer_apex_meta(response, zone, qtype, data_signer.clone(), signer);
                return;
            }
        }

        // Follow CNAMEs within the zone, collecting them into the answer.
        let mut owner = qname.clone();
        let mut records = Vec::new();
        for hop in 0.. {
            records = self.store.query(zone.zone_id, &owner, qtype);
            if !records.is_empty() || qtype == Rtype::CNAME {
                break;
            }
            let cnames = self.store.query(zone.zone_id, &owner, Rtype::CNAME);
            let Some(cname) = cnames.first() else {
                break;
            };
            if hop >= MAX_CNAME_HOPS {
                warn!("CNAME loop at {owner} in zone {}", zone.origin);
                response.header.rcode = Rcode::SERVFAIL;
                response.answers.clear();
                return;
            }
            response.answers.push(stored_to_record(cname));
            let Rdata::Cname(next) = &cname.rdata else {
                unreachable!("CNAME query returns CNAME rdata");
            };
            if !next.ends_with(&zone.origin) {
                // The chain leaves our bailiwick; the client takes it from
                // here.
                self.finish_positive(response, zone, signer);
                return;
            }
            owner = next.clone();
        }

        if !records.is_empty() {
            response
                .answers
                .extend(records.iter().map(stored_to_record));
            self.add_glue(response, zone, &records);
            self.finish_positive(response, zone, signer);
            return;
        }

        // A delegation below the apex turns into a referral.
        if let Some((ns_owner, ns_records)) = self.find_delegation(zone, &owner) {
            response.header.aa = false;
            response
                .authorities
                .extend(ns_records.iter().map(stored_to_record));
            self.add_glue(response, zone, &ns_records);
            debug!("referral for {owner} to {ns_owner}");
            return;
        }

        // Negative answer: NODATA if the owner exists with other types,
        // NXDOMAIN otherwise.  Either way the SOA goes into authority with
        // the negative TTL.
        let name_exists = self.store.name_exists(zone.zone_id, &owner)
            || !response.answers.is_empty();
        if !name_exists {
            response.header.rcode = Rcode::NXDOMAIN;
        }
        let negative_ttl = zone.soa_ttl.min(zone.soa.minimum);
        response.authorities.push(Record::new(
            zone.origin.clone(),
            Rtype::SOA,
            negative_ttl,
            Rdata::Soa(zone.soa.clone()),
        ));

        if let Some(signer) = signer {
            self.attach_denial(response, zone, &owner, signer, name_exists, negative_ttl);
        }
    }

    /// Serve the synthesized DNSKEY / NSEC3PARAM RRsets at the apex.  The
    /// records themselves go out regardless; signatures only when the query
    /// asked for DNSSEC.
    fn answer_apex_meta(
        &self,
        response: &mut Message,
        zone: &ZoneMeta,
        qtype: Rtype,
        data_signer: Arc<ZoneSigner>,
        sign_with: Option<&ZoneSigner>,
    ) {
        let ttl = zone.soa_ttl;
        let records = match qtype {
            Rtype::DNSKEY => data_signer.dnskey_records(ttl),
            Rtype::NSEC3PARAM if data_signer.config.nsec3 => {
                vec![denial::nsec3param_record(&zone.origin, &data_signer.config, ttl)]
            }
            _ => Vec::new(),
        };
        if records.is_empty() {
            let negative_ttl = zone.soa_ttl.min(zone.soa.minimum);
            response.authorities.push(Record::new(
                zone.origin.clone(),
                Rtype::SOA,
                negative_ttl,
                Rdata::Soa(zone.soa.clone()),
            ));
            return;
        }
        response.answers.extend(records);
        self.finish_positive(response, zone, sign_with);
    }

    /// Sign everything that ended up in the answer and authority sections.
    fn finish_positive(
        &self,
        response: &mut Message,
        zone: &ZoneMeta,
        signer: Option<&ZoneSigner>,
    ) {
        let Some(signer) = signer else {
            return;
        };
        let now = self.clock.now_unix();

        let mut rrsets = group_rrsets(&response.answers);
        let answer_rrsets = rrsets.len();
        rrsets.extend(group_rrsets(&response.authorities));

        let mut signatures = Vec::with_capacity(rrsets.len());
        for (owner, rtype, ttl, rdatas) in &rrsets {
            match signer.sign_rrset(owner, *rtype, *ttl, rdatas, now) {
                Ok(rrsig) => signatures.push(rrsig),
                Err(err) => {
                    warn!("cannot sign {owner}/{rtype} in {}: {err}", zone.origin);
                    response.header.rcode = Rcode::SERVFAIL;
                    response.answers.clear();
                    response.authorities.clear();
                    return;
                }
            }
        }
        for (i, rrsig) in signatures.into_iter().enumerate() {
            if i < answer_rrsets {
                response.answers.push(rrsig);
            } else {
                response.authorities.push(rrsig);
            }
        }
    }

    /// Attach the NSEC/NSEC3 closure for a negative answer, signed.
    fn attach_denial(
        &self,
        response: &mut Message,
        zone: &ZoneMeta,
        qname: &Name,
        signer: &ZoneSigner,
        name_exists: bool,
        ttl: u32,
    ) {
        let rrsets = self.store.zone_rrsets(zone.zone_id);
        let denial_records = match (signer.config.nsec3, name_exists) {
            (false, true) => denial::nsec_nodata(&rrsets, &zone.origin, qname, ttl),
            (false, false) => denial::nsec_nxdomain(&rrsets, &zone.origin, qname, ttl),
            (true, true) => {
                denial::nsec3_nodata(&rrsets, &zone.origin, qname, &signer.config, ttl)
            }
            (true, false) => {
                denial::nsec3_nxdomain(&rrsets, &zone.origin, qname, &signer.config, ttl)
            }
        };
        response.authorities.extend(denial_records);

        let now = self.clock.now_unix();
        let mut signatures = Vec::new();
        for (owner, rtype, rr_ttl, rdatas) in group_rrsets(&response.authorities) {
            match signer.sign_rrset(&owner, rtype, rr_ttl, &rdatas, now) {
                Ok(rrsig) => signatures.push(rrsig),
                Err(err) => {
                    warn!("cannot sign denial for {qname} in {}: {err}", zone.origin);
                    return;
                }
            }
        }
        response.authorities.extend(signatures);
    }

    /// Additional-section A/AAAA glue for names the answer points at, when
    /// they fall inside the zone.
    fn add_glue(&self, response: &mut Message, zone: &ZoneMeta, records: &[StoredRecord]) {
        let mut targets = Vec::new();
        for record in records {
            let target = match &record.rdata {
                Rdata::Ns(name) | Rdata::Cname(name) | Rdata::Ptr(name) => name,
                Rdata::Mx { exchange, .. } => exchange,
                Rdata::Srv { target, .. } => target,
                _ => continue,
            };
            if target.ends_with(&zone.origin) && !targets.contains(target) {
                targets.push(target.clone());
            }
        }
        for target in targets {
            for rtype in [Rtype::A, Rtype::AAAA] {
                for glue in self.store.query(zone.zone_id, &target, rtype) {
                    let record = stored_to_record(&glue);
                    if !response.additionals.contains(&record)
                        && !response.answers.contains(&record)
                    {
                        response.additionals.push(record);
                    }
                }
            }
        }
    }

    /// An NS RRset strictly between the apex and `qname` delegates away.
    fn find_delegation(&self, zone: &ZoneMeta, qname: &Name) -> Option<(Name, Vec<StoredRecord>)> {
        let mut cut = qname.clone();
        while cut != zone.origin {
            let ns = self.store.query(zone.zone_id, &cut, Rtype::NS);
            if !ns.is_empty() {
                return Some((cut, ns));
            }
            cut = cut.parent()?;
            if !cut.ends_with(&zone.origin) {
                return None;
            }
        }
        None
    }
}

fn stored_to_record(record: &StoredRecord) -> Record {
    Record::new(
        record.name.clone(),
        record.rtype,
        record.ttl,
        record.rdata.clone(),
    )
}

/// Group a section into RRsets of (owner, type, ttl, rdatas), skipping
/// RRSIGs so signing never signs signatures.
fn group_rrsets(records: &[Record]) -> Vec<(Name, Rtype, u32, Vec<Rdata>)> {
    let mut rrsets: Vec<(Name, Rtype, u32, Vec<Rdata>)> = Vec::new();
    for record in records {
        if record.rtype == Rtype::RRSIG {
            continue;
        }
        match rrsets
            .iter_mut()
            .find(|(name, rtype, ..)| *name == record.owner && *rtype == record.rtype)
        {
            Some((_, _, _, rdatas)) => rdatas.push(record.rdata.clone()),
            None => rrsets.push((
                record.owner.clone(),
                record.rtype,
                record.ttl,
                vec![record.rdata.clone()],
            )),
        }
    }
    rrsets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ZoneRow;
    use crate::metrics::Metrics;
    use crate::store::StoreLimits;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn client() -> IpAddr {
        "203.0.113.10".parse().unwrap()
    }

    fn example_zone() -> (Store, Authority) {
        let store = Store::create(StoreLimits::default(), Arc::new(Metrics::new()));
        store
            .add_zone(
                &ZoneRow {
                    id: 1,
                    origin: name("example.com."),
                    ns: name("ns1.example.com."),
                    mbox: name("hostmaster.example.com."),
                    serial: 2024010101,
                    refresh: 7200,
                    retry: 1800,
                    expire: 1209600,
                    minimum: 600,
                    ttl: 3600,
                    active: true,
                    slave_mode: false,
                    update_policy: Default::default(),
                },
                0,
            )
            .unwrap();
        let authority = Authority::new(store.clone(), Arc::new(Default::default()), Clock::fixed(0));
        (store, authority)
    }

    fn add_a(store: &Store, owner: &str, addr: &str, ttl: u32) {
        store
            .add_rr(1, StoredRecord {
                name: name(owner),
                rtype: Rtype::A,
                ttl,
                aux: 0,
                rdata: Rdata::A(addr.parse().unwrap()),
            })
            .unwrap();
    }

    #[test]
    fn direct_a_lookup() {
        let (store, authority) = example_zone();
        add_a(&store, "www.example.com.", "192.0.2.1", 300);

        let query = Message::query(0x1234, name("www.example.com."), Rtype::A);
        let response = authority.answer(&query, client());

        assert_eq!(response.header.id, 0x1234);
        assert!(response.header.qr && response.header.aa);
        assert_eq!(response.header.rcode, Rcode::NOERROR);
        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.answers[0].ttl, 300);
        assert_eq!(
            response.answers[0].rdata,
            Rdata::A("192.0.2.1".parse().unwrap())
        );
    }

    #[test]
    fn nxdomain_carries_soa() {
        let (_, authority) = example_zone();
        let query = Message::query(2, name("missing.example.com."), Rtype::A);
        let response = authority.answer(&query, client());

        assert_eq!(response.header.rcode, Rcode::NXDOMAIN);
        assert!(response.answers.is_empty());
        assert_eq!(response.authorities.len(), 1);
        let soa = &response.authorities[0];
        assert_eq!(soa.rtype, Rtype::SOA);
        // min(soa ttl 3600, minimum 600).
        assert_eq!(soa.ttl, 600);
    }

    #[test]
    fn nodata_is_noerror_with_soa() {
        let (store, authority) = example_zone();
        add_a(&store, "host.example.com.", "192.0.2.7", 120);

        let query = Message::query(3, name("host.example.com."), Rtype::AAAA);
        let response = authority.answer(&query, client());

        assert_eq!(response.header.rcode, Rcode::NOERROR);
        assert!(response.answers.is_empty());
        assert_eq!(response.authorities.len(), 1);
        assert_eq!(response.authorities[0].rtype, Rtype::SOA);
    }

    #[test]
    fn cname_chase_in_order() {
        let (store, authority) = example_zone();
        store
            .add_rr(1, StoredRecord {
                name: name("a.example.com."),
                rtype: Rtype::CNAME,
                ttl: 300,
                aux: 0,
                rdata: Rdata::Cname(name("b.example.com.")),
            })
            .unwrap();
        add_a(&store, "b.example.com.", "198.51.100.2", 300);

        let query = Message::query(4, name("a.example.com."), Rtype::A);
        let response = authority.answer(&query, client());

        assert_eq!(response.header.rcode, Rcode::NOERROR);
        assert!(response.header.aa);
        assert_eq!(response.answers.len(), 2);
        assert_eq!(response.answers[0].rtype, Rtype::CNAME);
        assert_eq!(response.answers[1].rtype, Rtype::A);
        assert_eq!(
            response.answers[1].rdata,
            Rdata::A("198.51.100.2".parse().unwrap())
        );
    }

    #[test]
    fn cname_loop_is_servfail() {
        let (store, authority) = example_zone();
        store
            .add_rr(1, StoredRecord {
                name: name("x.example.com."),
                rtype: Rtype::CNAME,
                ttl: 60,
                aux: 0,
                rdata: Rdata::Cname(name("y.example.com.")),
            })
            .unwrap();
        store
            .add_rr(1, StoredRecord {
                name: name("y.example.com."),
                rtype: Rtype::CNAME,
                ttl: 60,
                aux: 0,
                rdata: Rdata::Cname(name("x.example.com.")),
            })
            .unwrap();

        let query = Message::query(5, name("x.example.com."), Rtype::A);
        let response = authority.answer(&query, client());
        assert_eq!(response.header.rcode, Rcode::SERVFAIL);
    }

    #[test]
    fn out_of_zone_is_refused() {
        let (_, authority) = example_zone();
        let query = Message::query(6, name("www.example.org."), Rtype::A);
        let response = authority.answer(&query, client());
        assert_eq!(response.header.rcode, Rcode::REFUSED);
    }

    #[test]
    fn non_in_class_is_notimp() {
        let (_, authority) = example_zone();
        let mut query = Message::query(7, name("www.example.com."), Rtype::A);
        query.questions[0].qclass = Class::CH;
        let response = authority.answer(&query, client());
        assert_eq!(response.header.rcode, Rcode::NOTIMP);
    }

    #[test]
    fn mx_answer_brings_glue() {
        let (store, authority) = example_zone();
        store
            .add_rr(1, StoredRecord {
                name: name("example.com."),
                rtype: Rtype::MX,
                ttl: 300,
                aux: 10,
                rdata: Rdata::Mx {
                    preference: 10,
                    exchange: name("mail.example.com."),
                },
            })
            .unwrap();
        add_a(&store, "mail.example.com.", "192.0.2.25", 300);

        let query = Message::query(8, name("example.com."), Rtype::MX);
        let response = authority.answer(&query, client());

        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.additionals.len(), 1);
        assert_eq!(response.additionals[0].owner, name("mail.example.com."));
    }

    #[test]
    fn delegation_becomes_referral() {
        let (store, authority) = example_zone();
        store
            .add_rr(1, StoredRecord {
                name: name("child.example.com."),
                rtype: Rtype::NS,
                ttl: 3600,
                aux: 0,
                rdata: Rdata::Ns(name("ns.child.example.com.")),
            })
            .unwrap();
        add_a(&store, "ns.child.example.com.", "192.0.2.53", 3600);

        let query = Message::query(9, name("www.child.example.com."), Rtype::A);
        let response = authority.answer(&query, client());

        assert_eq!(response.header.rcode, Rcode::NOERROR);
        assert!(!response.header.aa);
        assert!(response.answers.is_empty());
        assert_eq!(response.authorities.len(), 1);
        assert_eq!(response.authorities[0].rtype, Rtype::NS);
        assert_eq!(response.additionals.len(), 1);
    }

    #[test]
    fn do_bit_attaches_rrsigs_and_denial() {
        use crate::dnssec::keys::{KeyRole, ALG_ECDSAP256SHA256};
        use crate::dnssec::{DnssecConfig, KeyStatus, SigningKey, ZoneSigner};

        let (store, _) = example_zone();
        add_a(&store, "www.example.com.", "192.0.2.1", 300);

        let (mut key, _) =
            SigningKey::generate(1, ALG_ECDSAP256SHA256, KeyRole::Csk, 0).unwrap();
        key.status = KeyStatus::Active;
        let signer = ZoneSigner::new(
            1,
            name("example.com."),
            DnssecConfig::default(),
            vec![Arc::new(key)],
        );
        let mut signers = foldhash::HashMap::default();
        signers.insert(1u32, Arc::new(signer));
        let authority = Authority::new(store, Arc::new(signers), Clock::fixed(1_700_000_000));

        // Positive answer: the A RRset plus its RRSIG.
        let mut query = Message::query(11, name("www.example.com."), Rtype::A);
        query.edns = Some(Edns::new(1232, true));
        let response = authority.answer(&query, client());
        assert_eq!(response.header.rcode, Rcode::NOERROR);
        assert_eq!(response.answers.len(), 2);
        assert!(response.answers.iter().any(|r| r.rtype == Rtype::RRSIG));

        // Without the DO bit nothing is signed.
        let plain = Message::query(12, name("www.example.com."), Rtype::A);
        let response = authority.answer(&plain, client());
        assert_eq!(response.answers.len(), 1);

        // NXDOMAIN carries SOA, NSEC closure and signatures over both.
        let mut query = Message::query(13, name("missing.example.com."), Rtype::A);
        query.edns = Some(Edns::new(1232, true));
        let response = authority.answer(&query, client());
        assert_eq!(response.header.rcode, Rcode::NXDOMAIN);
        assert!(response.authorities.iter().any(|r| r.rtype == Rtype::SOA));
        assert!(response.authorities.iter().any(|r| r.rtype == Rtype::NSEC));
        assert!(response.authorities.iter().any(|r| r.rtype == Rtype::RRSIG));

        // The DNSKEY RRset is served at the apex.
        let query = Message::query(14, name("example.com."), Rtype::DNSKEY);
        let response = authority.answer(&query, client());
        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.answers[0].rtype, Rtype::DNSKEY);
    }

    #[test]
    fn acl_deny_refuses_zone_queries() {
        use crate::acl::{Action, AclRule, RuleKind, Target};

        let (store, authority) = example_zone();
        add_a(&store, "www.example.com.", "192.0.2.1", 300);
        store
            .set_acl(vec![AclRule {
                id: 1,
                kind: RuleKind::Ip(client()),
                target: Target::Master,
                action: Action::Deny,
                enabled: true,
            }])
            .unwrap();

        let query = Message::query(10, name("www.example.com."), Rtype::A);
        let response = authority.answer(&query, client());
        assert_eq!(response.header.rcode, Rcode::REFUSED);
    }
}
