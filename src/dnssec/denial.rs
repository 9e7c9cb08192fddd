//! Authenticated denial of existence: NSEC (RFC 4034) and NSEC3 (RFC 5155).
//!
//! Chains are derived from the live zone contents at answer time rather
//! than stored, so they can never disagree with the data.  Zone sizes here
//! are bounded by the record pool, which keeps the derivation affordable.

use palisade_proto::{Name, Rdata, Record, Rtype, TypeBitmap};

use super::DnssecConfig;

/// An RRset listing as the store hands it out: owner, type, TTL, rdatas.
pub type RrsetList = [(Name, Rtype, u32, Vec<Rdata>)];

//----------- NSEC -------------------------------------------------------------

/// The full NSEC chain of a zone, in canonical owner order.
///
/// Each owner's bitmap lists its present types plus RRSIG and NSEC, and the
/// record points at the canonically next owner, wrapping to the apex.
pub fn build_nsec_chain(rrsets: &RrsetList, origin: &Name, ttl: u32) -> Vec<Record> {
    let mut owners = owner_names(rrsets, origin);
    owners.sort_by(|a, b| a.canonical_cmp(b));

    owners
        .iter()
        .enumerate()
        .map(|(i, owner)| {
            let next = owners[(i + 1) % owners.len()].clone();
            let mut types: Vec<Rtype> = rrsets
                .iter()
                .filter(|(name, ..)| name == owner)
                .map(|(_, rtype, ..)| *rtype)
                .collect();
            types.push(Rtype::RRSIG);
            types.push(Rtype::NSEC);
            if owner == origin {
                types.push(Rtype::DNSKEY);
            }
            Record::new(
                owner.clone(),
                Rtype::NSEC,
                ttl,
                Rdata::Nsec {
                    next,
                    types: TypeBitmap::from_types(types),
                },
            )
        })
        .collect()
}

/// The NSEC records proving NXDOMAIN for `qname`: one covering the name and
/// one covering the wildcard at the closest encloser.
pub fn nsec_nxdomain(rrsets: &RrsetList, origin: &Name, qname: &Name, ttl: u32) -> Vec<Record> {
    let chain = build_nsec_chain(rrsets, origin, ttl);
    let mut proof = Vec::new();

    if let Some(covering) = covering_nsec(&chain, qname) {
        proof.push(covering.clone());
    }
    let encloser = closest_encloser(rrsets, origin, qname);
    if let Ok(wildcard) = encloser.prepend(b"*") {
        if let Some(covering) = covering_nsec(&chain, &wildcard) {
            if !proof.contains(covering) {
                proof.push(covering.clone());
            }
        }
    }
    proof
}

/// The NSEC record proving NODATA for `qname`: the one sitting at the name
/// itself, whose bitmap shows the queried type absent.
pub fn nsec_nodata(rrsets: &RrsetList, origin: &Name, qname: &Name, ttl: u32) -> Vec<Record> {
    build_nsec_chain(rrsets, origin, ttl)
        .into_iter()
        .filter(|record| record.owner == *qname)
        .collect()
}

fn owner_names(rrsets: &RrsetList, origin: &Name) -> Vec<Name> {
    let mut owners: Vec<Name> = Vec::new();
    owners.push(origin.clone());
    for (name, ..) in rrsets {
        if !owners.contains(name) {
            owners.push(name.clone());
        }
    }
    owners
}

/// The chain record whose span contains `qname`.
fn covering_nsec<'a>(chain: &'a [Record], qname: &Name) -> Option<&'a Record> {
    use std::cmp::Ordering;
    chain.iter().find(|record| {
        let Rdata::Nsec { next, .. } = &record.rdata else {
            return false;
        };
        let after_owner = record.owner.canonical_cmp(qname) == Ordering::Less;
        if record.owner.canonical_cmp(next) == Ordering::Less {
            after_owner && qname.canonical_cmp(next) == Ordering::Less
        } else {
            // The wrap-around span from the last owner back to the apex.
            after_owner || qname.canonical_cmp(next) == Ordering::Less
        }
    })
}

/// The longest existing name that is an ancestor of `qname`.
fn closest_encloser(rrsets: &RrsetList, origin: &Name, qname: &Name) -> Name {
    let mut candidate = qname.clone();
    loop {
        let exists =
            candidate == *origin || rrsets.iter().any(|(name, ..)| name.ends_with(&candidate));
        if exists {
            return candidate;
        }
        match candidate.parent() {
            Some(parent) => candidate = parent,
            None => return origin.clone(),
        }
    }
}

//----------- NSEC3 ------------------------------------------------------------

/// The iterated-SHA1 owner hash of RFC 5155 §5.
pub fn nsec3_hash(name: &Name, salt: &[u8], iterations: u16) -> Vec<u8> {
    let mut input = Vec::with_capacity(name.wire_len() + salt.len());
    name.append_canonical(&mut input);
    input.extend_from_slice(salt);

    let mut hash = sha1(&input);
    for _ in 0..iterations {
        let mut round = hash;
        round.extend_from_slice(salt);
        hash = sha1(&round);
    }
    hash
}

fn sha1(data: &[u8]) -> Vec<u8> {
    ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, data)
        .as_ref()
        .to_vec()
}

/// The base32hex (lowercase) owner name of a hashed owner under `origin`.
pub fn nsec3_owner(hash: &[u8], origin: &Name) -> Name {
    let label = base32::encode(base32::Alphabet::Rfc4648HexLower { padding: false }, hash);
    origin
        .prepend(label.as_bytes())
        .expect("a base32 SHA-1 label fits in a name")
}

/// The NSEC3PARAM record published at the apex.
pub fn nsec3param_record(origin: &Name, config: &DnssecConfig, ttl: u32) -> Record {
    Record::new(
        origin.clone(),
        Rtype::NSEC3PARAM,
        ttl,
        Rdata::Nsec3param {
            hash_alg: 1,
            flags: 0,
            iterations: config.nsec3_iterations,
            salt: config.nsec3_salt.clone(),
        },
    )
}

/// The full NSEC3 chain, sorted by hashed owner.
pub fn build_nsec3_chain(
    rrsets: &RrsetList,
    origin: &Name,
    config: &DnssecConfig,
    ttl: u32,
) -> Vec<Record> {
    let owners = owner_names(rrsets, origin);
    let mut hashed: Vec<(Vec<u8>, &Name)> = owners
        .iter()
        .map(|owner| {
            (
                nsec3_hash(owner, &config.nsec3_salt, config.nsec3_iterations),
                owner,
            )
        })
        .collect();
    hashed.sort();

    hashed
        .iter()
        .enumerate()
        .map(|(i, (hash, owner))| {
            let next_hashed = hashed[(i + 1) % hashed.len()].0.clone();
            let mut types: Vec<Rtype> = rrsets
                .iter()
                .filter(|(name, ..)| name == *owner)
                .map(|(_, rtype, ..)| *rtype)
                .collect();
            types.push(Rtype::RRSIG);
            if *owner == origin {
                types.push(Rtype::DNSKEY);
                types.push(Rtype::NSEC3PARAM);
            }
            Record::new(
                nsec3_owner(hash, origin),
                Rtype::NSEC3,
                ttl,
                Rdata::Nsec3 {
                    hash_alg: 1,
                    flags: 0,
                    iterations: config.nsec3_iterations,
                    salt: config.nsec3_salt.clone(),
                    next_hashed,
                    types: TypeBitmap::from_types(types),
                },
            )
        })
        .collect()
}

/// The NSEC3 closest-encloser proof for NXDOMAIN: a record matching the
/// closest encloser, one covering the next-closer name, and one covering
/// the wildcard at the encloser (RFC 5155 §7.2.2).
pub fn nsec3_nxdomain(
    rrsets: &RrsetList,
    origin: &Name,
    qname: &Name,
    config: &DnssecConfig,
    ttl: u32,
) -> Vec<Record> {
    let chain = build_nsec3_chain(rrsets, origin, config, ttl);
    let encloser = closest_encloser(rrsets, origin, qname);

    let mut proof = Vec::new();
    let mut add = |record: Option<&Record>| {
        if let Some(record) = record {
            if !proof.contains(record) {
                proof.push(record.clone());
            }
        }
    };

    add(matching_nsec3(&chain, &encloser, origin, config));
    if let Some(next_closer) = next_closer_name(qname, &encloser) {
        add(covering_nsec3(&chain, &next_closer, origin, config));
    }
    if let Ok(wildcard) = encloser.prepend(b"*") {
        add(covering_nsec3(&chain, &wildcard, origin, config));
    }
    proof
}

/// The NSEC3 record proving NODATA: the one matching `qname` exactly.
pub fn nsec3_nodata(
    rrsets: &RrsetList,
    origin: &Name,
    qname: &Name,
    config: &DnssecConfig,
    ttl: u32,
) -> Vec<Record> {
    let chain = build_nsec3_chain(rrsets, origin, config, ttl);
    matching_nsec3(&chain, qname, origin, config)
        .cloned()
        .into_iter()
        .collect()
}

fn matching_nsec3<'a>(
    chain: &'a [Record],
    name: &Name,
    origin: &Name,
    config: &DnssecConfig,
) -> Option<&'a Record> {
    let owner = nsec3_owner(
        &nsec3_hash(name, &config.nsec3_salt, config.nsec3_iterations),
        origin,
    );
    chain.iter().find(|record| record.owner == owner)
}

fn covering_nsec3<'a>(
    chain: &'a [Record],
    name: &Name,
    origin: &Name,
    config: &DnssecConfig,
) -> Option<&'a Record> {
    let hash = nsec3_hash(name, &config.nsec3_salt, config.nsec3_iterations);
    chain.iter().find(|record| {
        let Rdata::Nsec3 { next_hashed, .. } = &record.rdata else {
            return false;
        };
        // Owner names in the chain are already hashed; recover the raw hash
        // from the owner label instead of re-hashing the hashed name.
        let Some(owner_raw) = owner_label_hash(&record.owner) else {
            return false;
        };
        if owner_raw < *next_hashed {
            owner_raw < hash && hash < *next_hashed
        } else {
            // Wrap-around span.
            owner_raw < hash || hash < *next_hashed
        }
    })
}

/// Decode the base32hex first label of an NSEC3 owner back into its hash.
fn owner_label_hash(owner: &Name) -> Option<Vec<u8>> {
    let label = owner.labels().next()?;
    let text = std::str::from_utf8(label).ok()?;
    base32::decode(
        base32::Alphabet::Rfc4648HexLower { padding: false },
        &text.to_ascii_lowercase(),
    )
}

/// One label more than the closest encloser, on the way to `qname`.
fn next_closer_name(qname: &Name, encloser: &Name) -> Option<Name> {
    let mut candidate = qname.clone();
    while let Some(parent) = candidate.parent() {
        if parent == *encloser {
            return Some(candidate);
        }
        candidate = parent;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn example_rrsets() -> Vec<(Name, Rtype, u32, Vec<Rdata>)> {
        vec![
            (
                name("example.com."),
                Rtype::SOA,
                600,
                vec![Rdata::Txt(vec![b"placeholder".to_vec()])],
            ),
            (
                name("alpha.example.com."),
                Rtype::A,
                300,
                vec![Rdata::A("192.0.2.1".parse().unwrap())],
            ),
            (
                name("gamma.example.com."),
                Rtype::A,
                300,
                vec![Rdata::A("192.0.2.2".parse().unwrap())],
            ),
        ]
    }

    #[test]
    fn nsec3_hash_matches_rfc_5155_vectors() {
        // RFC 5155 Appendix A: H(example) with salt aabbccdd, 12 iterations
        // is 0p9mhaveqvm6t7vbl5lop2u3t2rp3tom in base32hex.
        let salt = hex::decode("aabbccdd").unwrap();
        let hash = nsec3_hash(&name("example."), &salt, 12);
        let label = base32::encode(base32::Alphabet::Rfc4648HexLower { padding: false }, &hash);
        assert_eq!(label, "0p9mhaveqvm6t7vbl5lop2u3t2rp3tom");

        // And a name below it: H(a.example) = 35mthgpgcu1qg68fab165klnsnk3dpvl.
        let hash = nsec3_hash(&name("a.example."), &salt, 12);
        let label = base32::encode(base32::Alphabet::Rfc4648HexLower { padding: false }, &hash);
        assert_eq!(label, "35mthgpgcu1qg68fab165klnsnk3dpvl");
    }

    #[test]
    fn nsec3_hash_is_deterministic() {
        let salt = [0xAA, 0xBB];
        let one = nsec3_hash(&name("host.example.com."), &salt, 5);
        let two = nsec3_hash(&name("HOST.EXAMPLE.COM."), &salt, 5);
        assert_eq!(one, two);
        assert_eq!(one.len(), 20);
    }

    #[test]
    fn nsec_chain_is_closed() {
        let rrsets = example_rrsets();
        let chain = build_nsec_chain(&rrsets, &name("example.com."), 600);
        assert_eq!(chain.len(), 3);

        // Each next pointer is the following owner; the last wraps to the
        // first.
        for (i, record) in chain.iter().enumerate() {
            let Rdata::Nsec { next, .. } = &record.rdata else {
                panic!("expected NSEC rdata");
            };
            assert_eq!(*next, chain[(i + 1) % chain.len()].owner);
        }
    }

    #[test]
    fn nsec_nxdomain_covers_the_hole() {
        let rrsets = example_rrsets();
        let proof = nsec_nxdomain(&rrsets, &name("example.com."), &name("beta.example.com."), 600);
        assert!(!proof.is_empty());
        // The covering record spans alpha..gamma.
        let covering = &proof[0];
        assert_eq!(covering.owner, name("alpha.example.com."));
    }

    #[test]
    fn nsec_nodata_names_the_owner() {
        let rrsets = example_rrsets();
        let proof = nsec_nodata(&rrsets, &name("example.com."), &name("alpha.example.com."), 600);
        assert_eq!(proof.len(), 1);
        assert_eq!(proof[0].owner, name("alpha.example.com."));
        let Rdata::Nsec { types, .. } = &proof[0].rdata else {
            panic!("expected NSEC rdata");
        };
        assert!(types.contains(Rtype::A));
        assert!(!types.contains(Rtype::AAAA));
    }

    #[test]
    fn nsec3_chain_and_nxdomain_proof() {
        let config = DnssecConfig {
            nsec3: true,
            nsec3_iterations: 3,
            nsec3_salt: vec![0x01, 0x02],
            ..DnssecConfig::default()
        };
        let rrsets = example_rrsets();
        let origin = name("example.com.");

        let chain = build_nsec3_chain(&rrsets, &origin, &config, 600);
        assert_eq!(chain.len(), 3);
        // Hashed owners are sorted.
        let hashes: Vec<_> = chain
            .iter()
            .map(|r| owner_label_hash(&r.owner).unwrap())
            .collect();
        let mut sorted = hashes.clone();
        sorted.sort();
        assert_eq!(hashes, sorted);

        let proof = nsec3_nxdomain(&rrsets, &origin, &name("beta.example.com."), &config, 600);
        assert!(!proof.is_empty());
        assert!(proof.len() <= 3);
        for record in &proof {
            assert_eq!(record.rtype, Rtype::NSEC3);
        }
    }
}
