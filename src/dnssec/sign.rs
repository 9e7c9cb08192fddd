//! RRSIG generation.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use palisade_proto::{Name, Rdata, Record, Rrsig, Rtype};

use super::keys::{KeyError, SigningKey};
use super::DnssecConfig;

//----------- ZoneSigner -------------------------------------------------------

/// Everything needed to sign one zone's answers.
#[derive(Debug)]
pub struct ZoneSigner {
    pub zone_id: u32,
    pub origin: Name,
    pub config: DnssecConfig,
    keys: Vec<Arc<SigningKey>>,
}

impl ZoneSigner {
    pub fn new(
        zone_id: u32,
        origin: Name,
        config: DnssecConfig,
        keys: Vec<Arc<SigningKey>>,
    ) -> Self {
        Self {
            zone_id,
            origin,
            config,
            keys,
        }
    }

    /// The published DNSKEY RRset: every key whose status keeps it visible.
    pub fn dnskey_records(&self, ttl: u32) -> Vec<Record> {
        self.keys
            .iter()
            .filter(|key| key.status.is_published())
            .map(|key| Record::new(self.origin.clone(), Rtype::DNSKEY, ttl, key.dnskey_rdata()))
            .collect()
    }

    fn active_key(&self, for_dnskey: bool) -> Option<&Arc<SigningKey>> {
        self.keys.iter().find(|key| {
            key.status == super::KeyStatus::Active
                && if for_dnskey {
                    key.role.signs_dnskey()
                } else {
                    key.role.signs_zone_data()
                }
        })
    }

    /// Sign one RRset.
    ///
    /// The DNSKEY RRset is signed with the KSK (or CSK); everything else
    /// with the ZSK (or CSK).  The signing input is the RRSIG RDATA without
    /// its signature field followed by every record in canonical form,
    /// RDATAs sorted bytewise (RFC 4034 §3.1.8.1).
    pub fn sign_rrset(
        &self,
        owner: &Name,
        rtype: Rtype,
        ttl: u32,
        rdatas: &[Rdata],
        now: u64,
    ) -> Result<Record, SignError> {
        let key = self
            .active_key(rtype == Rtype::DNSKEY)
            .ok_or(SignError::NoActiveKey)?;

        let labels = {
            let count = owner.label_count() as u8;
            let wildcard = owner.labels().next().is_some_and(|l| l == b"*");
            count - u8::from(wildcard)
        };

        let mut rrsig = Rrsig {
            type_covered: rtype,
            algorithm: key.algorithm,
            labels,
            original_ttl: ttl,
            expiration: (now as u32).wrapping_add(self.config.signature_validity),
            inception: now as u32,
            key_tag: key.key_tag,
            signer: self.origin.clone(),
            signature: Bytes::new(),
        };

        let mut input = Vec::with_capacity(512);
        rrsig.append_rdata_prefix(&mut input);

        let mut canonical: Vec<Vec<u8>> = rdatas.iter().map(Rdata::canonical_bytes).collect();
        canonical.sort();
        let mut owner_wire = Vec::with_capacity(owner.wire_len());
        owner.append_canonical(&mut owner_wire);
        for rdata in &canonical {
            input.extend_from_slice(&owner_wire);
            input.extend_from_slice(&rtype.to_int().to_be_bytes());
            input.extend_from_slice(&1u16.to_be_bytes()); // class IN
            input.extend_from_slice(&ttl.to_be_bytes());
            input.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            input.extend_from_slice(rdata);
        }

        rrsig.signature = Bytes::from(key.sign(&input).map_err(SignError::Key)?);
        Ok(Record::new(owner.clone(), Rtype::RRSIG, ttl, Rdata::Rrsig(rrsig)))
    }
}

//----------- SignError --------------------------------------------------------

/// A signing failure; answers go out unsigned and the error is logged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignError {
    /// No active key can sign this RRset.
    NoActiveKey,
    Key(KeyError),
}

impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoActiveKey => f.write_str("no active signing key"),
            Self::Key(err) => write!(f, "signing key failure: {err}"),
        }
    }
}

impl std::error::Error for SignError {}
