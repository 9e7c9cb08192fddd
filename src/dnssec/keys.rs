//! Signing key material.

use std::fmt;

use bytes::Bytes;
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, Ed25519KeyPair, KeyPair, RsaKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING,
    ECDSA_P384_SHA384_FIXED_SIGNING, RSA_PKCS1_SHA256,
};

use palisade_proto::{Name, Rdata};

use crate::db::DnssecKeyRow;

/// DNSKEY flag values (RFC 4034 §2.1.1).
pub const FLAGS_ZSK: u16 = 256;
pub const FLAGS_KSK: u16 = 257;

/// DNSSEC algorithm numbers this signer implements.
pub const ALG_RSASHA256: u8 = 8;
pub const ALG_ECDSAP256SHA256: u8 = 13;
pub const ALG_ECDSAP384SHA384: u8 = 14;
pub const ALG_ED25519: u8 = 15;

//----------- KeyRole / KeyStatus ----------------------------------------------

/// What a key signs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyRole {
    /// Signs the DNSKEY RRset.
    Ksk,
    /// Signs zone data.
    Zsk,
    /// Signs both.
    Csk,
}

impl KeyRole {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.to_ascii_uppercase().as_str() {
            "KSK" => Self::Ksk,
            "ZSK" => Self::Zsk,
            "CSK" => Self::Csk,
            _ => return None,
        })
    }

    pub fn signs_dnskey(self) -> bool {
        matches!(self, Self::Ksk | Self::Csk)
    }

    pub fn signs_zone_data(self) -> bool {
        matches!(self, Self::Zsk | Self::Csk)
    }
}

/// Lifecycle state.  Only active keys sign; published and retired keys stay
/// in the DNSKEY RRset so cached signatures keep validating.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Published,
    Retired,
    Revoked,
}

impl KeyStatus {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.to_ascii_lowercase().as_str() {
            "active" => Self::Active,
            "published" => Self::Published,
            "retired" => Self::Retired,
            "revoked" => Self::Revoked,
            _ => return None,
        })
    }

    /// Whether the key appears in the published DNSKEY RRset.
    pub fn is_published(self) -> bool {
        matches!(self, Self::Active | Self::Published | Self::Retired)
    }
}

//----------- SigningKey -------------------------------------------------------

enum Signer {
    Rsa(RsaKeyPair),
    EcdsaP256(EcdsaKeyPair),
    EcdsaP384(EcdsaKeyPair),
    Ed25519(Ed25519KeyPair),
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rsa(_) => "Signer::Rsa",
            Self::EcdsaP256(_) => "Signer::EcdsaP256",
            Self::EcdsaP384(_) => "Signer::EcdsaP384",
            Self::Ed25519(_) => "Signer::Ed25519",
        })
    }
}

/// One zone signing key: DNSKEY data plus the private half.
#[derive(Debug)]
pub struct SigningKey {
    pub zone_id: u32,
    pub flags: u16,
    pub algorithm: u8,
    pub role: KeyRole,
    pub status: KeyStatus,
    /// The DNSKEY public-key field.
    pub public_key: Bytes,
    /// Computed over the DNSKEY RDATA per RFC 4034 Appendix B.
    pub key_tag: u16,
    pub created: u64,
    pub activate: u64,
    pub retire: u64,
    signer: Signer,
}

impl SigningKey {
    /// Load a key from its backing-store row.  The private key is a base64
    /// PKCS#8 document; the key tag is always recomputed from the RDATA.
    pub fn from_row(row: &DnssecKeyRow) -> Result<Self, KeyError> {
        use base64::Engine;
        let engine = base64::engine::general_purpose::STANDARD;

        let role = KeyRole::parse(&row.role).ok_or(KeyError::BadRole)?;
        let status = KeyStatus::parse(&row.status).ok_or(KeyError::BadStatus)?;
        let public_key = Bytes::from(
            engine
                .decode(row.public_key.trim())
                .map_err(|_| KeyError::BadEncoding)?,
        );
        let pkcs8 = engine
            .decode(row.private_key.trim())
            .map_err(|_| KeyError::BadEncoding)?;

        let rng = SystemRandom::new();
        let signer = match row.algorithm {
            ALG_RSASHA256 => Signer::Rsa(
                RsaKeyPair::from_pkcs8(&pkcs8).map_err(|_| KeyError::Rejected)?,
            ),
            ALG_ECDSAP256SHA256 => Signer::EcdsaP256(
                EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &pkcs8, &rng)
                    .map_err(|_| KeyError::Rejected)?,
            ),
            ALG_ECDSAP384SHA384 => Signer::EcdsaP384(
                EcdsaKeyPair::from_pkcs8(&ECDSA_P384_SHA384_FIXED_SIGNING, &pkcs8, &rng)
                    .map_err(|_| KeyError::Rejected)?,
            ),
            ALG_ED25519 => Signer::Ed25519(
                Ed25519KeyPair::from_pkcs8_maybe_unchecked(&pkcs8)
                    .map_err(|_| KeyError::Rejected)?,
            ),
            other => return Err(KeyError::UnsupportedAlgorithm(other)),
        };

        let key_tag = key_tag(&dnskey_rdata_bytes(row.flags, row.algorithm, &public_key));
        Ok(Self {
            zone_id: row.zone_id,
            flags: row.flags,
            algorithm: row.algorithm,
            role,
            status,
            public_key,
            key_tag,
            created: row.created,
            activate: row.activate,
            retire: row.retire,
            signer,
        })
    }

    /// Generate a fresh ECDSA or Ed25519 key.
    ///
    /// RSA generation is not offered; RSA keys arrive through the store from
    /// external tooling.  Returns the key and its PKCS#8 document for the
    /// store to persist.
    pub fn generate(
        zone_id: u32,
        algorithm: u8,
        role: KeyRole,
        now: u64,
    ) -> Result<(Self, Vec<u8>), KeyError> {
        let rng = SystemRandom::new();
        let (signer, pkcs8, public_key) = match algorithm {
            ALG_ECDSAP256SHA256 => {
                let doc = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
                    .map_err(|_| KeyError::Rejected)?;
                let pair =
                    EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, doc.as_ref(), &rng)
                        .map_err(|_| KeyError::Rejected)?;
                // ring hands out the uncompressed point; DNSKEY wants the
                // bare coordinates.
                let point = pair.public_key().as_ref().to_vec();
                (
                    Signer::EcdsaP256(pair),
                    doc.as_ref().to_vec(),
                    Bytes::from(point[1..].to_vec()),
                )
            }
            ALG_ECDSAP384SHA384 => {
                let doc = EcdsaKeyPair::generate_pkcs8(&ECDSA_P384_SHA384_FIXED_SIGNING, &rng)
                    .map_err(|_| KeyError::Rejected)?;
                let pair =
                    EcdsaKeyPair::from_pkcs8(&ECDSA_P384_SHA384_FIXED_SIGNING, doc.as_ref(), &rng)
                        .map_err(|_| KeyError::Rejected)?;
                let point = pair.public_key().as_ref().to_vec();
                (
                    Signer::EcdsaP384(pair),
                    doc.as_ref().to_vec(),
                    Bytes::from(point[1..].to_vec()),
                )
            }
            ALG_ED25519 => {
                let doc =
                    Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| KeyError::Rejected)?;
                let pair = Ed25519KeyPair::from_pkcs8(doc.as_ref())
                    .map_err(|_| KeyError::Rejected)?;
                let public = Bytes::copy_from_slice(pair.public_key().as_ref());
                (Signer::Ed25519(pair), doc.as_ref().to_vec(), public)
            }
            other => return Err(KeyError::UnsupportedAlgorithm(other)),
        };

        let flags = if role.signs_dnskey() {
            FLAGS_KSK
        } else {
            FLAGS_ZSK
        };
        let key_tag = key_tag(&dnskey_rdata_bytes(flags, algorithm, &public_key));
        Ok((
            Self {
                zone_id,
                flags,
                algorithm,
                role,
                status: KeyStatus::Published,
                public_key,
                key_tag,
                created: now,
                activate: now,
                retire: 0,
                signer,
            },
            pkcs8,
        ))
    }

    /// The DNSKEY record data for this key.
    pub fn dnskey_rdata(&self) -> Rdata {
        Rdata::Dnskey {
            flags: self.flags,
            protocol: 3,
            algorithm: self.algorithm,
            public_key: self.public_key.clone(),
        }
    }

    /// Sign `data`, producing the RRSIG signature field.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        let rng = SystemRandom::new();
        match &self.signer {
            Signer::Rsa(pair) => {
                let mut signature = vec![0; pair.public().modulus_len()];
                pair.sign(&RSA_PKCS1_SHA256, &rng, data, &mut signature)
                    .map_err(|_| KeyError::SigningFailed)?;
                Ok(signature)
            }
            Signer::EcdsaP256(pair) | Signer::EcdsaP384(pair) => Ok(pair
                .sign(&rng, data)
                .map_err(|_| KeyError::SigningFailed)?
                .as_ref()
                .to_vec()),
            Signer::Ed25519(pair) => Ok(pair.sign(data).as_ref().to_vec()),
        }
    }
}

/// The wire DNSKEY RDATA for tag computation.
fn dnskey_rdata_bytes(flags: u16, algorithm: u8, public_key: &[u8]) -> Vec<u8> {
    let mut rdata = Vec::with_capacity(4 + public_key.len());
    rdata.extend_from_slice(&flags.to_be_bytes());
    rdata.push(3); // protocol
    rdata.push(algorithm);
    rdata.extend_from_slice(public_key);
    rdata
}

/// RFC 4034 Appendix B: a ones-complement-style checksum over the DNSKEY
/// RDATA.
pub fn key_tag(rdata: &[u8]) -> u16 {
    let mut acc: u32 = 0;
    for (i, b) in rdata.iter().enumerate() {
        acc = acc.wrapping_add(if i & 1 == 0 {
            u32::from(*b) << 8
        } else {
            u32::from(*b)
        });
    }
    acc = acc.wrapping_add((acc >> 16) & 0xFFFF);
    (acc & 0xFFFF) as u16
}

/// The DS digest of a DNSKEY, for publishing delegations (SHA-256, digest
/// type 2).
pub fn ds_digest(owner: &Name, flags: u16, algorithm: u8, public_key: &[u8]) -> Vec<u8> {
    let mut input = Vec::new();
    owner.append_canonical(&mut input);
    input.extend_from_slice(&dnskey_rdata_bytes(flags, algorithm, public_key));
    ring::digest::digest(&ring::digest::SHA256, &input)
        .as_ref()
        .to_vec()
}

//----------- KeyError ---------------------------------------------------------

/// A key that could not be loaded, generated or used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyError {
    BadRole,
    BadStatus,
    BadEncoding,
    Rejected,
    UnsupportedAlgorithm(u8),
    SigningFailed,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRole => f.write_str("unknown key role"),
            Self::BadStatus => f.write_str("unknown key status"),
            Self::BadEncoding => f.write_str("key material is not valid base64"),
            Self::Rejected => f.write_str("key material rejected"),
            Self::UnsupportedAlgorithm(alg) => {
                write!(f, "unsupported DNSSEC algorithm {alg}")
            }
            Self::SigningFailed => f.write_str("signing operation failed"),
        }
    }
}

impl std::error::Error for KeyError {}
