//! TSIG message authentication (RFC 8945).
//!
//! Signing appends a TSIG record to an already-assembled message and bumps
//! its ARCOUNT in place.  Verification reconstructs the signing payload from
//! the raw received bytes: the message up to the TSIG record with ARCOUNT
//! decremented and the original id restored, followed by the key name,
//! class, TTL and the timer fields in canonical form.  The payload is built
//! in a scratch buffer of its own rather than by re-reading offsets out of
//! the outbound buffer.

use std::fmt;
use std::sync::Arc;

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};

use palisade_proto::{
    Builder, Class, Name, Parser, Rcode, Rdata, Record, Rtype, Tsig, TsigRcode, WireError,
};

use crate::db::TsigKeyRow;

/// Allowed clock skew, in seconds, when none is configured.
pub const DEFAULT_FUDGE: u16 = 300;

//----------- Algorithm --------------------------------------------------------

/// A TSIG HMAC algorithm.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    HmacMd5,
    HmacSha1,
    HmacSha224,
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

impl Algorithm {
    /// The algorithm name that goes on the wire.
    pub fn wire_name(self) -> Name {
        let name = match self {
            Self::HmacMd5 => "hmac-md5.sig-alg.reg.int.",
            Self::HmacSha1 => "hmac-sha1.",
            Self::HmacSha224 => "hmac-sha224.",
            Self::HmacSha256 => "hmac-sha256.",
            Self::HmacSha384 => "hmac-sha384.",
            Self::HmacSha512 => "hmac-sha512.",
        };
        name.parse().expect("algorithm names are valid")
    }

    pub fn from_wire_name(name: &Name) -> Option<Self> {
        let text = name.to_string().to_ascii_lowercase();
        Some(match text.as_str() {
            "hmac-md5.sig-alg.reg.int." => Self::HmacMd5,
            "hmac-sha1." => Self::HmacSha1,
            "hmac-sha224." => Self::HmacSha224,
            "hmac-sha256." => Self::HmacSha256,
            "hmac-sha384." => Self::HmacSha384,
            "hmac-sha512." => Self::HmacSha512,
            _ => return None,
        })
    }

    /// The short form used in configuration files and key rows.
    pub fn from_config_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "hmac-md5" | "md5" => Self::HmacMd5,
            "hmac-sha1" | "sha1" => Self::HmacSha1,
            "hmac-sha224" | "sha224" => Self::HmacSha224,
            "hmac-sha256" | "sha256" => Self::HmacSha256,
            "hmac-sha384" | "sha384" => Self::HmacSha384,
            "hmac-sha512" | "sha512" => Self::HmacSha512,
            _ => return None,
        })
    }

    /// The full MAC length.
    pub fn mac_len(self) -> usize {
        match self {
            Self::HmacMd5 => 16,
            Self::HmacSha1 => 20,
            Self::HmacSha224 => 28,
            Self::HmacSha256 => 32,
            Self::HmacSha384 => 48,
            Self::HmacSha512 => 64,
        }
    }

    /// The shortest MAC verification accepts (RFC 8945 §5.2.2.1): half the
    /// output, but never less than 10 octets.
    pub fn min_mac_len(self) -> usize {
        (self.mac_len() / 2).max(10)
    }

    fn compute(self, secret: &[u8], data: &[u8]) -> Vec<u8> {
        fn hmac<M: Mac + KeyInit>(secret: &[u8], data: &[u8]) -> Vec<u8> {
            let mut mac =
                <M as Mac>::new_from_slice(secret).expect("HMAC accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }

        match self {
            Self::HmacMd5 => hmac::<Hmac<Md5>>(secret, data),
            Self::HmacSha1 => hmac::<Hmac<Sha1>>(secret, data),
            Self::HmacSha224 => hmac::<Hmac<Sha224>>(secret, data),
            Self::HmacSha256 => hmac::<Hmac<Sha256>>(secret, data),
            Self::HmacSha384 => hmac::<Hmac<Sha384>>(secret, data),
            Self::HmacSha512 => hmac::<Hmac<Sha512>>(secret, data),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HmacMd5 => "hmac-md5",
            Self::HmacSha1 => "hmac-sha1",
            Self::HmacSha224 => "hmac-sha224",
            Self::HmacSha256 => "hmac-sha256",
            Self::HmacSha384 => "hmac-sha384",
            Self::HmacSha512 => "hmac-sha512",
        })
    }
}

//----------- Key and Keyring --------------------------------------------------

/// A shared secret.
#[derive(Clone, PartialEq)]
pub struct Key {
    pub name: Name,
    pub algorithm: Algorithm,
    secret: Vec<u8>,
}

impl Key {
    pub fn new(name: Name, algorithm: Algorithm, secret: Vec<u8>) -> Self {
        Self {
            name,
            algorithm,
            secret,
        }
    }

    /// Build a key from a backing-store row (base64 secret).
    pub fn from_row(row: &TsigKeyRow) -> Option<Self> {
        use base64::Engine;
        let algorithm = Algorithm::from_config_name(&row.algorithm)?;
        let secret = base64::engine::general_purpose::STANDARD
            .decode(row.secret.trim())
            .ok()?;
        Some(Self::new(row.name.clone(), algorithm, secret))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The secret stays out of logs.
        f.debug_struct("Key")
            .field("name", &self.name)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// The set of known keys, swapped wholesale on reload.
#[derive(Clone, Debug, Default)]
pub struct Keyring {
    keys: foldhash::HashMap<Name, Arc<Key>>,
}

impl Keyring {
    pub fn insert(&mut self, key: Key) {
        self.keys.insert(key.name.clone(), Arc::new(key));
    }

    pub fn get(&self, name: &Name) -> Option<Arc<Key>> {
        self.keys.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

//----------- TsigError --------------------------------------------------------

/// A TSIG verification failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TsigError {
    /// The key name is unknown.
    BadKey,
    /// The MAC did not verify.
    BadSig,
    /// The signing time is outside the fudge window.
    BadTime { time_signed: u64 },
    /// The MAC was truncated below the algorithm minimum.
    BadTrunc,
    /// A TSIG record is present but not the last record in the additional
    /// section, or the message around it is malformed.
    Form(WireError),
}

impl TsigError {
    /// The header rcode and the extended code for the TSIG error field.
    pub fn rcodes(&self) -> (Rcode, TsigRcode) {
        match self {
            Self::BadKey => (Rcode::NOTAUTH, TsigRcode::BADKEY),
            Self::BadSig => (Rcode::NOTAUTH, TsigRcode::BADSIG),
            Self::BadTime { .. } => (Rcode::NOTAUTH, TsigRcode::BADTIME),
            Self::BadTrunc => (Rcode::NOTAUTH, TsigRcode::BADTRUNC),
            Self::Form(_) => (Rcode::FORMERR, TsigRcode::NOERROR),
        }
    }
}

impl fmt::Display for TsigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadKey => f.write_str("unknown TSIG key"),
            Self::BadSig => f.write_str("TSIG signature mismatch"),
            Self::BadTime { time_signed } => {
                write!(f, "TSIG time {time_signed} outside fudge window")
            }
            Self::BadTrunc => f.write_str("TSIG MAC truncated below minimum"),
            Self::Form(err) => write!(f, "malformed TSIG message: {err}"),
        }
    }
}

impl std::error::Error for TsigError {}

//----------- Signing ----------------------------------------------------------

/// Build the HMAC input for a message and a set of TSIG variables.
///
/// `prior_mac` is the request MAC when signing or verifying a response; it
/// is prefixed with its two-octet length (RFC 8945 §5.3.2).
fn signing_payload(
    message: &[u8],
    key: &Key,
    time_signed: u64,
    fudge: u16,
    error: u16,
    other: &[u8],
    prior_mac: Option<&[u8]>,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(message.len() + 64);
    if let Some(mac) = prior_mac {
        payload.extend_from_slice(&(mac.len() as u16).to_be_bytes());
        payload.extend_from_slice(mac);
    }
    payload.extend_from_slice(message);
    key.name.append_canonical(&mut payload);
    payload.extend_from_slice(&Class::ANY.to_int().to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes()); // TTL
    key.algorithm.wire_name().append_canonical(&mut payload);
    payload.extend_from_slice(&time_signed.to_be_bytes()[2..]);
    payload.extend_from_slice(&fudge.to_be_bytes());
    payload.extend_from_slice(&error.to_be_bytes());
    payload.extend_from_slice(&(other.len() as u16).to_be_bytes());
    payload.extend_from_slice(other);
    payload
}

/// Sign `message` with `key`, appending the TSIG record and bumping ARCOUNT.
///
/// Returns the MAC so that the response to this message can be verified
/// against it.
pub fn sign(
    message: &mut Vec<u8>,
    key: &Key,
    now: u64,
    prior_mac: Option<&[u8]>,
) -> Result<Vec<u8>, WireError> {
    if message.len() < 12 {
        return Err(WireError::ShortMessage);
    }
    let time_signed = now & 0x0000_FFFF_FFFF_FFFF;
    let fudge = DEFAULT_FUDGE;
    let payload = signing_payload(message, key, time_signed, fudge, 0, &[], prior_mac);
    let mac = key.algorithm.compute(&key.secret, &payload);

    let original_id = u16::from_be_bytes([message[0], message[1]]);
    append_tsig_record(
        message,
        &key.name,
        &Tsig {
            algorithm: key.algorithm.wire_name(),
            time_signed,
            fudge,
            mac: mac.clone(),
            original_id,
            error: 0,
            other: Vec::new(),
        },
    )?;
    Ok(mac)
}

/// Append a TSIG record carrying an error code and no MAC, for rejections.
/// BADTIME replies carry the server clock in the other-data field.
pub fn append_error_tsig(
    message: &mut Vec<u8>,
    key_name: &Name,
    algorithm: &Name,
    request: &Tsig,
    error: TsigRcode,
    now: u64,
) -> Result<(), WireError> {
    let other = if error == TsigRcode::BADTIME {
        (now & 0x0000_FFFF_FFFF_FFFF).to_be_bytes()[2..].to_vec()
    } else {
        Vec::new()
    };
    append_tsig_record(
        message,
        key_name,
        &Tsig {
            algorithm: algorithm.clone(),
            time_signed: request.time_signed,
            fudge: request.fudge,
            mac: Vec::new(),
            original_id: request.original_id,
            error: error.to_int(),
            other,
        },
    )
}

fn append_tsig_record(message: &mut Vec<u8>, key_name: &Name, tsig: &Tsig) -> Result<(), WireError> {
    let record = Record {
        owner: key_name.clone(),
        rtype: Rtype::TSIG,
        class: Class::ANY,
        ttl: 0,
        rdata: Rdata::Tsig(tsig.clone()),
    };
    let mut builder = Builder::new(u16::MAX as usize);
    record.append(&mut builder)?;
    message.extend_from_slice(builder.as_slice());

    let arcount = u16::from_be_bytes([message[10], message[11]]);
    let arcount = arcount.checked_add(1).ok_or(WireError::BadCount)?;
    message[10..12].copy_from_slice(&arcount.to_be_bytes());
    Ok(())
}

//----------- Verification -----------------------------------------------------

/// A successfully verified message.
#[derive(Clone, Debug, PartialEq)]
pub struct Verified {
    pub key: Arc<Key>,
    /// The request MAC, for signing the response.
    pub mac: Vec<u8>,
    /// The TSIG variables of the request, echoed into error responses.
    pub tsig: Tsig,
    pub key_name: Name,
}

/// Locate and verify the TSIG record of `raw`.
///
/// Returns `Ok(None)` for unsigned messages.  `prior_mac` is the MAC of the
/// request when verifying a response to something we signed.
pub fn verify(
    raw: &[u8],
    keyring: &Keyring,
    now: u64,
    prior_mac: Option<&[u8]>,
) -> Result<Option<Verified>, TsigError> {
    let Some((offset, key_name, tsig)) = locate_tsig(raw).map_err(TsigError::Form)? else {
        return Ok(None);
    };

    let key = keyring.get(&key_name).ok_or(TsigError::BadKey)?;
    if Algorithm::from_wire_name(&tsig.algorithm) != Some(key.algorithm) {
        return Err(TsigError::BadKey);
    }

    if tsig.mac.len() < key.algorithm.min_mac_len() {
        return Err(TsigError::BadTrunc);
    }
    if tsig.mac.len() > key.algorithm.mac_len() {
        return Err(TsigError::BadSig);
    }

    // Rebuild the message as it looked before the TSIG record was added:
    // cut at the record, restore the original id, decrement ARCOUNT.
    let mut copy = raw[..offset].to_vec();
    copy[0..2].copy_from_slice(&tsig.original_id.to_be_bytes());
    let arcount = u16::from_be_bytes([copy[10], copy[11]]);
    copy[10..12].copy_from_slice(&arcount.saturating_sub(1).to_be_bytes());

    let payload = signing_payload(
        &copy,
        &key,
        tsig.time_signed,
        tsig.fudge,
        tsig.error,
        &tsig.other,
        prior_mac,
    );
    let full = key.algorithm.compute(&key.secret, &payload);
    if ring::constant_time::verify_slices_are_equal(&full[..tsig.mac.len()], &tsig.mac).is_err() {
        return Err(TsigError::BadSig);
    }

    // The MAC is good; now the clock may still disqualify the message.
    if now.abs_diff(tsig.time_signed) > u64::from(tsig.fudge) {
        return Err(TsigError::BadTime {
            time_signed: tsig.time_signed,
        });
    }

    Ok(Some(Verified {
        key,
        mac: tsig.mac.clone(),
        tsig,
        key_name,
    }))
}

/// Walk the raw message and return the byte offset, owner and data of its
/// TSIG record.  The record must be the last one in the additional section.
fn locate_tsig(raw: &[u8]) -> Result<Option<(usize, Name, Tsig)>, WireError> {
    let mut parser = Parser::new(raw);
    parser.seek(4)?;
    let qdcount = parser.read_u16()?;
    let ancount = parser.read_u16()?;
    let nscount = parser.read_u16()?;
    let arcount = parser.read_u16()?;

    for _ in 0..qdcount {
        Name::parse(&mut parser)?;
        parser.read_bytes(4)?;
    }
    for _ in 0..u32::from(ancount) + u32::from(nscount) + u32::from(arcount) {
        let offset = parser.pos();
        let owner = Name::parse(&mut parser)?;
        let rtype = Rtype::from_int(parser.read_u16()?);
        let _class = parser.read_u16()?;
        let _ttl = parser.read_u32()?;
        let rdlen = parser.read_u16()? as usize;

        if rtype == Rtype::TSIG {
            let rdata = Rdata::parse(rtype, &mut parser, rdlen)?;
            if parser.remaining() != 0 {
                // TSIG anywhere but last is a malformed message.
                return Err(WireError::BadCount);
            }
            let Rdata::Tsig(tsig) = rdata else {
                unreachable!("TSIG rtype parses to TSIG rdata");
            };
            return Ok(Some((offset, owner, tsig)));
        }
        parser.read_bytes(rdlen)?;
    }
    Ok(None)
}
