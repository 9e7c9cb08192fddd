//! Per-type record data.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use bytes::Bytes;

use crate::iana::Rtype;
use crate::name::Name;
use crate::wire::{Builder, Parser, WireError};

//----------- Soa --------------------------------------------------------------

/// SOA record data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Soa {
    pub mname: Name,
    pub rname: Name,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

//----------- Rrsig ------------------------------------------------------------

/// RRSIG record data (RFC 4034 §3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rrsig {
    pub type_covered: Rtype,
    pub algorithm: u8,
    pub labels: u8,
    pub original_ttl: u32,
    pub expiration: u32,
    pub inception: u32,
    pub key_tag: u16,
    pub signer: Name,
    pub signature: Bytes,
}

impl Rrsig {
    /// Append everything up to but excluding the signature field, the way
    /// the signing input wants it.
    pub fn append_rdata_prefix(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.type_covered.to_int().to_be_bytes());
        out.push(self.algorithm);
        out.push(self.labels);
        out.extend_from_slice(&self.original_ttl.to_be_bytes());
        out.extend_from_slice(&self.expiration.to_be_bytes());
        out.extend_from_slice(&self.inception.to_be_bytes());
        out.extend_from_slice(&self.key_tag.to_be_bytes());
        self.signer.append_canonical(out);
    }
}

//----------- Tsig -------------------------------------------------------------

/// TSIG record data (RFC 8945 §4.2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tsig {
    pub algorithm: Name,
    /// Signing time as unix seconds; only the low 48 bits go on the wire.
    pub time_signed: u64,
    pub fudge: u16,
    pub mac: Vec<u8>,
    pub original_id: u16,
    pub error: u16,
    pub other: Vec<u8>,
}

//----------- TypeBitmap -------------------------------------------------------

/// The NSEC/NSEC3 type bitmap (RFC 4034 §4.1.2).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeBitmap {
    /// Present types, sorted ascending and deduplicated.
    types: Vec<Rtype>,
}

impl TypeBitmap {
    pub fn from_types(mut types: Vec<Rtype>) -> Self {
        types.sort();
        types.dedup();
        Self { types }
    }

    pub fn types(&self) -> &[Rtype] {
        &self.types
    }

    pub fn contains(&self, rtype: Rtype) -> bool {
        self.types.binary_search(&rtype).is_ok()
    }

    /// Encode as window blocks.
    pub fn append(&self, out: &mut Vec<u8>) {
        let mut i = 0;
        while i < self.types.len() {
            let window = (self.types[i].to_int() >> 8) as u8;
            let mut bitmap = [0u8; 32];
            let mut max_octet = 0;
            while i < self.types.len() && (self.types[i].to_int() >> 8) as u8 == window {
                let low = (self.types[i].to_int() & 0xFF) as usize;
                bitmap[low / 8] |= 0x80 >> (low % 8);
                max_octet = low / 8;
                i += 1;
            }
            out.push(window);
            out.push(max_octet as u8 + 1);
            out.extend_from_slice(&bitmap[..=max_octet]);
        }
    }

    /// Decode window blocks from `data`.
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut types = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            if pos + 2 > data.len() {
                return Err(WireError::BadRdataLength);
            }
            let window = data[pos];
            let len = data[pos + 1] as usize;
            if len == 0 || len > 32 || pos + 2 + len > data.len() {
                return Err(WireError::BadRdataLength);
            }
            for (octet, &bits) in data[pos + 2..pos + 2 + len].iter().enumerate() {
                for bit in 0..8 {
                    if bits & (0x80 >> bit) != 0 {
                        let value = u16::from(window) << 8 | (octet * 8 + bit) as u16;
                        types.push(Rtype::from_int(value));
                    }
                }
            }
            pos += 2 + len;
        }
        Ok(Self { types })
    }
}

//----------- Rdata ------------------------------------------------------------

/// Type-specific record data.
///
/// Types the server does not interpret are carried as opaque octets and
/// re-emitted untouched; the owning record knows the type code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rdata {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ns(Name),
    Cname(Name),
    Ptr(Name),
    Mx {
        preference: u16,
        exchange: Name,
    },
    Soa(Soa),
    /// A sequence of character-strings, each at most 255 octets.
    Txt(Vec<Vec<u8>>),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: Name,
    },
    Naptr {
        order: u16,
        preference: u16,
        flags: Vec<u8>,
        services: Vec<u8>,
        regexp: Vec<u8>,
        replacement: Name,
    },
    Dnskey {
        flags: u16,
        protocol: u8,
        algorithm: u8,
        public_key: Bytes,
    },
    Rrsig(Rrsig),
    Ds {
        key_tag: u16,
        algorithm: u8,
        digest_type: u8,
        digest: Bytes,
    },
    Nsec {
        next: Name,
        types: TypeBitmap,
    },
    Nsec3 {
        hash_alg: u8,
        flags: u8,
        iterations: u16,
        salt: Vec<u8>,
        next_hashed: Vec<u8>,
        types: TypeBitmap,
    },
    Nsec3param {
        hash_alg: u8,
        flags: u8,
        iterations: u16,
        salt: Vec<u8>,
    },
    Tsig(Tsig),
    Other(Bytes),
}

impl Rdata {
    /// Parse `rdlen` octets of record data of type `rtype`.
    ///
    /// The parser must sit at the start of the RDATA; compressed names are
    /// resolved against the whole message.  Fails unless exactly `rdlen`
    /// octets are consumed.
    pub fn parse(rtype: Rtype, parser: &mut Parser<'_>, rdlen: usize) -> Result<Self, WireError> {
        let start = parser.pos();
        let end = start.checked_add(rdlen).ok_or(WireError::ShortMessage)?;
        if end > parser.buf().len() {
            return Err(WireError::ShortMessage);
        }

        // Empty record data is legal on the wire regardless of type: OPT
        // records and the RFC 2136 prerequisite/delete forms all use it.
        if rdlen == 0 {
            return Ok(Rdata::Other(Bytes::new()));
        }

        let rdata = match rtype {
            Rtype::A => {
                let octets = parser.read_bytes(4)?;
                Rdata::A(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
            }
            Rtype::AAAA => {
                let octets: [u8; 16] = parser.read_bytes(16)?.try_into().unwrap();
                Rdata::Aaaa(Ipv6Addr::from(octets))
            }
            Rtype::NS => Rdata::Ns(Name::parse(parser)?),
            Rtype::CNAME => Rdata::Cname(Name::parse(parser)?),
            Rtype::PTR => Rdata::Ptr(Name::parse(parser)?),
            Rtype::MX => Rdata::Mx {
                preference: parser.read_u16()?,
                exchange: Name::parse(parser)?,
            },
            Rtype::SOA => Rdata::Soa(Soa {
                mname: Name::parse(parser)?,
                rname: Name::parse(parser)?,
                serial: parser.read_u32()?,
                refresh: parser.read_u32()?,
                retry: parser.read_u32()?,
                expire: parser.read_u32()?,
                minimum: parser.read_u32()?,
            }),
            Rtype::TXT => {
                let mut strings = Vec::new();
                while parser.pos() < end {
                    strings.push(parser.read_character_string()?.to_vec());
                }
                if strings.is_empty() {
                    return Err(WireError::BadRdataLength);
                }
                Rdata::Txt(strings)
            }
            Rtype::SRV => Rdata::Srv {
                priority: parser.read_u16()?,
                weight: parser.read_u16()?,
                port: parser.read_u16()?,
                target: Name::parse(parser)?,
            },
            Rtype::NAPTR => Rdata::Naptr {
                order: parser.read_u16()?,
                preference: parser.read_u16()?,
                flags: parser.read_character_string()?.to_vec(),
                services: parser.read_character_string()?.to_vec(),
                regexp: parser.read_character_string()?.to_vec(),
                replacement: Name::parse(parser)?,
            },
            Rtype::DNSKEY => {
                let flags = parser.read_u16()?;
                let protocol = parser.read_u8()?;
                let algorithm = parser.read_u8()?;
                let key_len = end
                    .checked_sub(parser.pos())
                    .ok_or(WireError::BadRdataLength)?;
                Rdata::Dnskey {
                    flags,
                    protocol,
                    algorithm,
                    public_key: Bytes::copy_from_slice(parser.read_bytes(key_len)?),
                }
            }
            Rtype::RRSIG => {
                let type_covered = Rtype::from_int(parser.read_u16()?);
                let algorithm = parser.read_u8()?;
                let labels = parser.read_u8()?;
                let original_ttl = parser.read_u32()?;
                let expiration = parser.read_u32()?;
                let inception = parser.read_u32()?;
                let key_tag = parser.read_u16()?;
                let signer = Name::parse(parser)?;
                let sig_len = end
                    .checked_sub(parser.pos())
                    .ok_or(WireError::BadRdataLength)?;
                Rdata::Rrsig(Rrsig {
                    type_covered,
                    algorithm,
                    labels,
                    original_ttl,
                    expiration,
                    inception,
                    key_tag,
                    signer,
                    signature: Bytes::copy_from_slice(parser.read_bytes(sig_len)?),
                })
            }
            Rtype::DS => {
                let key_tag = parser.read_u16()?;
                let algorithm = parser.read_u8()?;
                let digest_type = parser.read_u8()?;
                let digest_len = end
                    .checked_sub(parser.pos())
                    .ok_or(WireError::BadRdataLength)?;
                Rdata::Ds {
                    key_tag,
                    algorithm,
                    digest_type,
                    digest: Bytes::copy_from_slice(parser.read_bytes(digest_len)?),
                }
            }
            Rtype::NSEC => {
                let next = Name::parse(parser)?;
                let bitmap_len = end
                    .checked_sub(parser.pos())
                    .ok_or(WireError::BadRdataLength)?;
                Rdata::Nsec {
                    next,
                    types: TypeBitmap::parse(parser.read_bytes(bitmap_len)?)?,
                }
            }
            Rtype::NSEC3 => {
                let hash_alg = parser.read_u8()?;
                let flags = parser.read_u8()?;
                let iterations = parser.read_u16()?;
                let salt = parser.read_character_string()?.to_vec();
                let hash_len = parser.read_u8()? as usize;
                let next_hashed = parser.read_bytes(hash_len)?.to_vec();
                let bitmap_len = end
                    .checked_sub(parser.pos())
                    .ok_or(WireError::BadRdataLength)?;
                Rdata::Nsec3 {
                    hash_alg,
                    flags,
                    iterations,
                    salt,
                    next_hashed,
                    types: TypeBitmap::parse(parser.read_bytes(bitmap_len)?)?,
                }
            }
            Rtype::NSEC3PARAM => Rdata::Nsec3param {
                hash_alg: parser.read_u8()?,
                flags: parser.read_u8()?,
                iterations: parser.read_u16()?,
                salt: parser.read_character_string()?.to_vec(),
            },
            Rtype::TSIG => {
                let algorithm = Name::parse(parser)?;
                let time_signed = parser.read_u48()?;
                let fudge = parser.read_u16()?;
                let mac_len = parser.read_u16()? as usize;
                let mac = parser.read_bytes(mac_len)?.to_vec();
                let original_id = parser.read_u16()?;
                let error = parser.read_u16()?;
                let other_len = parser.read_u16()? as usize;
                let other = parser.read_bytes(other_len)?.to_vec();
                Rdata::Tsig(Tsig {
                    algorithm,
                    time_signed,
                    fudge,
                    mac,
                    original_id,
                    error,
                    other,
                })
            }
            _ => Rdata::Other(Bytes::copy_from_slice(parser.read_bytes(rdlen)?)),
        };

        if parser.pos() != end {
            return Err(WireError::BadRdataLength);
        }
        Ok(rdata)
    }

    /// Append the wire form.
    ///
    /// Name fields of the RFC 1035 types may be compressed against the
    /// message; everything else is written verbatim.
    pub fn append(&self, builder: &mut Builder) -> Result<(), WireError> {
        match self {
            Rdata::A(addr) => builder.push_bytes(&addr.octets()),
            Rdata::Aaaa(addr) => builder.push_bytes(&addr.octets()),
            Rdata::Ns(name) | Rdata::Cname(name) | Rdata::Ptr(name) => name.append_wire(builder),
            Rdata::Mx {
                preference,
                exchange,
            } => {
                builder.push_u16(*preference)?;
                exchange.append_wire(builder)
            }
            Rdata::Soa(soa) => {
                soa.mname.append_wire(builder)?;
                soa.rname.append_wire(builder)?;
                builder.push_u32(soa.serial)?;
                builder.push_u32(soa.refresh)?;
                builder.push_u32(soa.retry)?;
                builder.push_u32(soa.expire)?;
                builder.push_u32(soa.minimum)
            }
            Rdata::Txt(strings) => {
                for s in strings {
                    builder.push_u8(s.len() as u8)?;
                    builder.push_bytes(s)?;
                }
                Ok(())
            }
            Rdata::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                builder.push_u16(*priority)?;
                builder.push_u16(*weight)?;
                builder.push_u16(*port)?;
                target.append_uncompressed(builder)
            }
            Rdata::Naptr {
                order,
                preference,
                flags,
                services,
                regexp,
                replacement,
            } => {
                builder.push_u16(*order)?;
                builder.push_u16(*preference)?;
                for s in [flags, services, regexp] {
                    builder.push_u8(s.len() as u8)?;
                    builder.push_bytes(s)?;
                }
                replacement.append_uncompressed(builder)
            }
            Rdata::Dnskey {
                flags,
                protocol,
                algorithm,
                public_key,
            } => {
                builder.push_u16(*flags)?;
                builder.push_u8(*protocol)?;
                builder.push_u8(*algorithm)?;
                builder.push_bytes(public_key)
            }
            Rdata::Rrsig(rrsig) => {
                let mut prefix = Vec::with_capacity(32 + rrsig.signer.wire_len());
                rrsig.append_rdata_prefix(&mut prefix);
                builder.push_bytes(&prefix)?;
                builder.push_bytes(&rrsig.signature)
            }
            Rdata::Ds {
                key_tag,
                algorithm,
                digest_type,
                digest,
            } => {
                builder.push_u16(*key_tag)?;
                builder.push_u8(*algorithm)?;
                builder.push_u8(*digest_type)?;
                builder.push_bytes(digest)
            }
            Rdata::Nsec { next, types } => {
                next.append_uncompressed(builder)?;
                let mut bitmap = Vec::new();
                types.append(&mut bitmap);
                builder.push_bytes(&bitmap)
            }
            Rdata::Nsec3 {
                hash_alg,
                flags,
                iterations,
                salt,
                next_hashed,
                types,
            } => {
                builder.push_u8(*hash_alg)?;
                builder.push_u8(*flags)?;
                builder.push_u16(*iterations)?;
                builder.push_u8(salt.len() as u8)?;
                builder.push_bytes(salt)?;
                builder.push_u8(next_hashed.len() as u8)?;
                builder.push_bytes(next_hashed)?;
                let mut bitmap = Vec::new();
                types.append(&mut bitmap);
                builder.push_bytes(&bitmap)
            }
            Rdata::Nsec3param {
                hash_alg,
                flags,
                iterations,
                salt,
            } => {
                builder.push_u8(*hash_alg)?;
                builder.push_u8(*flags)?;
                builder.push_u16(*iterations)?;
                builder.push_u8(salt.len() as u8)?;
                builder.push_bytes(salt)
            }
            Rdata::Tsig(tsig) => {
                tsig.algorithm.append_uncompressed(builder)?;
                builder.push_u48(tsig.time_signed)?;
                builder.push_u16(tsig.fudge)?;
                builder.push_u16(tsig.mac.len() as u16)?;
                builder.push_bytes(&tsig.mac)?;
                builder.push_u16(tsig.original_id)?;
                builder.push_u16(tsig.error)?;
                builder.push_u16(tsig.other.len() as u16)?;
                builder.push_bytes(&tsig.other)
            }
            Rdata::Other(bytes) => builder.push_bytes(bytes),
        }
    }

    /// Append the canonical form used as DNSSEC signing input: no
    /// compression, and the name fields of the RFC 1035-era types
    /// lowercased (RFC 4034 §6.2).
    pub fn append_canonical(&self, out: &mut Vec<u8>) {
        match self {
            Rdata::Ns(name) | Rdata::Cname(name) | Rdata::Ptr(name) => {
                name.append_canonical(out);
            }
            Rdata::Mx {
                preference,
                exchange,
            } => {
                out.extend_from_slice(&preference.to_be_bytes());
                exchange.append_canonical(out);
            }
            Rdata::Soa(soa) => {
                soa.mname.append_canonical(out);
                soa.rname.append_canonical(out);
                for v in [soa.serial, soa.refresh, soa.retry, soa.expire, soa.minimum] {
                    out.extend_from_slice(&v.to_be_bytes());
                }
            }
            Rdata::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                out.extend_from_slice(&priority.to_be_bytes());
                out.extend_from_slice(&weight.to_be_bytes());
                out.extend_from_slice(&port.to_be_bytes());
                target.append_canonical(out);
            }
            Rdata::Naptr {
                order,
                preference,
                flags,
                services,
                regexp,
                replacement,
            } => {
                out.extend_from_slice(&order.to_be_bytes());
                out.extend_from_slice(&preference.to_be_bytes());
                for s in [flags, services, regexp] {
                    out.push(s.len() as u8);
                    out.extend_from_slice(s);
                }
                replacement.append_canonical(out);
            }
            // All remaining types have no name fields or keep them verbatim
            // (RFC 6840 §5.1 for RRSIG); their canonical form is the plain
            // wire form.
            other => {
                let mut builder = Builder::new(u16::MAX as usize);
                other
                    .append(&mut builder)
                    .expect("rdata exceeds maximum message size");
                out.extend_from_slice(builder.as_slice());
            }
        }
    }

    /// The canonical wire form as an owned buffer, for RRset sorting.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.append_canonical(&mut out);
        out
    }

    /// Parse the text form the backing store keeps for a record.
    ///
    /// `aux` carries the type-specific priority the store externalizes (MX
    /// preference, SRV priority).  SOA never comes through here; the store
    /// has dedicated columns for it.
    pub fn from_text(rtype: Rtype, aux: u32, text: &str) -> Result<Self, RdataTextError> {
        let text = text.trim();
        match rtype {
            Rtype::A => Ok(Rdata::A(
                Ipv4Addr::from_str(text).map_err(|_| RdataTextError::BadAddress)?,
            )),
            Rtype::AAAA => Ok(Rdata::Aaaa(
                Ipv6Addr::from_str(text).map_err(|_| RdataTextError::BadAddress)?,
            )),
            Rtype::NS => Ok(Rdata::Ns(parse_name(text)?)),
            Rtype::CNAME => Ok(Rdata::Cname(parse_name(text)?)),
            Rtype::PTR => Ok(Rdata::Ptr(parse_name(text)?)),
            Rtype::MX => Ok(Rdata::Mx {
                preference: aux as u16,
                exchange: parse_name(text)?,
            }),
            Rtype::TXT => {
                if text.len() > 65000 {
                    return Err(RdataTextError::TooLong);
                }
                let strings = text
                    .as_bytes()
                    .chunks(255)
                    .map(<[u8]>::to_vec)
                    .collect::<Vec<_>>();
                if strings.is_empty() {
                    return Err(RdataTextError::Empty);
                }
                Ok(Rdata::Txt(strings))
            }
            Rtype::SRV => {
                let mut words = text.split_whitespace();
                let weight = parse_u16(words.next())?;
                let port = parse_u16(words.next())?;
                let target = parse_name(words.next().ok_or(RdataTextError::MissingField)?)?;
                Ok(Rdata::Srv {
                    priority: aux as u16,
                    weight,
                    port,
                    target,
                })
            }
            Rtype::NAPTR => parse_naptr(text),
            _ => Err(RdataTextError::UnsupportedType),
        }
    }
}

fn parse_name(text: &str) -> Result<Name, RdataTextError> {
    Name::from_str(text).map_err(RdataTextError::BadName)
}

fn parse_u16(word: Option<&str>) -> Result<u16, RdataTextError> {
    word.ok_or(RdataTextError::MissingField)?
        .parse()
        .map_err(|_| RdataTextError::BadNumber)
}

/// Parse NAPTR text: `order preference "flags" "services" "regexp" replacement`.
///
/// The three text fields are read by a character-level state machine so that
/// quoted strings may contain spaces and `\"`/`\\` escapes.
fn parse_naptr(text: &str) -> Result<Rdata, RdataTextError> {
    #[derive(PartialEq)]
    enum State {
        Between,
        Bare,
        Quoted,
        QuotedEscape,
    }

    let mut tokens: Vec<Vec<u8>> = Vec::new();
    let mut current = Vec::new();
    let mut state = State::Between;

    for b in text.bytes() {
        match state {
            State::Between => match b {
                b' ' | b'\t' => {}
                b'"' => {
                    state = State::Quoted;
                    current.clear();
                }
                _ => {
                    state = State::Bare;
                    current.clear();
                    current.push(b);
                }
            },
            State::Bare => match b {
                b' ' | b'\t' => {
                    tokens.push(std::mem::take(&mut current));
                    state = State::Between;
                }
                _ => current.push(b),
            },
            State::Quoted => match b {
                b'"' => {
                    tokens.push(std::mem::take(&mut current));
                    state = State::Between;
                }
                b'\\' => state = State::QuotedEscape,
                _ => current.push(b),
            },
            State::QuotedEscape => {
                current.push(b);
                state = State::Quoted;
            }
        }
    }
    match state {
        State::Bare => tokens.push(current),
        State::Between => {}
        State::Quoted | State::QuotedEscape => return Err(RdataTextError::UnterminatedQuote),
    }

    if tokens.len() != 6 {
        return Err(RdataTextError::MissingField);
    }
    let order = parse_u16(std::str::from_utf8(&tokens[0]).ok())?;
    let preference = parse_u16(std::str::from_utf8(&tokens[1]).ok())?;
    for field in &tokens[2..5] {
        if field.len() > 255 {
            return Err(RdataTextError::TooLong);
        }
    }
    let replacement = parse_name(
        std::str::from_utf8(&tokens[5]).map_err(|_| RdataTextError::BadName(
            crate::name::NameError::BadOctet,
        ))?,
    )?;

    Ok(Rdata::Naptr {
        order,
        preference,
        flags: tokens[2].clone(),
        services: tokens[3].clone(),
        regexp: tokens[4].clone(),
        replacement,
    })
}

//----------- RdataTextError ---------------------------------------------------

/// Invalid record text from the backing store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RdataTextError {
    BadAddress,
    BadName(crate::name::NameError),
    BadNumber,
    MissingField,
    UnterminatedQuote,
    TooLong,
    Empty,
    UnsupportedType,
}

impl fmt::Display for RdataTextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadAddress => f.write_str("invalid IP address"),
            Self::BadName(err) => write!(f, "invalid name: {err}"),
            Self::BadNumber => f.write_str("invalid numeric field"),
            Self::MissingField => f.write_str("missing field"),
            Self::UnterminatedQuote => f.write_str("unterminated quoted string"),
            Self::TooLong => f.write_str("field too long"),
            Self::Empty => f.write_str("empty record data"),
            Self::UnsupportedType => f.write_str("no text form for this record type"),
        }
    }
}

impl std::error::Error for RdataTextError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Parser;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn round_trip(rtype: Rtype, rdata: &Rdata) {
        let mut builder = Builder::new(512);
        rdata.append(&mut builder).unwrap();
        let buf = builder.finish();
        let mut parser = Parser::new(&buf);
        let parsed = Rdata::parse(rtype, &mut parser, buf.len()).unwrap();
        assert_eq!(&parsed, rdata);
    }

    #[test]
    fn wire_round_trips() {
        round_trip(Rtype::A, &Rdata::A("192.0.2.1".parse().unwrap()));
        round_trip(Rtype::AAAA, &Rdata::Aaaa("2001:db8::1".parse().unwrap()));
        round_trip(
            Rtype::MX,
            &Rdata::Mx {
                preference: 10,
                exchange: name("mail.example.com."),
            },
        );
        round_trip(
            Rtype::SOA,
            &Rdata::Soa(Soa {
                mname: name("ns1.example.com."),
                rname: name("hostmaster.example.com."),
                serial: 2024010101,
                refresh: 7200,
                retry: 1800,
                expire: 1209600,
                minimum: 600,
            }),
        );
        round_trip(
            Rtype::SRV,
            &Rdata::Srv {
                priority: 1,
                weight: 5,
                port: 5060,
                target: name("sip.example.com."),
            },
        );
        round_trip(Rtype::TXT, &Rdata::Txt(vec![b"hello world".to_vec()]));
        round_trip(
            Rtype::NSEC,
            &Rdata::Nsec {
                next: name("b.example.com."),
                types: TypeBitmap::from_types(vec![Rtype::A, Rtype::RRSIG, Rtype::NSEC]),
            },
        );
    }

    #[test]
    fn rdlength_must_match() {
        // An A record with five octets of rdata.
        let buf = [192, 0, 2, 1, 0];
        let mut parser = Parser::new(&buf);
        assert_eq!(
            Rdata::parse(Rtype::A, &mut parser, 5),
            Err(WireError::BadRdataLength)
        );
    }

    #[test]
    fn type_bitmap_windows() {
        // TYPE1 (A) and TYPE1234 land in different windows.
        let bitmap = TypeBitmap::from_types(vec![Rtype::from_int(1234), Rtype::A]);
        let mut out = Vec::new();
        bitmap.append(&mut out);
        let parsed = TypeBitmap::parse(&out).unwrap();
        assert!(parsed.contains(Rtype::A));
        assert!(parsed.contains(Rtype::from_int(1234)));
        assert_eq!(parsed.types().len(), 2);
    }

    #[test]
    fn naptr_text_state_machine() {
        let rdata = Rdata::from_text(
            Rtype::NAPTR,
            0,
            r#"100 50 "s" "SIP+D2U" "!^.*$!sip:info@example.com!" _sip._udp.example.com."#,
        )
        .unwrap();
        match rdata {
            Rdata::Naptr {
                order,
                preference,
                flags,
                services,
                regexp,
                replacement,
            } => {
                assert_eq!(order, 100);
                assert_eq!(preference, 50);
                assert_eq!(flags, b"s");
                assert_eq!(services, b"SIP+D2U");
                assert_eq!(regexp, b"!^.*$!sip:info@example.com!");
                assert_eq!(replacement, name("_sip._udp.example.com."));
            }
            other => panic!("unexpected rdata: {other:?}"),
        }
    }

    #[test]
    fn naptr_text_quoted_escapes() {
        let rdata =
            Rdata::from_text(Rtype::NAPTR, 0, r#"1 2 "a\"b" "with space" "" ."#).unwrap();
        match rdata {
            Rdata::Naptr {
                flags, services, ..
            } => {
                assert_eq!(flags, br#"a"b"#);
                assert_eq!(services, b"with space");
            }
            other => panic!("unexpected rdata: {other:?}"),
        }

        assert_eq!(
            Rdata::from_text(Rtype::NAPTR, 0, r#"1 2 "open"#),
            Err(RdataTextError::UnterminatedQuote)
        );
    }

    #[test]
    fn srv_text_uses_aux_priority() {
        let rdata = Rdata::from_text(Rtype::SRV, 10, "20 5060 sip.example.net.").unwrap();
        assert_eq!(
            rdata,
            Rdata::Srv {
                priority: 10,
                weight: 20,
                port: 5060,
                target: name("sip.example.net."),
            }
        );
    }
}
