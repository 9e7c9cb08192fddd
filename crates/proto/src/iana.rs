//! IANA registry values used on the wire.
//!
//! These are newtypes over the raw integers rather than Rust enums: unknown
//! values must survive a decode/encode round trip untouched.

use std::fmt;

//----------- Rtype ------------------------------------------------------------

/// A resource record type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rtype(u16);

impl Rtype {
    pub const A: Rtype = Rtype(1);
    pub const NS: Rtype = Rtype(2);
    pub const CNAME: Rtype = Rtype(5);
    pub const SOA: Rtype = Rtype(6);
    pub const PTR: Rtype = Rtype(12);
    pub const MX: Rtype = Rtype(15);
    pub const TXT: Rtype = Rtype(16);
    pub const AAAA: Rtype = Rtype(28);
    pub const SRV: Rtype = Rtype(33);
    pub const NAPTR: Rtype = Rtype(35);
    pub const OPT: Rtype = Rtype(41);
    pub const DS: Rtype = Rtype(43);
    pub const RRSIG: Rtype = Rtype(46);
    pub const NSEC: Rtype = Rtype(47);
    pub const DNSKEY: Rtype = Rtype(48);
    pub const NSEC3: Rtype = Rtype(50);
    pub const NSEC3PARAM: Rtype = Rtype(51);
    pub const TSIG: Rtype = Rtype(250);
    pub const IXFR: Rtype = Rtype(251);
    pub const AXFR: Rtype = Rtype(252);
    pub const ANY: Rtype = Rtype(255);

    pub const fn from_int(value: u16) -> Self {
        Self(value)
    }

    pub const fn to_int(self) -> u16 {
        self.0
    }

    /// Whether this is a query-only meta type that never appears in a zone.
    pub fn is_meta(self) -> bool {
        matches!(self, Self::OPT | Self::TSIG | Self::IXFR | Self::AXFR | Self::ANY)
    }
}

impl fmt::Display for Rtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::A => f.write_str("A"),
            Self::NS => f.write_str("NS"),
            Self::CNAME => f.write_str("CNAME"),
            Self::SOA => f.write_str("SOA"),
            Self::PTR => f.write_str("PTR"),
            Self::MX => f.write_str("MX"),
            Self::TXT => f.write_str("TXT"),
            Self::AAAA => f.write_str("AAAA"),
            Self::SRV => f.write_str("SRV"),
            Self::NAPTR => f.write_str("NAPTR"),
            Self::OPT => f.write_str("OPT"),
            Self::DS => f.write_str("DS"),
            Self::RRSIG => f.write_str("RRSIG"),
            Self::NSEC => f.write_str("NSEC"),
            Self::DNSKEY => f.write_str("DNSKEY"),
            Self::NSEC3 => f.write_str("NSEC3"),
            Self::NSEC3PARAM => f.write_str("NSEC3PARAM"),
            Self::TSIG => f.write_str("TSIG"),
            Self::IXFR => f.write_str("IXFR"),
            Self::AXFR => f.write_str("AXFR"),
            Self::ANY => f.write_str("ANY"),
            Self(other) => write!(f, "TYPE{other}"),
        }
    }
}

impl fmt::Debug for Rtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

//----------- Class ------------------------------------------------------------

/// A resource record class.
///
/// Only IN is authoritative data; NONE and ANY appear in UPDATE semantics
/// and TSIG records use ANY.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Class(u16);

impl Class {
    pub const IN: Class = Class(1);
    pub const CH: Class = Class(3);
    pub const NONE: Class = Class(254);
    pub const ANY: Class = Class(255);

    pub const fn from_int(value: u16) -> Self {
        Self(value)
    }

    pub const fn to_int(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IN => f.write_str("IN"),
            Self::CH => f.write_str("CH"),
            Self::NONE => f.write_str("NONE"),
            Self::ANY => f.write_str("ANY"),
            Self(other) => write!(f, "CLASS{other}"),
        }
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

//----------- Opcode -----------------------------------------------------------

/// A message opcode.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(u8);

impl Opcode {
    pub const QUERY: Opcode = Opcode(0);
    pub const NOTIFY: Opcode = Opcode(4);
    pub const UPDATE: Opcode = Opcode(5);

    pub const fn from_int(value: u8) -> Self {
        Self(value & 0x0F)
    }

    pub const fn to_int(self) -> u8 {
        self.0
    }
}

impl Default for Opcode {
    fn default() -> Self {
        Self::QUERY
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::QUERY => f.write_str("QUERY"),
            Self::NOTIFY => f.write_str("NOTIFY"),
            Self::UPDATE => f.write_str("UPDATE"),
            Self(other) => write!(f, "OPCODE{other}"),
        }
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

//----------- Rcode ------------------------------------------------------------

/// A response code (the 4-bit header field).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rcode(u8);

impl Rcode {
    pub const NOERROR: Rcode = Rcode(0);
    pub const FORMERR: Rcode = Rcode(1);
    pub const SERVFAIL: Rcode = Rcode(2);
    pub const NXDOMAIN: Rcode = Rcode(3);
    pub const NOTIMP: Rcode = Rcode(4);
    pub const REFUSED: Rcode = Rcode(5);

    // RFC 2136 UPDATE result codes.
    pub const YXDOMAIN: Rcode = Rcode(6);
    pub const YXRRSET: Rcode = Rcode(7);
    pub const NXRRSET: Rcode = Rcode(8);
    pub const NOTAUTH: Rcode = Rcode(9);
    pub const NOTZONE: Rcode = Rcode(10);

    pub const fn from_int(value: u8) -> Self {
        Self(value & 0x0F)
    }

    pub const fn to_int(self) -> u8 {
        self.0
    }
}

impl Default for Rcode {
    fn default() -> Self {
        Self::NOERROR
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NOERROR => f.write_str("NOERROR"),
            Self::FORMERR => f.write_str("FORMERR"),
            Self::SERVFAIL => f.write_str("SERVFAIL"),
            Self::NXDOMAIN => f.write_str("NXDOMAIN"),
            Self::NOTIMP => f.write_str("NOTIMP"),
            Self::REFUSED => f.write_str("REFUSED"),
            Self::YXDOMAIN => f.write_str("YXDOMAIN"),
            Self::YXRRSET => f.write_str("YXRRSET"),
            Self::NXRRSET => f.write_str("NXRRSET"),
            Self::NOTAUTH => f.write_str("NOTAUTH"),
            Self::NOTZONE => f.write_str("NOTZONE"),
            Self(other) => write!(f, "RCODE{other}"),
        }
    }
}

impl fmt::Debug for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

//----------- TsigRcode --------------------------------------------------------

/// An extended response code carried in the TSIG error field (RFC 8945).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TsigRcode(u16);

impl TsigRcode {
    pub const NOERROR: TsigRcode = TsigRcode(0);
    pub const BADSIG: TsigRcode = TsigRcode(16);
    pub const BADKEY: TsigRcode = TsigRcode(17);
    pub const BADTIME: TsigRcode = TsigRcode(18);
    pub const BADTRUNC: TsigRcode = TsigRcode(22);

    pub const fn from_int(value: u16) -> Self {
        Self(value)
    }

    pub const fn to_int(self) -> u16 {
        self.0
    }
}

impl fmt::Display for TsigRcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NOERROR => f.write_str("NOERROR"),
            Self::BADSIG => f.write_str("BADSIG"),
            Self::BADKEY => f.write_str("BADKEY"),
            Self::BADTIME => f.write_str("BADTIME"),
            Self::BADTRUNC => f.write_str("BADTRUNC"),
            Self(other) => write!(f, "RCODE{other}"),
        }
    }
}

impl fmt::Debug for TsigRcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
