//! DNS wire protocol types for Palisade.
//!
//! This crate implements the data plane of the name server: domain names,
//! messages, and the per-type record data formats of RFC 1035 and the DNSSEC
//! RFCs (4034, 5155), together with the cursor types used to read and write
//! them.  Decoding accepts message compression; encoding may compress owner
//! names but never emits a pointer into bytes that have not been written yet.
//!
//! The crate is deliberately free of I/O and crypto so that the daemon can
//! unit-test protocol behavior without sockets or keys.

pub mod iana;
pub mod message;
pub mod name;
pub mod rdata;
pub mod wire;

pub use iana::{Class, Opcode, Rcode, Rtype, TsigRcode};
pub use message::{Edns, Header, Message, Question, Record};
pub use name::Name;
pub use rdata::{Rdata, Rrsig, Soa, Tsig, TypeBitmap};
pub use wire::{Builder, Parser, WireError};
