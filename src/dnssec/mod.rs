//! DNSSEC signing.
//!
//! Zones sign on the way out: when a query carries the DO bit and the zone
//! has signing keys, the resolver attaches RRSIGs to every RRset it emits
//! and NSEC or NSEC3 denial for negative answers.  Keys and per-zone signing
//! configuration come from the backing store.

pub mod denial;
pub mod keys;
pub mod sign;

pub use keys::{KeyRole, KeyStatus, SigningKey};
pub use sign::{SignError, ZoneSigner};

use crate::db::DnssecConfigRow;

//----------- DnssecConfig -----------------------------------------------------

/// Per-zone signing parameters.
#[derive(Clone, Debug)]
pub struct DnssecConfig {
    /// NSEC3 instead of NSEC for denial of existence.
    pub nsec3: bool,
    pub nsec3_iterations: u16,
    pub nsec3_salt: Vec<u8>,
    /// RRSIG validity in seconds.
    pub signature_validity: u32,
}

impl Default for DnssecConfig {
    fn default() -> Self {
        Self {
            nsec3: false,
            nsec3_iterations: 10,
            nsec3_salt: Vec::new(),
            signature_validity: 30 * 24 * 3600,
        }
    }
}

impl DnssecConfig {
    /// Build from a backing-store row.  The salt is hex in the row and raw
    /// bytes from here on.
    pub fn from_row(row: &DnssecConfigRow) -> Self {
        let salt = hex::decode(row.nsec3_salt.trim()).unwrap_or_default();
        Self {
            nsec3: row.nsec3,
            nsec3_iterations: row.nsec3_iterations,
            nsec3_salt: salt,
            signature_validity: if row.signature_validity == 0 {
                Self::default().signature_validity
            } else {
                row.signature_validity
            },
        }
    }
}
