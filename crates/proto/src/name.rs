//! Domain names.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::wire::{Builder, Parser, WireError};

/// The maximum wire length of a name, including the root label.
const MAX_WIRE_LEN: usize = 255;

/// The maximum length of a single label.
const MAX_LABEL_LEN: usize = 63;

/// The maximum number of compression pointer hops followed while decoding.
const MAX_POINTER_HOPS: usize = 128;

//----------- Name -------------------------------------------------------------

/// A domain name.
///
/// Stored in uncompressed wire form: a sequence of length-prefixed labels
/// ending with the zero-length root label.  The original octet case is
/// preserved; comparison, hashing and ordering are case-insensitive per
/// RFC 1035 §2.3.3.
#[derive(Clone)]
pub struct Name {
    wire: Vec<u8>,
}

impl Name {
    /// The root name.
    pub fn root() -> Self {
        Self { wire: vec![0] }
    }

    /// The name's uncompressed wire form.
    pub fn as_wire(&self) -> &[u8] {
        &self.wire
    }

    /// The wire length of the name, including the root label.
    pub fn wire_len(&self) -> usize {
        self.wire.len()
    }

    pub fn is_root(&self) -> bool {
        self.wire.len() == 1
    }

    /// The number of labels, excluding the root label.
    pub fn label_count(&self) -> usize {
        self.labels().count()
    }

    /// Iterate over the labels from the left (most specific first).
    pub fn labels(&self) -> LabelIter<'_> {
        LabelIter {
            wire: &self.wire,
            pos: 0,
        }
    }

    /// The name with its leftmost label removed.
    ///
    /// Returns `None` for the root.
    pub fn parent(&self) -> Option<Name> {
        if self.is_root() {
            return None;
        }
        let skip = 1 + self.wire[0] as usize;
        Some(Name {
            wire: self.wire[skip..].to_vec(),
        })
    }

    /// Whether `suffix` is this name or an ancestor of it.
    pub fn ends_with(&self, suffix: &Name) -> bool {
        if suffix.wire.len() > self.wire.len() {
            return false;
        }
        let tail = &self.wire[self.wire.len() - suffix.wire.len()..];
        eq_ignore_case(tail, &suffix.wire)
    }

    /// The canonical (lowercased) wire form.
    pub fn canonical_wire(&self) -> Vec<u8> {
        self.wire.iter().map(|b| b.to_ascii_lowercase()).collect()
    }

    /// The djb2 hash of the lowercased wire form.
    ///
    /// The record and cache tables derive their bucket index from this.
    pub fn djb2(&self) -> u32 {
        let mut hash: u32 = 5381;
        for b in &self.wire {
            hash = hash
                .wrapping_mul(33)
                .wrapping_add(u32::from(b.to_ascii_lowercase()));
        }
        hash
    }

    /// Canonical DNSSEC ordering: compare label by label starting from the
    /// root, lowercased, shorter label sequences first (RFC 4034 §6.1).
    pub fn canonical_cmp(&self, other: &Name) -> Ordering {
        let mut a: Vec<&[u8]> = self.labels().collect();
        let mut b: Vec<&[u8]> = other.labels().collect();
        a.reverse();
        b.reverse();
        for (la, lb) in a.iter().zip(b.iter()) {
            let la = la.iter().map(|c| c.to_ascii_lowercase());
            let lb = lb.iter().map(|c| c.to_ascii_lowercase());
            match la.cmp(lb) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        a.len().cmp(&b.len())
    }

    /// Prepend a single label, as for wildcard expansion and NSEC3 owners.
    pub fn prepend(&self, label: &[u8]) -> Result<Name, NameError> {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(NameError::BadLabel);
        }
        let mut wire = Vec::with_capacity(1 + label.len() + self.wire.len());
        wire.push(label.len() as u8);
        wire.extend_from_slice(label);
        wire.extend_from_slice(&self.wire);
        if wire.len() > MAX_WIRE_LEN {
            return Err(NameError::TooLong);
        }
        Ok(Name { wire })
    }

    /// Parse a name from wire data, following compression pointers.
    ///
    /// Pointers must target earlier bytes than their own position and the
    /// chain is capped at [`MAX_POINTER_HOPS`].
    pub fn parse(parser: &mut Parser<'_>) -> Result<Self, WireError> {
        let buf = parser.buf();
        let mut wire = Vec::with_capacity(32);
        let mut pos = parser.pos();
        // Position just past the name as seen by the caller; fixed once the
        // first pointer is followed.
        let mut end: Option<usize> = None;
        let mut hops = 0;

        loop {
            let len = *buf.get(pos).ok_or(WireError::ShortMessage)?;
            match len {
                0 => {
                    wire.push(0);
                    if wire.len() > MAX_WIRE_LEN {
                        return Err(WireError::LongName);
                    }
                    parser.seek(end.unwrap_or(pos + 1))?;
                    return Ok(Name { wire });
                }
                1..=63 => {
                    let label_end = pos + 1 + len as usize;
                    if label_end > buf.len() {
                        return Err(WireError::ShortMessage);
                    }
                    wire.extend_from_slice(&buf[pos..label_end]);
                    if wire.len() >= MAX_WIRE_LEN {
                        return Err(WireError::LongName);
                    }
                    pos = label_end;
                }
                0xC0..=0xFF => {
                    let low = *buf.get(pos + 1).ok_or(WireError::ShortMessage)?;
                    let target = usize::from(len & 0x3F) << 8 | usize::from(low);
                    if target >= pos {
                        return Err(WireError::ForwardPointer);
                    }
                    hops += 1;
                    if hops > MAX_POINTER_HOPS {
                        return Err(WireError::PointerLoop);
                    }
                    end.get_or_insert(pos + 2);
                    pos = target;
                }
                _ => return Err(WireError::BadLabelType),
            }
        }
    }

    /// Append the name to a message, compressing against earlier names.
    pub fn append_wire(&self, builder: &mut Builder) -> Result<(), WireError> {
        let canonical = self.canonical_wire();
        let mut offset = 0;
        // Find the longest remembered suffix, walking label by label.
        loop {
            if canonical[offset] == 0 {
                return builder.push_u8(0);
            }
            if let Some(target) = builder.lookup_name(&canonical[offset..]) {
                return builder.push_u16(0xC000 | target);
            }
            let start = builder.pos();
            let label_len = 1 + self.wire[offset] as usize;
            builder.push_bytes(&self.wire[offset..offset + label_len])?;
            // Remember the suffix we are about to finish writing.  The
            // offset recorded is where this suffix starts in the message.
            builder.remember_name(canonical[offset..].to_vec(), start);
            offset += label_len;
        }
    }

    /// Append the name without compression, preserving case.
    pub fn append_uncompressed(&self, builder: &mut Builder) -> Result<(), WireError> {
        builder.push_bytes(&self.wire)
    }

    /// Append the canonical form (lowercase, uncompressed) used as DNSSEC
    /// and TSIG signing input.
    pub fn append_canonical(&self, out: &mut Vec<u8>) {
        out.extend(self.wire.iter().map(|b| b.to_ascii_lowercase()));
    }
}

fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

//--- Comparison, hashing

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        eq_ignore_case(&self.wire, &other.wire)
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in &self.wire {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Name {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical_cmp(other)
    }
}

//--- Presentation format

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        for label in self.labels() {
            for &b in label {
                match b {
                    b'.' | b'\\' => write!(f, "\\{}", b as char)?,
                    0x21..=0x7E => write!(f, "{}", b as char)?,
                    _ => write!(f, "\\{b:03}")?,
                }
            }
            f.write_str(".")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({self})")
    }
}

impl FromStr for Name {
    type Err = NameError;

    /// Parse the presentation format.
    ///
    /// `\.`, `\\` and `\DDD` escapes are understood; a missing final dot is
    /// tolerated.  NUL octets and stray backslashes are rejected, which is
    /// the last line of defense against names injected through the backing
    /// store.
    fn from_str(s: &str) -> Result<Self, NameError> {
        if s.is_empty() {
            return Err(NameError::Empty);
        }
        if s == "." {
            return Ok(Name::root());
        }

        let mut wire = Vec::with_capacity(s.len() + 2);
        let mut label = Vec::new();
        let mut chars = s.bytes().peekable();

        while let Some(b) = chars.next() {
            match b {
                b'.' => {
                    if label.is_empty() {
                        return Err(NameError::BadLabel);
                    }
                    push_label(&mut wire, &label)?;
                    label.clear();
                }
                b'\\' => {
                    let next = chars.next().ok_or(NameError::BadEscape)?;
                    if next.is_ascii_digit() {
                        let d1 = next - b'0';
                        let d2 = chars
                            .next()
                            .filter(u8::is_ascii_digit)
                            .ok_or(NameError::BadEscape)?
                            - b'0';
                        let d3 = chars
                            .next()
                            .filter(u8::is_ascii_digit)
                            .ok_or(NameError::BadEscape)?
                            - b'0';
                        let value = u32::from(d1) * 100 + u32::from(d2) * 10 + u32::from(d3);
                        let value = u8::try_from(value).map_err(|_| NameError::BadEscape)?;
                        if value == 0 {
                            return Err(NameError::BadOctet);
                        }
                        label.push(value);
                    } else {
                        label.push(next);
                    }
                }
                0 => return Err(NameError::BadOctet),
                _ => label.push(b),
            }
        }
        if !label.is_empty() {
            push_label(&mut wire, &label)?;
        }

        wire.push(0);
        if wire.len() > MAX_WIRE_LEN {
            return Err(NameError::TooLong);
        }
        Ok(Name { wire })
    }
}

fn push_label(wire: &mut Vec<u8>, label: &[u8]) -> Result<(), NameError> {
    if label.len() > MAX_LABEL_LEN {
        return Err(NameError::BadLabel);
    }
    wire.push(label.len() as u8);
    wire.extend_from_slice(label);
    Ok(())
}

//----------- LabelIter --------------------------------------------------------

/// An iterator over the labels of a name, excluding the root label.
#[derive(Clone, Debug)]
pub struct LabelIter<'a> {
    wire: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for LabelIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let len = self.wire[self.pos] as usize;
        if len == 0 {
            return None;
        }
        let start = self.pos + 1;
        self.pos = start + len;
        Some(&self.wire[start..start + len])
    }
}

//----------- NameError --------------------------------------------------------

/// An invalid presentation-format name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameError {
    Empty,
    BadLabel,
    BadEscape,
    BadOctet,
    TooLong,
}

impl fmt::Display for NameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Empty => "empty name",
            Self::BadLabel => "empty or oversized label",
            Self::BadEscape => "invalid escape sequence",
            Self::BadOctet => "illegal octet in name",
            Self::TooLong => "name exceeds 255 octets",
        })
    }
}

impl std::error::Error for NameError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    #[test]
    fn parse_presentation() {
        let n = name("www.Example.COM.");
        assert_eq!(n.label_count(), 3);
        assert_eq!(n.to_string(), "www.Example.COM.");
        assert_eq!(n, name("WWW.example.com"));
    }

    #[test]
    fn rejects_bad_names() {
        assert!(Name::from_str("").is_err());
        assert!(Name::from_str("a..b").is_err());
        assert!(Name::from_str("a\\").is_err());
        assert!(Name::from_str("a\\0b").is_err());
        assert!(Name::from_str(&"x".repeat(64)).is_err());
    }

    #[test]
    fn case_insensitive_hash_and_eq() {
        use std::collections::hash_map::DefaultHasher;

        let a = name("A.Example.Org.");
        let b = name("a.eXAMPLE.org.");
        assert_eq!(a, b);

        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
        assert_eq!(a.djb2(), b.djb2());
    }

    #[test]
    fn suffix_matching() {
        let zone = name("example.com.");
        assert!(name("www.example.com.").ends_with(&zone));
        assert!(name("example.com.").ends_with(&zone));
        assert!(!name("example.org.").ends_with(&zone));
        assert!(name("www.example.com.").ends_with(&Name::root()));
    }

    #[test]
    fn canonical_order() {
        // The example ordering from RFC 4034 §6.1.
        let mut names = vec![
            name("*.z.example."),
            name("a.example."),
            name("example."),
            name("zABC.a.EXAMPLE."),
            name("yljkjljk.a.example."),
            name("Z.a.example."),
            name("z.example."),
            name("\\200.z.example."),
        ];
        names.sort();
        let expect = [
            "example.",
            "a.example.",
            "yljkjljk.a.example.",
            "Z.a.example.",
            "zABC.a.EXAMPLE.",
            "z.example.",
            "*.z.example.",
            "\\200.z.example.",
        ];
        let got: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        assert_eq!(got, expect);
    }

    #[test]
    fn wire_parse_with_compression() {
        // "foo.example." at 0, then a pointer form "bar" + ptr(4) at 13.
        #[rustfmt::skip]
        let buf = [
            3, b'f', b'o', b'o', 7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0,
            3, b'b', b'a', b'r', 0xC0, 0x04,
        ];
        let mut p = Parser::new(&buf);
        let first = Name::parse(&mut p).unwrap();
        assert_eq!(first.to_string(), "foo.example.");
        let second = Name::parse(&mut p).unwrap();
        assert_eq!(second.to_string(), "bar.example.");
        assert_eq!(p.remaining(), 0);
    }

    #[test]
    fn wire_parse_rejects_forward_pointer_and_loops() {
        // Pointer at offset 0 pointing at itself.
        let buf = [0xC0, 0x00];
        let mut p = Parser::new(&buf);
        assert_eq!(Name::parse(&mut p), Err(WireError::ForwardPointer));

        // A pointer chain bouncing between two earlier pointers.
        let buf = [0xC0, 0x02, 0xC0, 0x00, 0xC0, 0x02];
        let mut p = Parser::new(&buf);
        p.seek(4).unwrap();
        assert!(matches!(
            Name::parse(&mut p),
            Err(WireError::ForwardPointer | WireError::PointerLoop)
        ));
    }

    #[test]
    fn compression_on_encode() {
        let mut b = Builder::new(512);
        name("mail.example.com.").append_wire(&mut b).unwrap();
        let plain_len = b.pos();
        name("www.example.com.").append_wire(&mut b).unwrap();
        // Second name is one label plus a two-octet pointer.
        assert_eq!(b.pos() - plain_len, 4 + 2);

        let buf = b.finish();
        let mut p = Parser::new(&buf);
        assert_eq!(Name::parse(&mut p).unwrap(), name("mail.example.com."));
        assert_eq!(Name::parse(&mut p).unwrap(), name("www.example.com."));
    }
}
