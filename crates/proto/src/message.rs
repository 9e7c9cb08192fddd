//! DNS messages.

use crate::iana::{Class, Opcode, Rcode, Rtype};
use crate::name::Name;
use crate::rdata::Rdata;
use crate::wire::{Builder, Parser, WireError};

/// The classic maximum UDP payload, used when no EDNS size was advertised.
pub const UDP_PAYLOAD_LIMIT: usize = 512;

/// The largest message a TCP stream segment can carry.
pub const TCP_PAYLOAD_LIMIT: usize = 65535;

//----------- Header -----------------------------------------------------------

/// A message header, minus the section counts.
///
/// The counts are derived from the section vectors at encode time and are
/// not stored here, so a header can never disagree with its message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub qr: bool,
    pub opcode: Opcode,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub rcode: Rcode,
}

impl Header {
    fn parse(parser: &mut Parser<'_>) -> Result<(Self, [u16; 4]), WireError> {
        let id = parser.read_u16()?;
        let b2 = parser.read_u8()?;
        let b3 = parser.read_u8()?;
        let counts = [
            parser.read_u16()?,
            parser.read_u16()?,
            parser.read_u16()?,
            parser.read_u16()?,
        ];
        Ok((
            Self {
                id,
                qr: b2 & 0x80 != 0,
                opcode: Opcode::from_int(b2 >> 3),
                aa: b2 & 0x04 != 0,
                tc: b2 & 0x02 != 0,
                rd: b2 & 0x01 != 0,
                ra: b3 & 0x80 != 0,
                rcode: Rcode::from_int(b3),
            },
            counts,
        ))
    }

    fn append(&self, builder: &mut Builder, counts: [u16; 4]) -> Result<(), WireError> {
        builder.push_u16(self.id)?;
        let mut b2 = (self.opcode.to_int() & 0x0F) << 3;
        if self.qr {
            b2 |= 0x80;
        }
        if self.aa {
            b2 |= 0x04;
        }
        if self.tc {
            b2 |= 0x02;
        }
        if self.rd {
            b2 |= 0x01;
        }
        let mut b3 = self.rcode.to_int() & 0x0F;
        if self.ra {
            b3 |= 0x80;
        }
        builder.push_u8(b2)?;
        builder.push_u8(b3)?;
        for count in counts {
            builder.push_u16(count)?;
        }
        Ok(())
    }
}

//----------- Question ---------------------------------------------------------

/// A question section entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    pub qname: Name,
    pub qtype: Rtype,
    pub qclass: Class,
}

impl Question {
    pub fn new(qname: Name, qtype: Rtype) -> Self {
        Self {
            qname,
            qtype,
            qclass: Class::IN,
        }
    }

    fn parse(parser: &mut Parser<'_>) -> Result<Self, WireError> {
        Ok(Self {
            qname: Name::parse(parser)?,
            qtype: Rtype::from_int(parser.read_u16()?),
            qclass: Class::from_int(parser.read_u16()?),
        })
    }

    fn append(&self, builder: &mut Builder) -> Result<(), WireError> {
        self.qname.append_wire(builder)?;
        builder.push_u16(self.qtype.to_int())?;
        builder.push_u16(self.qclass.to_int())
    }
}

//----------- Record -----------------------------------------------------------

/// A resource record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub owner: Name,
    pub rtype: Rtype,
    pub class: Class,
    pub ttl: u32,
    pub rdata: Rdata,
}

impl Record {
    pub fn new(owner: Name, rtype: Rtype, ttl: u32, rdata: Rdata) -> Self {
        Self {
            owner,
            rtype,
            class: Class::IN,
            ttl,
            rdata,
        }
    }

    pub fn parse(parser: &mut Parser<'_>) -> Result<Self, WireError> {
        let owner = Name::parse(parser)?;
        let rtype = Rtype::from_int(parser.read_u16()?);
        let class = Class::from_int(parser.read_u16()?);
        let ttl = parser.read_u32()?;
        let rdlen = parser.read_u16()? as usize;
        let rdata = Rdata::parse(rtype, parser, rdlen)?;
        Ok(Self {
            owner,
            rtype,
            class,
            ttl,
            rdata,
        })
    }

    pub fn append(&self, builder: &mut Builder) -> Result<(), WireError> {
        self.owner.append_wire(builder)?;
        builder.push_u16(self.rtype.to_int())?;
        builder.push_u16(self.class.to_int())?;
        builder.push_u32(self.ttl)?;
        let rdlen_pos = builder.pos();
        builder.push_u16(0)?;
        let rdata_start = builder.pos();
        self.rdata.append(builder)?;
        let rdlen = builder.pos() - rdata_start;
        if rdlen > u16::MAX as usize {
            return Err(WireError::Oversized);
        }
        builder.patch_u16(rdlen_pos, rdlen as u16);
        Ok(())
    }

    /// The canonical wire form of the whole record with `ttl` substituted,
    /// as DNSSEC signing input wants it (RFC 4034 §3.1.8.1).
    pub fn append_canonical(&self, ttl: u32, out: &mut Vec<u8>) {
        self.owner.append_canonical(out);
        out.extend_from_slice(&self.rtype.to_int().to_be_bytes());
        out.extend_from_slice(&self.class.to_int().to_be_bytes());
        out.extend_from_slice(&ttl.to_be_bytes());
        let rdata = self.rdata.canonical_bytes();
        out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&rdata);
    }
}

//----------- Edns -------------------------------------------------------------

/// The EDNS information of a message (RFC 6891), reduced to what the server
/// speaks: a payload size and the DO bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edns {
    pub payload_size: u16,
    pub ext_rcode: u8,
    pub version: u8,
    pub do_bit: bool,
}

impl Edns {
    pub fn new(payload_size: u16, do_bit: bool) -> Self {
        Self {
            payload_size,
            ext_rcode: 0,
            version: 0,
            do_bit,
        }
    }

    fn from_opt(record: &Record) -> Self {
        Self {
            payload_size: record.class.to_int(),
            ext_rcode: (record.ttl >> 24) as u8,
            version: (record.ttl >> 16) as u8,
            do_bit: record.ttl & 0x8000 != 0,
        }
    }

    fn append(&self, builder: &mut Builder) -> Result<(), WireError> {
        builder.push_u8(0)?; // root owner
        builder.push_u16(Rtype::OPT.to_int())?;
        builder.push_u16(self.payload_size)?;
        let mut ttl = u32::from(self.ext_rcode) << 24 | u32::from(self.version) << 16;
        if self.do_bit {
            ttl |= 0x8000;
        }
        builder.push_u32(ttl)?;
        builder.push_u16(0) // empty rdata
    }
}

//----------- Message ----------------------------------------------------------

/// A complete DNS message.
///
/// An OPT record found while parsing is lifted out of the additional section
/// into [`Message::edns`]; a TSIG record stays in `additionals` (it must be
/// the last record there, which verification checks against the raw bytes).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
    pub edns: Option<Edns>,
}

impl Message {
    /// A fresh query for one question.
    pub fn query(id: u16, qname: Name, qtype: Rtype) -> Self {
        Self {
            header: Header {
                id,
                ..Header::default()
            },
            questions: vec![Question::new(qname, qtype)],
            ..Self::default()
        }
    }

    /// Start a response: same id and opcode, question echoed, QR set and
    /// the RD flag carried over.
    pub fn response_to(query: &Message) -> Self {
        Self {
            header: Header {
                id: query.header.id,
                qr: true,
                opcode: query.header.opcode,
                rd: query.header.rd,
                ..Header::default()
            },
            questions: query.questions.clone(),
            ..Self::default()
        }
    }

    /// Parse a complete message.
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let mut parser = Parser::new(buf);
        let (header, counts) = Header::parse(&mut parser)?;

        // A question takes at least 5 octets and a record at least 11; a
        // count promising more than the rest of the message can hold is
        // rejected before any allocation happens.
        let needed = counts[0] as usize * 5
            + (counts[1] as usize + counts[2] as usize + counts[3] as usize) * 11;
        if needed > parser.remaining() {
            return Err(WireError::BadCount);
        }

        let mut questions = Vec::with_capacity(counts[0] as usize);
        for _ in 0..counts[0] {
            questions.push(Question::parse(&mut parser)?);
        }

        let mut sections: [Vec<Record>; 3] = Default::default();
        let mut edns = None;
        for (section, count) in sections.iter_mut().zip(&counts[1..]) {
            for _ in 0..*count {
                let record = Record::parse(&mut parser)?;
                if record.rtype == Rtype::OPT {
                    edns = Some(Edns::from_opt(&record));
                } else {
                    section.push(record);
                }
            }
        }
        let [answers, authorities, additionals] = sections;

        Ok(Self {
            header,
            questions,
            answers,
            authorities,
            additionals,
            edns,
        })
    }

    /// Encode the message within `limit` octets.
    ///
    /// If the full message does not fit, sections are dropped in the order
    /// additional, authority, answer (from the back) and TC is set.  The
    /// header and question always fit or the limit itself is nonsense, in
    /// which case a bare truncated header is returned.
    pub fn build(&self, limit: usize) -> Vec<u8> {
        // Full message first, then the truncation ladder.
        if let Ok(buf) = self.try_encode(limit, self.answers.len(), true, true, self.header.tc) {
            return buf;
        }
        if let Ok(buf) = self.try_encode(limit, self.answers.len(), true, false, true) {
            return buf;
        }
        if let Ok(buf) = self.try_encode(limit, self.answers.len(), false, false, true) {
            return buf;
        }
        for kept in (0..self.answers.len()).rev() {
            if let Ok(buf) = self.try_encode(limit, kept, false, false, true) {
                return buf;
            }
        }

        // Nothing but the header fits.
        let mut header = self.header;
        header.tc = true;
        let mut builder = Builder::new(12);
        header
            .append(&mut builder, [0; 4])
            .expect("a header always fits 12 octets");
        builder.finish()
    }

    fn try_encode(
        &self,
        limit: usize,
        answers: usize,
        authority: bool,
        additional: bool,
        tc: bool,
    ) -> Result<Vec<u8>, WireError> {
        let mut header = self.header;
        header.tc = tc;

        let authorities: &[Record] = if authority { &self.authorities } else { &[] };
        let additionals: &[Record] = if additional { &self.additionals } else { &[] };
        let edns_count = usize::from(self.edns.is_some());

        let mut builder = Builder::new(limit);
        header.append(
            &mut builder,
            [
                self.questions.len() as u16,
                answers as u16,
                authorities.len() as u16,
                (additionals.len() + edns_count) as u16,
            ],
        )?;
        for question in &self.questions {
            question.append(&mut builder)?;
        }
        for record in &self.answers[..answers] {
            record.append(&mut builder)?;
        }
        for record in authorities {
            record.append(&mut builder)?;
        }
        if let Some(edns) = &self.edns {
            edns.append(&mut builder)?;
        }
        for record in additionals {
            record.append(&mut builder)?;
        }
        Ok(builder.finish())
    }
}
