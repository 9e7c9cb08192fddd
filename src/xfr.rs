//! The zone-transfer client: AXFR and IXFR over TCP, and NOTIFY validation.
//!
//! A refresh starts with a UDP SOA probe; only when the master's serial is
//! ahead does a TCP transfer run.  The response stream is parsed by an
//! explicit state machine ([`TransferParser`]) that understands both the
//! SOA-bracketed full form and the IXFR diff-segment form, including the
//! single-SOA "no history, go do AXFR" reply.  Application is atomic: the
//! backing store transaction commits first, then the in-memory zone swaps
//! under the store's write lock.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use palisade_proto::message::TCP_PAYLOAD_LIMIT;
use palisade_proto::{Message, Name, Rcode, Rdata, Record, Rtype, Soa, WireError};

use crate::config::MasterConfig;
use crate::db::{rdata_text, sql as db_sql, Backend, BackendError};
use crate::store::{Edit, Store, StoreError, StoredRecord, ZoneMeta};
use crate::tsig::{self, Keyring, TsigError};
use crate::util::Clock;

//----------- TransferError ----------------------------------------------------

/// Why a transfer failed.  Every variant leaves the store untouched.
#[derive(Debug)]
pub enum TransferError {
    /// Socket-level trouble: connect, read, write.
    Network(String),
    /// The stream could not be understood; nothing was applied.
    Parse(WireError),
    /// The stream violated the transfer protocol shape.
    Protocol(&'static str),
    /// TSIG verification failed or was missing.
    Auth(TsigError),
    /// The master answered with an error rcode.
    Refused(Rcode),
    /// The transfer deadline passed.
    Timeout,
    Store(StoreError),
    Backend(BackendError),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(err) => write!(f, "network error: {err}"),
            Self::Parse(err) => write!(f, "malformed transfer stream: {err}"),
            Self::Protocol(what) => write!(f, "protocol violation: {what}"),
            Self::Auth(err) => write!(f, "transfer authentication failed: {err}"),
            Self::Refused(rcode) => write!(f, "master answered {rcode}"),
            Self::Timeout => f.write_str("transfer timed out"),
            Self::Store(err) => write!(f, "zone store refused the transfer: {err}"),
            Self::Backend(err) => write!(f, "backing store refused the transfer: {err}"),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<WireError> for TransferError {
    fn from(err: WireError) -> Self {
        Self::Parse(err)
    }
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<BackendError> for TransferError {
    fn from(err: BackendError) -> Self {
        Self::Backend(err)
    }
}

//----------- Serial arithmetic ------------------------------------------------

/// RFC 1982 serial comparison: is `a` ahead of `b`?
pub fn serial_gt(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000_0000
}

//----------- TransferParser ---------------------------------------------------

/// One IXFR diff segment: the deletes after SOA(old), the adds after
/// SOA(new).
#[derive(Clone, Debug, Default)]
pub struct DiffSegment {
    pub deletes: Vec<Record>,
    pub adds: Vec<Record>,
}

/// What a completed stream amounts to.
#[derive(Debug)]
pub enum TransferPayload {
    /// The master's serial is not ahead of ours.
    UpToDate,
    /// A single SOA ahead of ours: the master keeps no history, reconnect
    /// with AXFR.
    FallbackToAxfr,
    /// A full zone body.
    Full {
        soa: Soa,
        soa_ttl: u32,
        records: Vec<Record>,
    },
    /// Incremental diff segments.
    Diff {
        soa: Soa,
        soa_ttl: u32,
        segments: Vec<DiffSegment>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParseState {
    /// Nothing seen yet; the first record must be the SOA.
    Start,
    /// One SOA seen; full body, diff segments or end-of-stream may follow.
    AfterFirstSoa,
    FullBody,
    SegmentDeletes,
    SegmentAdds,
}

/// The streaming transfer parser.
///
/// Feed it every answer record as frames arrive; `is_done` flips once the
/// terminating SOA is recognized, and `finish` renders the verdict (which
/// for a stream that ended after a lone SOA depends on the serial).
#[derive(Debug)]
pub struct TransferParser {
    local_serial: u32,
    state: ParseState,
    soa: Option<(Soa, u32)>,
    records: Vec<Record>,
    segments: Vec<DiffSegment>,
    done: bool,
}

impl TransferParser {
    pub fn new(local_serial: u32) -> Self {
        Self {
            local_serial,
            state: ParseState::Start,
            soa: None,
            records: Vec::new(),
            segments: Vec::new(),
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn new_serial(&self) -> u32 {
        self.soa.as_ref().map(|(soa, _)| soa.serial).unwrap_or(0)
    }

    pub fn feed(&mut self, record: Record) -> Result<(), TransferError> {
        if self.done {
            return Err(TransferError::Protocol("record after terminating SOA"));
        }
        let soa_serial = match &record.rdata {
            Rdata::Soa(soa) => Some(soa.serial),
            _ => None,
        };

        match (self.state, soa_serial) {
            (ParseState::Start, Some(_)) => {
                let Rdata::Soa(soa) = record.rdata else {
                    unreachable!("checked above");
                };
                self.soa = Some((soa, record.ttl));
                self.state = ParseState::AfterFirstSoa;
            }
            (ParseState::Start, None) => {
                return Err(TransferError::Protocol("stream does not start with SOA"));
            }

            (ParseState::AfterFirstSoa, Some(serial)) => {
                if serial == self.new_serial() {
                    // SOA(n) SOA(n): an empty full zone.
                    self.done = true;
                    self.state = ParseState::FullBody;
                } else {
                    // A diff segment opens with the old SOA.
                    self.segments.push(DiffSegment::default());
                    self.state = ParseState::SegmentDeletes;
                }
            }
            (ParseState::AfterFirstSoa, None) => {
                self.records.push(record);
                self.state = ParseState::FullBody;
            }

            (ParseState::FullBody, Some(serial)) => {
                if serial != self.new_serial() {
                    return Err(TransferError::Protocol("AXFR ends with wrong serial"));
                }
                self.done = true;
            }
            (ParseState::FullBody, None) => self.records.push(record),

            (ParseState::SegmentDeletes, Some(_)) => {
                // The new-side SOA flips the segment to adds.
                self.state = ParseState::SegmentAdds;
            }
            (ParseState::SegmentDeletes, None) => {
                self.segments
                    .last_mut()
                    .expect("segment opened before deletes")
                    .deletes
                    .push(record);
            }

            (ParseState::SegmentAdds, Some(serial)) => {
                if serial == self.new_serial() {
                    // A further segment can never open with the target
                    // serial; this is the end marker.
                    self.done = true;
                } else {
                    self.segments.push(DiffSegment::default());
                    self.state = ParseState::SegmentDeletes;
                }
            }
            (ParseState::SegmentAdds, None) => {
                self.segments
                    .last_mut()
                    .expect("segment opened before adds")
                    .adds
                    .push(record);
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Result<TransferPayload, TransferError> {
        let Some((soa, soa_ttl)) = self.soa else {
            return Err(TransferError::Protocol("empty transfer stream"));
        };
        if !self.done {
            if self.state == ParseState::AfterFirstSoa {
                // The stream ended after a lone SOA.
                return if serial_gt(soa.serial, self.local_serial) {
                    Ok(TransferPayload::FallbackToAxfr)
                } else {
                    Ok(TransferPayload::UpToDate)
                };
            }
            return Err(TransferError::Protocol("transfer stream truncated"));
        }
        if self.segments.is_empty() {
            Ok(TransferPayload::Full {
                soa,
                soa_ttl,
                records: self.records,
            })
        } else {
            Ok(TransferPayload::Diff {
                soa,
                soa_ttl,
                segments: self.segments,
            })
        }
    }
}

//----------- Applying transfers -----------------------------------------------

/// Convert a transferred record for storage.  SOAs and meta types never
/// land in the record table.
fn to_stored(record: &Record) -> Option<StoredRecord> {
    if record.rtype == Rtype::SOA || record.rtype.is_meta() {
        return None;
    }
    let aux = match &record.rdata {
        Rdata::Mx { preference, .. } => u32::from(*preference),
        Rdata::Srv { priority, .. } => u32::from(*priority),
        _ => 0,
    };
    Some(StoredRecord {
        name: record.owner.clone(),
        rtype: record.rtype,
        ttl: record.ttl,
        aux,
        rdata: record.rdata.clone(),
    })
}

fn insert_statement(zone_id: u32, record: &StoredRecord) -> String {
    db_sql::insert_rr(
        zone_id,
        &record.name,
        record.rtype,
        &rdata_text(&record.rdata),
        record.aux,
        record.ttl,
    )
}

/// Apply a full zone body: one backing-store transaction, then the atomic
/// in-memory swap.
pub fn apply_full(
    store: &Store,
    backend: &dyn Backend,
    zone: &ZoneMeta,
    soa: Soa,
    soa_ttl: u32,
    records: &[Record],
    now: u64,
) -> Result<usize, TransferError> {
    let stored: Vec<StoredRecord> = records.iter().filter_map(to_stored).collect();

    backend.begin()?;
    let result = (|| -> Result<(), BackendError> {
        backend.exec(&db_sql::delete_zone_rr(zone.zone_id))?;
        for record in &stored {
            backend.exec(&insert_statement(zone.zone_id, record))?;
        }
        backend.exec(&db_sql::update_serial(zone.zone_id, soa.serial))?;
        Ok(())
    })();
    if let Err(err) = result {
        let _ = backend.rollback();
        return Err(err.into());
    }
    backend.commit()?;

    let count = stored.len();
    store.replace_zone(zone.zone_id, soa, soa_ttl, stored, now)?;
    Ok(count)
}

/// Apply IXFR diff segments as one edit batch.
pub fn apply_diff(
    store: &Store,
    backend: &dyn Backend,
    zone: &ZoneMeta,
    soa: Soa,
    segments: &[DiffSegment],
    now: u64,
) -> Result<(usize, usize), TransferError> {
    let mut edits = Vec::new();
    let mut deleted = 0;
    let mut added = 0;
    for segment in segments {
        for record in &segment.deletes {
            if let Some(stored) = to_stored(record) {
                deleted += 1;
                edits.push(Edit::DeleteExact {
                    name: stored.name,
                    rtype: stored.rtype,
                    rdata: stored.rdata,
                });
            }
        }
        for record in &segment.adds {
            if let Some(stored) = to_stored(record) {
                added += 1;
                edits.push(Edit::Add(stored));
            }
        }
    }

    backend.begin()?;
    let result = (|| -> Result<(), BackendError> {
        for edit in &edits {
            let statement = match edit {
                Edit::Add(record) => insert_statement(zone.zone_id, record),
                Edit::DeleteExact { name, rtype, rdata } => {
                    db_sql::delete_rr_exact(zone.zone_id, name, *rtype, &rdata_text(rdata))
                }
                _ => unreachable!("diffs only add and delete exact records"),
            };
            backend.exec(&statement)?;
        }
        backend.exec(&db_sql::update_serial(zone.zone_id, soa.serial))?;
        Ok(())
    })();
    if let Err(err) = result {
        let _ = backend.rollback();
        return Err(err.into());
    }
    backend.commit()?;

    store.apply_edits(zone.zone_id, &edits, Some(soa.serial), now)?;
    Ok((deleted, added))
}

//----------- TransferClient ---------------------------------------------------

/// The outcome of a refresh attempt, for logging and scheduling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    UpToDate { serial: u32 },
    Axfr { serial: u32, records: usize },
    Ixfr { serial: u32, deleted: usize, added: usize },
}

/// The AXFR/IXFR client.
pub struct TransferClient {
    store: Store,
    backend: Arc<dyn Backend>,
    keyring: Arc<arc_swap::ArcSwap<Keyring>>,
    clock: Clock,
}

impl TransferClient {
    pub fn new(
        store: Store,
        backend: Arc<dyn Backend>,
        keyring: Arc<arc_swap::ArcSwap<Keyring>>,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            backend,
            keyring,
            clock,
        }
    }

    /// Probe the master's serial and transfer if it is ahead.
    pub async fn refresh_zone(
        &self,
        zone: &ZoneMeta,
        master: &MasterConfig,
    ) -> Result<TransferOutcome, TransferError> {
        let master_serial = self.probe_serial(zone, master).await?;
        if !serial_gt(master_serial, zone.soa.serial) {
            debug!(
                "zone '{}' is current (local {}, master {})",
                zone.origin, zone.soa.serial, master_serial
            );
            return Ok(TransferOutcome::UpToDate {
                serial: zone.soa.serial,
            });
        }

        info!(
            "zone '{}' behind master {} (local {}, master {})",
            zone.origin, master.host, zone.soa.serial, master_serial
        );

        let payload = self.transfer(zone, master, Rtype::IXFR).await?;
        let payload = match payload {
            TransferPayload::FallbackToAxfr => {
                debug!("master has no history for '{}'; falling back to AXFR", zone.origin);
                self.transfer(zone, master, Rtype::AXFR).await?
            }
            other => other,
        };

        let now = self.clock.now_unix();
        match payload {
            TransferPayload::UpToDate => Ok(TransferOutcome::UpToDate {
                serial: zone.soa.serial,
            }),
            TransferPayload::FallbackToAxfr => {
                Err(TransferError::Protocol("AXFR answered with a lone SOA"))
            }
            TransferPayload::Full {
                soa,
                soa_ttl,
                records,
            } => {
                let serial = soa.serial;
                let count =
                    apply_full(&self.store, &*self.backend, zone, soa, soa_ttl, &records, now)?;
                Ok(TransferOutcome::Axfr {
                    serial,
                    records: count,
                })
            }
            TransferPayload::Diff {
                soa,
                soa_ttl: _,
                segments,
            } => {
                let serial = soa.serial;
                let (deleted, added) =
                    apply_diff(&self.store, &*self.backend, zone, soa, &segments, now)?;
                Ok(TransferOutcome::Ixfr {
                    serial,
                    deleted,
                    added,
                })
            }
        }
    }

    /// A UDP SOA query against the master.
    async fn probe_serial(
        &self,
        zone: &ZoneMeta,
        master: &MasterConfig,
    ) -> Result<u32, TransferError> {
        let id: u16 = rand::random();
        let query = Message::query(id, zone.origin.clone(), Rtype::SOA);
        let wire = query.build(palisade_proto::message::UDP_PAYLOAD_LIMIT);

        let local = if master.host.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = tokio::net::UdpSocket::bind(local)
            .await
            .map_err(|e| TransferError::Network(e.to_string()))?;
        socket
            .send_to(&wire, (master.host, master.port))
            .await
            .map_err(|e| TransferError::Network(e.to_string()))?;

        let mut buf = vec![0u8; 1024];
        let (len, _) = tokio::time::timeout(
            crate::cache::UPSTREAM_TIMEOUT,
            socket.recv_from(&mut buf),
        )
        .await
        .map_err(|_| TransferError::Timeout)?
        .map_err(|e| TransferError::Network(e.to_string()))?;

        let message = Message::parse(&buf[..len])?;
        if message.header.id != id {
            return Err(TransferError::Protocol("SOA probe id mismatch"));
        }
        if message.header.rcode != Rcode::NOERROR {
            return Err(TransferError::Refused(message.header.rcode));
        }
        message
            .answers
            .iter()
            .find_map(|record| match &record.rdata {
                Rdata::Soa(soa) => Some(soa.serial),
                _ => None,
            })
            .ok_or(TransferError::Protocol("SOA probe answer has no SOA"))
    }

    /// Run one AXFR or IXFR exchange over TCP and parse the stream.
    async fn transfer(
        &self,
        zone: &ZoneMeta,
        master: &MasterConfig,
        qtype: Rtype,
    ) -> Result<TransferPayload, TransferError> {
        let id: u16 = rand::random();
        let mut query = Message::query(id, zone.origin.clone(), qtype);
        if qtype == Rtype::IXFR {
            // The client's current SOA rides in the authority section.
            query.authorities.push(Record::new(
                zone.origin.clone(),
                Rtype::SOA,
                zone.soa_ttl,
                Rdata::Soa(zone.soa.clone()),
            ));
        }
        let mut wire = query.build(TCP_PAYLOAD_LIMIT);

        let key = match &master.tsig_key {
            Some(key_name) => {
                let keyring = self.keyring.load();
                let key = keyring.get(key_name).ok_or(TransferError::Auth(TsigError::BadKey))?;
                Some(key)
            }
            None => None,
        };
        let mut last_mac = match &key {
            Some(key) => Some(
                tsig::sign(&mut wire, key, self.clock.now_unix(), None)
                    .map_err(TransferError::Parse)?,
            ),
            None => None,
        };

        let mut stream = TcpStream::connect((master.host, master.port))
            .await
            .map_err(|e| TransferError::Network(e.to_string()))?;

        let frame_len = (wire.len() as u16).to_be_bytes();
        stream
            .write_all(&frame_len)
            .await
            .map_err(|e| TransferError::Network(e.to_string()))?;
        stream
            .write_all(&wire)
            .await
            .map_err(|e| TransferError::Network(e.to_string()))?;

        let mut parser = TransferParser::new(zone.soa.serial);
        let mut any_signed = false;
        while !parser.is_done() {
            let frame = match read_frame(&mut stream).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break, // peer closed
                Err(err) => return Err(err),
            };

            if let Some(key) = &key {
                let keyring = {
                    let mut ring = Keyring::default();
                    ring.insert((**key).clone());
                    ring
                };
                match tsig::verify(
                    &frame,
                    &keyring,
                    self.clock.now_unix(),
                    last_mac.as_deref(),
                ) {
                    Ok(Some(verified)) => {
                        any_signed = true;
                        last_mac = Some(verified.mac);
                    }
                    Ok(None) => {} // unsigned envelope mid-stream
                    Err(err) => return Err(TransferError::Auth(err)),
                }
            }

            let message = Message::parse(&frame)?;
            if message.header.id != id {
                return Err(TransferError::Protocol("transfer response id mismatch"));
            }
            if message.header.rcode != Rcode::NOERROR {
                return Err(TransferError::Refused(message.header.rcode));
            }
            for record in message.answers {
                parser.feed(record)?;
                if parser.is_done() {
                    break;
                }
            }
        }

        if key.is_some() && !any_signed {
            return Err(TransferError::Auth(TsigError::BadSig));
        }
        parser.finish()
    }
}

impl fmt::Debug for TransferClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferClient").finish_non_exhaustive()
    }
}

/// Read one length-prefixed frame; `None` on clean EOF.
async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>, TransferError> {
    let mut len_buf = [0u8; 2];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(TransferError::Network(err.to_string())),
    }
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut frame = vec![0u8; len];
    stream
        .read_exact(&mut frame)
        .await
        .map_err(|e| TransferError::Network(e.to_string()))?;
    Ok(Some(frame))
}

//----------- NOTIFY -----------------------------------------------------------

/// Why a NOTIFY was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyError {
    /// The request shape is off: QDCOUNT != 1, QTYPE != SOA or class != IN.
    BadShape,
    /// No configured master covers the zone.
    UnknownZone,
    /// The packet came from an address that is not the zone's master.
    BadSource,
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BadShape => "malformed NOTIFY",
            Self::UnknownZone => "NOTIFY for an unconfigured zone",
            Self::BadSource => "NOTIFY from a non-master address",
        })
    }
}

/// Validate an incoming NOTIFY and name the zone it announces.
///
/// The caller has already matched the opcode; this checks the question
/// shape and that the source address is the configured master for the zone.
pub fn validate_notify(
    message: &Message,
    source: IpAddr,
    masters: &[MasterConfig],
) -> Result<Name, NotifyError> {
    let [question] = message.questions.as_slice() else {
        return Err(NotifyError::BadShape);
    };
    if question.qtype != Rtype::SOA || question.qclass != palisade_proto::Class::IN {
        return Err(NotifyError::BadShape);
    }

    let zone = &question.qname;
    let mut known = false;
    for master in masters {
        if master.zones.iter().any(|z| z == zone) {
            known = true;
            if master.host == source {
                return Ok(zone.clone());
            }
        }
    }
    if known {
        Err(NotifyError::BadSource)
    } else {
        Err(NotifyError::UnknownZone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn soa_record(origin: &str, serial: u32) -> Record {
        Record::new(
            name(origin),
            Rtype::SOA,
            3600,
            Rdata::Soa(Soa {
                mname: name(&format!("ns1.{origin}")),
                rname: name(&format!("hostmaster.{origin}")),
                serial,
                refresh: 7200,
                retry: 1800,
                expire: 1209600,
                minimum: 600,
            }),
        )
    }

    fn a_record(owner: &str, addr: &str) -> Record {
        Record::new(name(owner), Rtype::A, 300, Rdata::A(addr.parse().unwrap()))
    }

    #[test]
    fn serial_arithmetic_wraps() {
        assert!(serial_gt(2, 1));
        assert!(!serial_gt(1, 2));
        assert!(!serial_gt(5, 5));
        // Wrap-around: 1 is ahead of 0xFFFF_FFFF.
        assert!(serial_gt(1, 0xFFFF_FFFF));
        assert!(!serial_gt(0xFFFF_FFFF, 1));
    }

    #[test]
    fn axfr_stream_parses() {
        let mut parser = TransferParser::new(1);
        for record in [
            soa_record("example.com.", 7),
            a_record("www.example.com.", "192.0.2.1"),
            a_record("mail.example.com.", "192.0.2.25"),
            soa_record("example.com.", 7),
        ] {
            parser.feed(record).unwrap();
        }
        assert!(parser.is_done());
        match parser.finish().unwrap() {
            TransferPayload::Full { soa, records, .. } => {
                assert_eq!(soa.serial, 7);
                assert_eq!(records.len(), 2);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn lone_soa_is_fallback_or_up_to_date() {
        // Master ahead: fall back to AXFR.
        let mut parser = TransferParser::new(3);
        parser.feed(soa_record("example.com.", 9)).unwrap();
        assert!(!parser.is_done());
        assert!(matches!(
            parser.finish().unwrap(),
            TransferPayload::FallbackToAxfr
        ));

        // Master not ahead: nothing to do.
        let mut parser = TransferParser::new(9);
        parser.feed(soa_record("example.com.", 9)).unwrap();
        assert!(matches!(parser.finish().unwrap(), TransferPayload::UpToDate));
    }

    #[test]
    fn ixfr_diff_stream_parses() {
        // 3 -> 5 in two segments.
        let mut parser = TransferParser::new(3);
        for record in [
            soa_record("example.com.", 5),
            soa_record("example.com.", 3),
            a_record("old.example.com.", "192.0.2.1"),
            soa_record("example.com.", 4),
            a_record("new.example.com.", "192.0.2.2"),
            soa_record("example.com.", 4),
            soa_record("example.com.", 5),
            a_record("newer.example.com.", "192.0.2.3"),
            soa_record("example.com.", 5),
        ] {
            parser.feed(record).unwrap();
        }
        assert!(parser.is_done());
        match parser.finish().unwrap() {
            TransferPayload::Diff { soa, segments, .. } => {
                assert_eq!(soa.serial, 5);
                assert_eq!(segments.len(), 2);
                assert_eq!(segments[0].deletes.len(), 1);
                assert_eq!(segments[0].adds.len(), 1);
                assert_eq!(segments[1].deletes.len(), 0);
                assert_eq!(segments[1].adds.len(), 1);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let mut parser = TransferParser::new(1);
        parser.feed(soa_record("example.com.", 7)).unwrap();
        parser.feed(a_record("www.example.com.", "192.0.2.1")).unwrap();
        assert!(!parser.is_done());
        assert!(matches!(
            parser.finish(),
            Err(TransferError::Protocol(_))
        ));
    }

    #[test]
    fn stream_must_start_with_soa() {
        let mut parser = TransferParser::new(1);
        assert!(matches!(
            parser.feed(a_record("www.example.com.", "192.0.2.1")),
            Err(TransferError::Protocol(_))
        ));
    }

    #[test]
    fn notify_validation() {
        let masters = vec![MasterConfig {
            name: "primary".into(),
            host: "198.51.100.1".parse().unwrap(),
            port: 53,
            tsig_key: None,
            zones: vec![name("example.com.")],
        }];

        let notify = Message::query(1, name("example.com."), Rtype::SOA);
        assert_eq!(
            validate_notify(&notify, "198.51.100.1".parse().unwrap(), &masters),
            Ok(name("example.com."))
        );
        assert_eq!(
            validate_notify(&notify, "203.0.113.9".parse().unwrap(), &masters),
            Err(NotifyError::BadSource)
        );

        let other = Message::query(1, name("other.com."), Rtype::SOA);
        assert_eq!(
            validate_notify(&other, "198.51.100.1".parse().unwrap(), &masters),
            Err(NotifyError::UnknownZone)
        );

        let wrong_type = Message::query(1, name("example.com."), Rtype::A);
        assert_eq!(
            validate_notify(&wrong_type, "198.51.100.1".parse().unwrap(), &masters),
            Err(NotifyError::BadShape)
        );
    }
}
