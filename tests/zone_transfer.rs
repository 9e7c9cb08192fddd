//! Transfer scenarios against a scripted master.
//!
//! The fake master answers the UDP SOA probe and then serves a scripted
//! sequence of TCP frames, which lets these tests drive the whole client:
//! probe, IXFR, AXFR fallback, and the atomicity guarantee when the stream
//! goes bad halfway.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use palisade::config::MasterConfig;
use palisade::db::{MemBackend, ZoneRow};
use palisade::metrics::Metrics;
use palisade::store::{Store, StoreLimits, StoredRecord};
use palisade::tsig::Keyring;
use palisade::util::Clock;
use palisade::xfr::{TransferClient, TransferError, TransferOutcome};

use palisade_proto::message::{TCP_PAYLOAD_LIMIT, UDP_PAYLOAD_LIMIT};
use palisade_proto::{Message, Name, Rdata, Record, Rtype, Soa};

fn name(s: &str) -> Name {
    s.parse().unwrap()
}

fn soa(serial: u32) -> Soa {
    Soa {
        mname: name("ns1.example.com."),
        rname: name("hostmaster.example.com."),
        serial,
        refresh: 7200,
        retry: 1800,
        expire: 1209600,
        minimum: 600,
    }
}

fn soa_record(serial: u32) -> Record {
    Record::new(name("example.com."), Rtype::SOA, 3600, Rdata::Soa(soa(serial)))
}

fn a_record(owner: &str, addr: &str) -> Record {
    Record::new(name(owner), Rtype::A, 300, Rdata::A(addr.parse().unwrap()))
}

fn slave_store() -> (Store, Arc<MemBackend>) {
    let store = Store::create(StoreLimits::default(), Arc::new(Metrics::new()));
    store
        .add_zone(
            &ZoneRow {
                id: 1,
                origin: name("example.com."),
                ns: name("ns1.example.com."),
                mbox: name("hostmaster.example.com."),
                serial: 3,
                refresh: 7200,
                retry: 1800,
                expire: 1209600,
                minimum: 600,
                ttl: 3600,
                active: true,
                slave_mode: true,
                update_policy: Default::default(),
            },
            0,
        )
        .unwrap();
    store
        .add_rr(1, StoredRecord {
            name: name("old.example.com."),
            rtype: Rtype::A,
            ttl: 300,
            aux: 0,
            rdata: Rdata::A("192.0.2.100".parse().unwrap()),
        })
        .unwrap();
    (store, Arc::new(MemBackend::new()))
}

/// A frame to send in response to one TCP transfer connection: either the
/// answer records for one message, or raw garbage bytes.
enum Reply {
    Records(Vec<Record>),
    Garbage(Vec<u8>),
}

/// Start a fake master: answers SOA probes over UDP with `master_serial`,
/// and each TCP connection with the next scripted frame list.
async fn fake_master(
    master_serial: u32,
    scripts: Vec<Vec<Reply>>,
) -> (IpAddr, u16) {
    let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    let udp = tokio::net::UdpSocket::bind(addr).await.unwrap();

    // UDP SOA probe responder.
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let Ok((len, peer)) = udp.recv_from(&mut buf).await else {
                return;
            };
            let Ok(query) = Message::parse(&buf[..len]) else {
                continue;
            };
            let mut response = Message::response_to(&query);
            response.header.aa = true;
            response.answers.push(soa_record(master_serial));
            let _ = udp
                .send_to(&response.build(UDP_PAYLOAD_LIMIT), peer)
                .await;
        }
    });

    // TCP transfer responder: one script per connection.
    tokio::spawn(async move {
        for script in scripts {
            let Ok((mut stream, _)) = tcp.accept().await else {
                return;
            };
            // Read the query frame.
            let mut len_buf = [0u8; 2];
            if stream.read_exact(&mut len_buf).await.is_err() {
                continue;
            }
            let mut query = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            if stream.read_exact(&mut query).await.is_err() {
                continue;
            }
            let query = Message::parse(&query).unwrap();

            for reply in script {
                let frame = match reply {
                    Reply::Records(records) => {
                        let mut response = Message::response_to(&query);
                        response.header.aa = true;
                        response.answers = records;
                        response.build(TCP_PAYLOAD_LIMIT)
                    }
                    Reply::Garbage(bytes) => bytes,
                };
                let len = (frame.len() as u16).to_be_bytes();
                if stream.write_all(&len).await.is_err()
                    || stream.write_all(&frame).await.is_err()
                {
                    break;
                }
            }
            // Dropping the stream closes the connection.
        }
    });

    (addr.ip(), addr.port())
}

fn client_for(store: &Store, backend: &Arc<MemBackend>) -> TransferClient {
    TransferClient::new(
        store.clone(),
        backend.clone(),
        Arc::new(ArcSwap::from_pointee(Keyring::default())),
        Clock::fixed(1_700_000_000),
    )
}

fn master_at(ip: IpAddr, port: u16) -> MasterConfig {
    MasterConfig {
        name: "scripted".into(),
        host: ip,
        port,
        tsig_key: None,
        zones: vec![name("example.com.")],
    }
}

#[tokio::test]
async fn ixfr_answered_with_full_zone_applies() {
    let (store, backend) = slave_store();
    // The master answers the IXFR with a full AXFR-style body.
    let (ip, port) = fake_master(
        9,
        vec![vec![Reply::Records(vec![
            soa_record(9),
            a_record("www.example.com.", "192.0.2.1"),
            a_record("mail.example.com.", "192.0.2.25"),
            soa_record(9),
        ])]],
    )
    .await;

    let client = client_for(&store, &backend);
    let zone = store.get_zone(1).unwrap();
    let outcome = client.refresh_zone(&zone, &master_at(ip, port)).await.unwrap();

    assert_eq!(outcome, TransferOutcome::Axfr { serial: 9, records: 2 });
    assert_eq!(store.get_soa(1).unwrap().0.serial, 9);
    assert_eq!(store.query(1, &name("www.example.com."), Rtype::A).len(), 1);
    // The pre-transfer record is gone.
    assert!(store.query(1, &name("old.example.com."), Rtype::A).is_empty());
    // The backing store saw one delete-all, two inserts and a serial bump.
    let journal = backend.journal();
    assert!(journal[0].starts_with("DELETE FROM rr WHERE zone = 1"));
    assert_eq!(journal.len(), 4);
}

#[tokio::test]
async fn garbage_mid_stream_leaves_the_pre_image() {
    let (store, backend) = slave_store();
    let (ip, port) = fake_master(
        9,
        vec![vec![
            Reply::Records(vec![
                soa_record(9),
                a_record("r1.example.com.", "192.0.2.1"),
                a_record("r2.example.com.", "192.0.2.2"),
            ]),
            Reply::Garbage(vec![0xFF; 20]),
        ]],
    )
    .await;

    let client = client_for(&store, &backend);
    let zone = store.get_zone(1).unwrap();
    let result = client.refresh_zone(&zone, &master_at(ip, port)).await;

    assert!(matches!(
        result,
        Err(TransferError::Parse(_) | TransferError::Protocol(_))
    ));
    // Exactly the pre-transfer snapshot, everywhere.
    assert_eq!(store.get_soa(1).unwrap().0.serial, 3);
    assert_eq!(store.query(1, &name("old.example.com."), Rtype::A).len(), 1);
    assert!(store.query(1, &name("r1.example.com."), Rtype::A).is_empty());
    assert!(store.query(1, &name("r2.example.com."), Rtype::A).is_empty());
    // And the backing store never saw a committed statement.
    assert!(backend.journal().is_empty());
}

#[tokio::test]
async fn lone_soa_ixfr_falls_back_to_axfr() {
    let (store, backend) = slave_store();
    // First connection (IXFR): a lone SOA.  Second connection (AXFR): the
    // full zone.
    let (ip, port) = fake_master(
        9,
        vec![
            vec![Reply::Records(vec![soa_record(9)])],
            vec![Reply::Records(vec![
                soa_record(9),
                a_record("fresh.example.com.", "203.0.113.1"),
                soa_record(9),
            ])],
        ],
    )
    .await;

    let client = client_for(&store, &backend);
    let zone = store.get_zone(1).unwrap();
    let outcome = client.refresh_zone(&zone, &master_at(ip, port)).await.unwrap();

    assert_eq!(outcome, TransferOutcome::Axfr { serial: 9, records: 1 });
    assert_eq!(store.query(1, &name("fresh.example.com."), Rtype::A).len(), 1);
}

#[tokio::test]
async fn ixfr_diff_segments_apply() {
    let (store, backend) = slave_store();
    // 3 -> 9: delete old.example.com, add new.example.com.
    let (ip, port) = fake_master(
        9,
        vec![vec![Reply::Records(vec![
            soa_record(9),
            soa_record(3),
            a_record("old.example.com.", "192.0.2.100"),
            soa_record(9),
            a_record("new.example.com.", "203.0.113.5"),
            soa_record(9),
        ])]],
    )
    .await;

    let client = client_for(&store, &backend);
    let zone = store.get_zone(1).unwrap();
    let outcome = client.refresh_zone(&zone, &master_at(ip, port)).await.unwrap();

    assert_eq!(
        outcome,
        TransferOutcome::Ixfr {
            serial: 9,
            deleted: 1,
            added: 1
        }
    );
    assert!(store.query(1, &name("old.example.com."), Rtype::A).is_empty());
    assert_eq!(store.query(1, &name("new.example.com."), Rtype::A).len(), 1);
    assert_eq!(store.get_soa(1).unwrap().0.serial, 9);
}

#[tokio::test]
async fn current_zone_is_left_alone() {
    let (store, backend) = slave_store();
    // Master serial equals ours: the probe ends it.
    let (ip, port) = fake_master(3, vec![]).await;

    let client = client_for(&store, &backend);
    let zone = store.get_zone(1).unwrap();
    let outcome = client.refresh_zone(&zone, &master_at(ip, port)).await.unwrap();

    assert_eq!(outcome, TransferOutcome::UpToDate { serial: 3 });
    assert!(backend.journal().is_empty());
}
