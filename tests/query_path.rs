//! End-to-end query scenarios through the full request pipeline.

use std::net::IpAddr;
use std::sync::Arc;

use palisade::center;
use palisade::config::Config;
use palisade::db::{MemBackend, RecordRow, ZoneRow};
use palisade::server::{self, Transport};
use palisade::util::Clock;

use palisade_proto::message::UDP_PAYLOAD_LIMIT;
use palisade_proto::{Message, Name, Rcode, Rdata, Rtype};

fn name(s: &str) -> Name {
    s.parse().unwrap()
}

fn client() -> IpAddr {
    "203.0.113.50".parse().unwrap()
}

fn record(zone_id: u32, owner: &str, rtype: Rtype, ttl: u32, aux: u32, rdata: &str) -> RecordRow {
    RecordRow {
        zone_id,
        name: name(owner),
        rtype,
        ttl,
        aux,
        rdata: rdata.into(),
    }
}

/// `example.com.` with a handful of records, SOA minimum 600.
fn seeded_center() -> Arc<center::Center> {
    let backend = Arc::new(MemBackend::new());
    backend.push_zone(ZoneRow {
        id: 1,
        origin: name("example.com."),
        ns: name("ns1.example.com."),
        mbox: name("hostmaster.example.com."),
        serial: 2024010101,
        refresh: 7200,
        retry: 1800,
        expire: 1209600,
        minimum: 600,
        ttl: 3600,
        active: true,
        slave_mode: false,
        update_policy: Default::default(),
    });
    backend.push_record(record(1, "www.example.com.", Rtype::A, 300, 0, "192.0.2.1"));
    backend.push_record(record(
        1,
        "a.example.com.",
        Rtype::CNAME,
        300,
        0,
        "b.example.com.",
    ));
    backend.push_record(record(1, "b.example.com.", Rtype::A, 300, 0, "198.51.100.2"));

    let (center, _refresh_rx) = center::init(Config::default(), backend, Clock::fixed(0)).unwrap();
    center
}

async fn ask(center: &center::Center, query: &Message) -> Message {
    let raw = query.build(UDP_PAYLOAD_LIMIT);
    let response = server::handle_message(center, &raw, client(), Transport::Udp)
        .await
        .expect("queries always draw a response");
    Message::parse(&response).expect("responses are well-formed")
}

#[tokio::test]
async fn direct_a_lookup() {
    let center = seeded_center();
    let query = Message::query(0x1234, name("www.example.com."), Rtype::A);
    let response = ask(&center, &query).await;

    assert_eq!(response.header.id, 0x1234);
    assert!(response.header.qr);
    assert!(response.header.aa);
    assert_eq!(response.header.rcode, Rcode::NOERROR);
    assert_eq!(response.answers.len(), 1);

    let answer = &response.answers[0];
    assert_eq!(answer.ttl, 300);
    // RDATA on the wire: c0 00 02 01.
    assert_eq!(answer.rdata, Rdata::A("192.0.2.1".parse().unwrap()));
}

#[tokio::test]
async fn nxdomain_with_soa() {
    let center = seeded_center();
    let query = Message::query(0x2222, name("missing.example.com."), Rtype::A);
    let response = ask(&center, &query).await;

    assert_eq!(response.header.rcode, Rcode::NXDOMAIN);
    assert!(response.answers.is_empty());
    assert_eq!(response.authorities.len(), 1);

    let soa = &response.authorities[0];
    assert_eq!(soa.rtype, Rtype::SOA);
    assert_eq!(soa.ttl, 600); // min(soa ttl 3600, minimum 600)
    let Rdata::Soa(soa) = &soa.rdata else {
        panic!("expected SOA rdata");
    };
    assert_eq!(soa.serial, 2024010101);
}

#[tokio::test]
async fn cname_chase_orders_answers() {
    let center = seeded_center();
    let query = Message::query(0x3333, name("a.example.com."), Rtype::A);
    let response = ask(&center, &query).await;

    assert_eq!(response.header.rcode, Rcode::NOERROR);
    assert!(response.header.aa);
    assert_eq!(response.answers.len(), 2);
    assert_eq!(response.answers[0].rtype, Rtype::CNAME);
    assert_eq!(response.answers[0].owner, name("a.example.com."));
    assert_eq!(response.answers[1].rtype, Rtype::A);
    assert_eq!(
        response.answers[1].rdata,
        Rdata::A("198.51.100.2".parse().unwrap())
    );
}

#[tokio::test]
async fn case_insensitive_lookup_matches() {
    let center = seeded_center();
    let lower = ask(
        &center,
        &Message::query(1, name("www.example.com."), Rtype::A),
    )
    .await;
    let upper = ask(
        &center,
        &Message::query(2, name("WWW.EXAMPLE.COM."), Rtype::A),
    )
    .await;

    assert_eq!(lower.answers.len(), upper.answers.len());
    assert_eq!(lower.answers[0].rdata, upper.answers[0].rdata);
}

#[tokio::test]
async fn wire_round_trip_of_responses() {
    let center = seeded_center();
    let query = Message::query(0x4444, name("www.example.com."), Rtype::A);
    let raw = query.build(UDP_PAYLOAD_LIMIT);
    let response = server::handle_message(&center, &raw, client(), Transport::Udp)
        .await
        .unwrap();

    // Decode, re-encode, decode again: the normalized forms agree.
    let once = Message::parse(&response).unwrap();
    let rebuilt = once.build(UDP_PAYLOAD_LIMIT);
    let twice = Message::parse(&rebuilt).unwrap();
    assert_eq!(once, twice);
}
