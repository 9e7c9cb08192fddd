//! Dynamic update scenarios through the full request pipeline.

use std::net::IpAddr;
use std::sync::Arc;

use palisade::center;
use palisade::config::Config;
use palisade::db::{MemBackend, RecordRow, TsigKeyRow, UpdatePolicy, ZoneRow};
use palisade::server::{self, Transport};
use palisade::tsig;
use palisade::util::Clock;

use palisade_proto::message::UDP_PAYLOAD_LIMIT;
use palisade_proto::{
    Class, Header, Message, Name, Opcode, Question, Rcode, Rdata, Record, Rtype,
};

fn name(s: &str) -> Name {
    s.parse().unwrap()
}

fn client() -> IpAddr {
    "203.0.113.60".parse().unwrap()
}

fn seeded_center(policy: UpdatePolicy) -> Arc<center::Center> {
    let backend = Arc::new(MemBackend::new());
    backend.push_zone(ZoneRow {
        id: 1,
        origin: name("example.com."),
        ns: name("ns1.example.com."),
        mbox: name("hostmaster.example.com."),
        serial: 500,
        refresh: 7200,
        retry: 1800,
        expire: 1209600,
        minimum: 600,
        ttl: 3600,
        active: true,
        slave_mode: false,
        update_policy: policy,
    });
    backend.push_record(RecordRow {
        zone_id: 1,
        name: name("host.example.com."),
        rtype: Rtype::A,
        ttl: 120,
        aux: 0,
        rdata: "10.0.0.1".into(),
    });
    backend.push_tsig_key(TsigKeyRow {
        name: name("update-key."),
        algorithm: "hmac-sha256".into(),
        secret: "dXBkYXRlLXNlY3JldC11cGRhdGUtc2VjcmV0".into(),
    });

    let (center, _refresh_rx) =
        center::init(Config::default(), backend, Clock::fixed(1_700_000_000)).unwrap();
    center
}

fn update_message() -> Message {
    Message {
        header: Header {
            id: 0x9090,
            opcode: Opcode::UPDATE,
            ..Header::default()
        },
        questions: vec![Question {
            qname: name("example.com."),
            qtype: Rtype::SOA,
            qclass: Class::IN,
        }],
        ..Message::default()
    }
}

async fn send(center: &center::Center, raw: &[u8]) -> Message {
    let response = server::handle_message(center, raw, client(), Transport::Udp)
        .await
        .expect("updates always draw a response");
    Message::parse(&response).expect("responses are well-formed")
}

#[tokio::test]
async fn prereq_nxrrset_fails_with_yxrrset_and_no_mutation() {
    let center = seeded_center(UpdatePolicy::open());

    // Prerequisite: "A RRset at host.example.com. does not exist" (it
    // does), plus an add that must therefore not happen.
    let mut message = update_message();
    message.answers.push(Record {
        owner: name("host.example.com."),
        rtype: Rtype::A,
        class: Class::NONE,
        ttl: 0,
        rdata: Rdata::Other(bytes::Bytes::new()),
    });
    message.authorities.push(Record::new(
        name("host.example.com."),
        Rtype::A,
        300,
        Rdata::A("10.0.0.2".parse().unwrap()),
    ));

    let response = send(&center, &message.build(UDP_PAYLOAD_LIMIT)).await;
    assert_eq!(response.header.id, 0x9090);
    assert_eq!(response.header.rcode, Rcode::YXRRSET);

    // No mutation and no serial bump.
    let found = center.store.query(1, &name("host.example.com."), Rtype::A);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].rdata, Rdata::A("10.0.0.1".parse().unwrap()));
    assert_eq!(center.store.get_soa(1).unwrap().0.serial, 500);
}

#[tokio::test]
async fn successful_add_bumps_the_serial() {
    let center = seeded_center(UpdatePolicy::open());

    let mut message = update_message();
    message.authorities.push(Record::new(
        name("added.example.com."),
        Rtype::A,
        300,
        Rdata::A("10.0.0.9".parse().unwrap()),
    ));

    let response = send(&center, &message.build(UDP_PAYLOAD_LIMIT)).await;
    assert_eq!(response.header.rcode, Rcode::NOERROR);
    assert_eq!(center.store.get_soa(1).unwrap().0.serial, 501);
    assert_eq!(
        center.store.query(1, &name("added.example.com."), Rtype::A).len(),
        1
    );
}

#[tokio::test]
async fn keyed_zone_accepts_only_its_key() {
    let policy = UpdatePolicy {
        tsig_key: Some(name("update-key.")),
        ..UpdatePolicy::open()
    };
    let center = seeded_center(policy);

    let mut message = update_message();
    message.authorities.push(Record::new(
        name("signed.example.com."),
        Rtype::A,
        300,
        Rdata::A("10.0.0.7".parse().unwrap()),
    ));
    let raw = message.build(UDP_PAYLOAD_LIMIT);

    // Unsigned: refused with NOTAUTH.
    let response = send(&center, &raw).await;
    assert_eq!(response.header.rcode, Rcode::NOTAUTH);

    // Signed with the configured key: applied, and the response verifies
    // under the request MAC.
    let key = tsig::Key::new(
        name("update-key."),
        tsig::Algorithm::HmacSha256,
        b"update-secret-update-secret".to_vec(),
    );
    let mut signed = raw.clone();
    let mac = tsig::sign(&mut signed, &key, 1_700_000_000, None).unwrap();
    let raw_response = server::handle_message(&center, &signed, client(), Transport::Udp)
        .await
        .unwrap();

    let parsed = Message::parse(&raw_response).unwrap();
    assert_eq!(parsed.header.rcode, Rcode::NOERROR);
    assert_eq!(
        center.store.query(1, &name("signed.example.com."), Rtype::A).len(),
        1
    );

    let mut ring = tsig::Keyring::default();
    ring.insert(key);
    let verified = tsig::verify(&raw_response, &ring, 1_700_000_000, Some(&mac))
        .unwrap()
        .expect("response is signed");
    assert_eq!(verified.key_name, name("update-key."));
}
