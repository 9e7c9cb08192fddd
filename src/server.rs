//! The request pipeline shared by every listener.
//!
//! UDP, TCP and DoH all funnel raw messages through [`handle_message`]:
//! decode, TSIG verification, opcode dispatch (query, NOTIFY, UPDATE),
//! response sizing and response signing.  Listener plumbing lives in the
//! units; policy lives here.

use std::net::IpAddr;

use tracing::{debug, trace, warn};

use palisade_proto::message::{TCP_PAYLOAD_LIMIT, UDP_PAYLOAD_LIMIT};
use palisade_proto::{Header, Message, Opcode, Rcode, Rdata, Rtype};

use crate::acl::{self, Target};
use crate::center::Center;
use crate::metrics::bump;
use crate::tsig::{self, TsigError};
use crate::xfr;

/// The largest UDP payload honored from client EDNS, matching the receive
/// buffers.
const MAX_UDP_PAYLOAD: usize = 4096;

/// How a message reached us; decides the response size ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
    Doh,
}

/// Process one raw message and produce the raw response.
///
/// `None` means drop silently (unparseable beyond salvage, or a NOTIFY
/// from a stranger that deserves no reflection).
pub async fn handle_message(
    center: &Center,
    raw: &[u8],
    client: IpAddr,
    transport: Transport,
) -> Option<Vec<u8>> {
    if raw.len() < 12 {
        trace!("dropping {}-octet runt from {client}", raw.len());
        return None;
    }

    let message = match Message::parse(raw) {
        Ok(message) => message,
        Err(err) => {
            debug!("malformed message from {client}: {err}");
            return Some(formerr_response(raw, transport));
        }
    };
    if message.header.qr {
        // A response aimed at a server port; nothing to say to it.
        return None;
    }

    // TSIG first: everything after this point may rely on the identity.
    let keyring = center.keyring.load();
    let verified = match tsig::verify(raw, &keyring, center.clock.now_unix(), None) {
        Ok(verified) => verified,
        Err(err) => {
            debug!("TSIG rejection for {client}: {err}");
            return Some(tsig_error_response(center, &message, raw, &err, transport));
        }
    };

    let mut response = match message.header.opcode {
        Opcode::QUERY => handle_query(center, &message, client).await,
        Opcode::NOTIFY => handle_notify(center, &message, client)?,
        Opcode::UPDATE => {
            // One update at a time: prerequisites and apply act on a
            // consistent snapshot.
            let _gate = center.update_gate.lock().await;
            center.updates.handle(&message, client, verified.as_ref())
        }
        other => {
            debug!("unimplemented opcode {other} from {client}");
            let mut response = Message::response_to(&message);
            response.header.rcode = Rcode::NOTIMP;
            response
        }
    };

    // Responses to signed requests are signed with the same key.
    let limit = response_limit(&message, transport);
    if let Some(verified) = &verified {
        // Leave room for the TSIG record itself.
        let mut wire = response.build(limit.saturating_sub(128));
        if let Err(err) = tsig::sign(
            &mut wire,
            &verified.key,
            center.clock.now_unix(),
            Some(&verified.mac),
        ) {
            warn!("cannot sign response for {client}: {err}");
            response = Message::response_to(&message);
            response.header.rcode = Rcode::SERVFAIL;
            return Some(response.build(limit));
        }
        return Some(wire);
    }
    Some(response.build(limit))
}

/// Route a QUERY to the authoritative or the recursive path.
async fn handle_query(center: &Center, message: &Message, client: IpAddr) -> Message {
    // Transfers are served by masters; this server only consumes them.
    if message
        .questions
        .first()
        .is_some_and(|q| matches!(q.qtype, Rtype::AXFR | Rtype::IXFR))
    {
        let mut response = Message::response_to(message);
        response.header.rcode = Rcode::REFUSED;
        return response;
    }

    let covered = message
        .questions
        .first()
        .is_some_and(|q| center.authority.covers(&q.qname));
    if covered {
        return center.authority.answer(message, client);
    }

    if let Some(recursor) = &center.recursor {
        if acl::evaluate(&center.store, Target::Cache, client, None, None).is_allowed() {
            return recursor.resolve(message).await;
        }
        debug!("recursion denied for {client}");
    }

    let mut response = Message::response_to(message);
    response.header.rcode = Rcode::REFUSED;
    response
}

/// Validate a NOTIFY and enqueue the refresh.  Returns `None` when the
/// packet should be dropped without a response.
fn handle_notify(center: &Center, message: &Message, client: IpAddr) -> Option<Message> {
    match xfr::validate_notify(message, client, &center.config.masters) {
        Ok(zone) => {
            bump(&center.metrics.notifies);
            debug!("NOTIFY for '{zone}' from {client}");
            if center.refresh_tx.try_send(zone.clone()).is_err() {
                warn!("refresh queue full; dropping NOTIFY for '{zone}'");
            }
            let mut response = Message::response_to(message);
            response.header.aa = true;
            Some(response)
        }
        Err(err) => {
            debug!("ignoring NOTIFY from {client}: {err}");
            None
        }
    }
}

/// The response size ceiling for this exchange.
fn response_limit(message: &Message, transport: Transport) -> usize {
    match transport {
        Transport::Tcp | Transport::Doh => TCP_PAYLOAD_LIMIT,
        Transport::Udp => match &message.edns {
            Some(edns) => {
                (edns.payload_size as usize).clamp(UDP_PAYLOAD_LIMIT, MAX_UDP_PAYLOAD)
            }
            None => UDP_PAYLOAD_LIMIT,
        },
    }
}

/// A FORMERR echoing whatever id the runt carried.
fn formerr_response(raw: &[u8], transport: Transport) -> Vec<u8> {
    let id = u16::from_be_bytes([raw[0], raw[1]]);
    let mut response = Message {
        header: Header {
            id,
            qr: true,
            rcode: Rcode::FORMERR,
            ..Header::default()
        },
        ..Message::default()
    };
    response.header.opcode = Opcode::from_int(raw[2] >> 3);
    match transport {
        Transport::Udp => response.build(UDP_PAYLOAD_LIMIT),
        _ => response.build(TCP_PAYLOAD_LIMIT),
    }
}

/// A TSIG rejection: NOTAUTH (or FORMERR) with the unsigned error TSIG
/// appended so the client learns which check failed.
fn tsig_error_response(
    center: &Center,
    message: &Message,
    _raw: &[u8],
    error: &TsigError,
    transport: Transport,
) -> Vec<u8> {
    let (rcode, extended) = error.rcodes();
    let mut response = Message::response_to(message);
    response.header.rcode = rcode;
    let limit = response_limit(message, transport);
    let mut wire = response.build(limit.saturating_sub(128));

    // Echo the request's TSIG variables when we can find them.
    let request_tsig = message.additionals.iter().rev().find_map(|record| {
        if let Rdata::Tsig(tsig) = &record.rdata {
            Some((record.owner.clone(), tsig.clone()))
        } else {
            None
        }
    });
    if let Some((key_name, request)) = request_tsig {
        let algorithm = request.algorithm.clone();
        if let Err(err) = tsig::append_error_tsig(
            &mut wire,
            &key_name,
            &algorithm,
            &request,
            extended,
            center.clock.now_unix(),
        ) {
            debug!("cannot append error TSIG: {err}");
        }
    }
    wire
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::center;
    use crate::config::Config;
    use crate::db::{MemBackend, ZoneRow};
    use crate::util::Clock;
    use palisade_proto::Name;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn client() -> IpAddr {
        "203.0.113.77".parse().unwrap()
    }

    fn test_center() -> Arc<Center> {
        let backend = Arc::new(MemBackend::new());
        backend.push_zone(ZoneRow {
            id: 1,
            origin: name("example.com."),
            ns: name("ns1.example.com."),
            mbox: name("hostmaster.example.com."),
            serial: 1,
            refresh: 7200,
            retry: 1800,
            expire: 1209600,
            minimum: 600,
            ttl: 3600,
            active: true,
            slave_mode: false,
            update_policy: Default::default(),
        });
        backend.push_record(crate::db::RecordRow {
            zone_id: 1,
            name: name("www.example.com."),
            rtype: Rtype::A,
            ttl: 300,
            aux: 0,
            rdata: "192.0.2.1".into(),
        });
        let (center, _rx) = center::init(Config::default(), backend, Clock::fixed(1000)).unwrap();
        center
    }

    #[tokio::test]
    async fn query_round_trip_over_the_pipeline() {
        let center = test_center();
        let query = Message::query(0x5151, name("www.example.com."), Rtype::A);
        let raw = query.build(UDP_PAYLOAD_LIMIT);

        let response = handle_message(&center, &raw, client(), Transport::Udp)
            .await
            .unwrap();
        let parsed = Message::parse(&response).unwrap();
        assert_eq!(parsed.header.id, 0x5151);
        assert!(parsed.header.aa);
        assert_eq!(parsed.answers.len(), 1);
    }

    #[tokio::test]
    async fn garbage_draws_formerr() {
        let center = test_center();
        let mut raw = vec![0u8; 16];
        raw[0] = 0xAB;
        raw[1] = 0xCD;
        raw[5] = 1; // one question that is not there
        let response = handle_message(&center, &raw, client(), Transport::Udp)
            .await
            .unwrap();
        let parsed = Message::parse(&response).unwrap();
        assert_eq!(parsed.header.id, 0xABCD);
        assert_eq!(parsed.header.rcode, Rcode::FORMERR);
    }

    #[tokio::test]
    async fn runts_and_responses_are_dropped() {
        let center = test_center();
        assert!(handle_message(&center, &[0; 4], client(), Transport::Udp)
            .await
            .is_none());

        let mut response = Message::query(1, name("www.example.com."), Rtype::A);
        response.header.qr = true;
        let raw = response.build(UDP_PAYLOAD_LIMIT);
        assert!(handle_message(&center, &raw, client(), Transport::Udp)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn uncovered_names_without_recursor_are_refused() {
        let center = test_center();
        let query = Message::query(9, name("www.elsewhere.org."), Rtype::A);
        let raw = query.build(UDP_PAYLOAD_LIMIT);
        let response = handle_message(&center, &raw, client(), Transport::Udp)
            .await
            .unwrap();
        let parsed = Message::parse(&response).unwrap();
        assert_eq!(parsed.header.rcode, Rcode::REFUSED);
    }

    #[tokio::test]
    async fn axfr_requests_are_refused() {
        let center = test_center();
        let query = Message::query(9, name("example.com."), Rtype::AXFR);
        let raw = query.build(TCP_PAYLOAD_LIMIT);
        let response = handle_message(&center, &raw, client(), Transport::Tcp)
            .await
            .unwrap();
        let parsed = Message::parse(&response).unwrap();
        assert_eq!(parsed.header.rcode, Rcode::REFUSED);
    }

    #[tokio::test]
    async fn bad_tsig_yields_notauth_with_error_tsig() {
        let center = test_center();
        let key = crate::tsig::Key::new(
            name("stranger."),
            crate::tsig::Algorithm::HmacSha256,
            b"not-in-the-keyring".to_vec(),
        );
        let mut raw = Message::query(3, name("www.example.com."), Rtype::A)
            .build(UDP_PAYLOAD_LIMIT);
        crate::tsig::sign(&mut raw, &key, 1000, None).unwrap();

        let response = handle_message(&center, &raw, client(), Transport::Udp)
            .await
            .unwrap();
        let parsed = Message::parse(&response).unwrap();
        assert_eq!(parsed.header.rcode, Rcode::NOTAUTH);
        // The error TSIG rides along, unsigned.
        let tsig = parsed
            .additionals
            .iter()
            .find(|r| r.rtype == Rtype::TSIG)
            .expect("error TSIG present");
        let Rdata::Tsig(tsig) = &tsig.rdata else {
            panic!("expected TSIG rdata");
        };
        assert_eq!(tsig.error, palisade_proto::TsigRcode::BADKEY.to_int());
        assert!(tsig.mac.is_empty());
    }

    #[test]
    fn response_limits() {
        let query = Message::query(1, name("x."), Rtype::A);
        assert_eq!(response_limit(&query, Transport::Udp), UDP_PAYLOAD_LIMIT);
        assert_eq!(response_limit(&query, Transport::Tcp), TCP_PAYLOAD_LIMIT);

        let mut with_edns = query.clone();
        with_edns.edns = Some(palisade_proto::Edns::new(1232, false));
        assert_eq!(response_limit(&with_edns, Transport::Udp), 1232);

        with_edns.edns = Some(palisade_proto::Edns::new(9000, false));
        assert_eq!(response_limit(&with_edns, Transport::Udp), MAX_UDP_PAYLOAD);
    }
}
