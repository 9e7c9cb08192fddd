//! The DNS-over-HTTPS listener.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace};

use crate::acl::{self, Target};
use crate::center::Center;
use crate::doh::{self, DohError, DNS_MESSAGE};
use crate::manager::{ApplicationCommand, Terminated};
use crate::server::{self, Transport};

/// TLS handshake deadline.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

/// Deadline for reading and answering one request.
const REQUEST_DEADLINE: Duration = Duration::from_secs(5);

//----------- DohServerUnit ----------------------------------------------------

/// The DoH listener unit.
pub struct DohServerUnit {
    pub center: Arc<Center>,
    pub listener: TcpListener,
    pub acceptor: TlsAcceptor,
}

impl DohServerUnit {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ApplicationCommand>,
    ) -> Result<(), Terminated> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("[DoH]: listening on {addr}/tls");
        }

        let center = self.center;
        let acceptor = self.acceptor;
        let listener = self.listener;
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        debug!("[DoH]: accept failed: {err}");
                        continue;
                    }
                };
                let center = center.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(&center, &acceptor, stream, peer.ip()).await
                    {
                        debug!("[DoH]: connection from {peer} ended: {err}");
                    }
                });
            }
        });

        loop {
            match cmd_rx.recv().await {
                Some(ApplicationCommand::Terminate) | None => {
                    debug!("[DoH]: terminating");
                    return Err(Terminated);
                }
                Some(other) => trace!("[DoH]: ignoring {other:?}"),
            }
        }
    }
}

async fn serve_connection(
    center: &Center,
    acceptor: &TlsAcceptor,
    stream: tokio::net::TcpStream,
    client: std::net::IpAddr,
) -> Result<(), String> {
    let tls = tokio::time::timeout(HANDSHAKE_DEADLINE, acceptor.accept(stream))
        .await
        .map_err(|_| "handshake deadline".to_string())?
        .map_err(|err| format!("handshake failed: {err}"))?;
    let mut stream = BufReader::new(tls);

    let result = tokio::time::timeout(REQUEST_DEADLINE, async {
        let request = doh::read_request(&mut stream).await?;

        if !acl::evaluate(&center.store, Target::Doh, client, None, None).is_allowed() {
            debug!("[DoH]: {client} denied by ACL");
            return Err(DohError::Forbidden);
        }

        let wire = doh::extract_query(&request, &center.config.doh.path)?;
        server::handle_message(center, &wire, client, Transport::Doh)
            .await
            .ok_or(DohError::BadRequest("not a DNS query"))
    })
    .await
    .map_err(|_| "request deadline".to_string())?;

    match result {
        Ok(response) => doh::write_response(&mut stream, 200, DNS_MESSAGE, &response)
            .await
            .map_err(|err| err.to_string()),
        Err(err) => {
            doh::write_response(&mut stream, err.status(), "text/plain", err.body().as_bytes())
                .await
                .map_err(|err| err.to_string())
        }
    }
}
