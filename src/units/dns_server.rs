//! The UDP/53 and TCP/53 listeners.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::center::Center;
use crate::manager::{ApplicationCommand, Terminated};
use crate::server::{self, Transport};

/// Per-request processing deadline.
const REQUEST_DEADLINE: Duration = Duration::from_secs(5);

/// How long a TCP connection may sit idle between requests.
const TCP_IDLE: Duration = Duration::from_secs(30);

/// The UDP receive buffer; also the ceiling honored from client EDNS.
const UDP_RECV_SIZE: usize = 4096;

//----------- DnsServerUnit ----------------------------------------------------

/// The plain-DNS listener unit.
#[derive(Debug)]
pub struct DnsServerUnit {
    pub center: Arc<Center>,
    pub udp: Vec<UdpSocket>,
    pub tcp: Vec<TcpListener>,
}

impl DnsServerUnit {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ApplicationCommand>,
    ) -> Result<(), Terminated> {
        for socket in &self.udp {
            if let Ok(addr) = socket.local_addr() {
                info!("[DS]: listening on {addr}/udp");
            }
        }
        for listener in &self.tcp {
            if let Ok(addr) = listener.local_addr() {
                info!("[DS]: listening on {addr}/tcp");
            }
        }

        for socket in self.udp {
            tokio::spawn(udp_loop(self.center.clone(), Arc::new(socket)));
        }
        for listener in self.tcp {
            tokio::spawn(tcp_loop(self.center.clone(), listener));
        }

        // The loops run detached; this task just waits for shutdown.
        loop {
            match cmd_rx.recv().await {
                Some(ApplicationCommand::Terminate) | None => {
                    debug!("[DS]: terminating");
                    return Err(Terminated);
                }
                Some(other) => trace!("[DS]: ignoring {other:?}"),
            }
        }
    }
}

async fn udp_loop(center: Arc<Center>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; UDP_RECV_SIZE];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!("[DS]: UDP receive failed: {err}");
                continue;
            }
        };
        let raw = buf[..len].to_vec();
        let center = center.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            let response = tokio::time::timeout(
                REQUEST_DEADLINE,
                server::handle_message(&center, &raw, peer.ip(), Transport::Udp),
            )
            .await;
            match response {
                Ok(Some(response)) => {
                    if let Err(err) = socket.send_to(&response, peer).await {
                        debug!("[DS]: cannot answer {peer}: {err}");
                    }
                }
                Ok(None) => {}
                Err(_) => debug!("[DS]: request from {peer} hit the deadline"),
            }
        });
    }
}

async fn tcp_loop(center: Arc<Center>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("[DS]: TCP accept failed: {err}");
                continue;
            }
        };
        let center = center.clone();
        tokio::spawn(async move {
            if let Err(err) = tcp_connection(&center, stream, peer).await {
                debug!("[DS]: connection from {peer} ended: {err}");
            }
        });
    }
}

/// Serve length-prefixed requests on one connection until EOF or idle
/// timeout.
async fn tcp_connection(
    center: &Center,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), String> {
    loop {
        let mut len_buf = [0u8; 2];
        match tokio::time::timeout(TCP_IDLE, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(err)) => return Err(err.to_string()),
            Err(_) => return Ok(()), // idle
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut raw = vec![0u8; len];
        stream
            .read_exact(&mut raw)
            .await
            .map_err(|err| err.to_string())?;

        let response = tokio::time::timeout(
            REQUEST_DEADLINE,
            server::handle_message(center, &raw, peer.ip(), Transport::Tcp),
        )
        .await
        .map_err(|_| "request deadline exceeded".to_string())?;

        if let Some(response) = response {
            if response.len() > u16::MAX as usize {
                error!("[DS]: oversized TCP response suppressed for {peer}");
                continue;
            }
            let frame_len = (response.len() as u16).to_be_bytes();
            stream
                .write_all(&frame_len)
                .await
                .map_err(|err| err.to_string())?;
            stream
                .write_all(&response)
                .await
                .map_err(|err| err.to_string())?;
        }
    }
}
