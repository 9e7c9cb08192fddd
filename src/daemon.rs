//! Functionality relating to daemon mode.
//!
//! The daemon binds its restricted ports while still privileged, then
//! optionally forks into the background and drops to the configured user
//! and group.  Sockets are collected in a [`SocketProvider`] that the units
//! draw from once the runtime is up.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener, UdpSocket};

use daemonbase::process::Process;

use crate::config::DaemonConfig;

/// Apply changes to the identity and access rights of the running process
/// in accordance with the provided settings.
pub fn daemonize(config: &DaemonConfig) -> Result<(), String> {
    let mut daemon_config = daemonbase::process::Config::default();

    if let Some((user, group)) = &config.identity {
        daemon_config = daemon_config
            .with_user(user)
            .map_err(|err| format!("invalid user name: {err}"))?
            .with_group(group)
            .map_err(|err| format!("invalid group name: {err}"))?;
    }

    if let Some(pid_file) = &config.pid_file {
        let path = pid_file.clone().into_std_path_buf();
        daemon_config = daemon_config.with_pid_file(daemonbase::config::ConfigPath::from(path));
    }

    let mut process = Process::from_config(daemon_config);

    if config.daemonize {
        tracing::debug!("becoming a daemon process");
        if process.setup_daemon(true).is_err() {
            return Err("failed to become a daemon process".to_string());
        }
    }

    if let Some((user, group)) = &config.identity {
        tracing::debug!("dropping privileges to {user}:{group}");
        if process.drop_privileges().is_err() {
            return Err("failed to drop privileges".to_string());
        }
    }

    Ok(())
}

//------------ SocketType ----------------------------------------------------

/// The type of a socket.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SocketType {
    Udp,
    Tcp,
}

impl std::fmt::Display for SocketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketType::Udp => f.write_str("UDP"),
            SocketType::Tcp => f.write_str("TCP"),
        }
    }
}

//------------ PreBindError --------------------------------------------------

/// An error occurred while attempting to pre-bind a socket address.
#[derive(Debug)]
pub struct PreBindError {
    socket_type: SocketType,
    socket_addr: SocketAddr,
    error: std::io::Error,
}

impl std::fmt::Display for PreBindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} could not be bound: {}",
            self.socket_type, self.socket_addr, self.error
        )
    }
}

impl std::error::Error for PreBindError {}

//------------ SocketProvider ------------------------------------------------

/// Sockets bound before privileges were dropped, waiting for their units.
#[derive(Debug, Default)]
pub struct SocketProvider {
    udp: BTreeMap<SocketAddr, UdpSocket>,
    tcp: BTreeMap<SocketAddr, TcpListener>,
}

impl SocketProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a UDP socket now; it is handed out later via [`Self::take_udp`].
    pub fn pre_bind_udp(&mut self, addr: SocketAddr) -> Result<(), PreBindError> {
        if self.udp.contains_key(&addr) {
            return Ok(());
        }
        let socket = UdpSocket::bind(addr).map_err(|error| PreBindError {
            socket_type: SocketType::Udp,
            socket_addr: addr,
            error,
        })?;
        self.udp.insert(addr, socket);
        Ok(())
    }

    /// Bind a TCP listener now.
    pub fn pre_bind_tcp(&mut self, addr: SocketAddr) -> Result<(), PreBindError> {
        if self.tcp.contains_key(&addr) {
            return Ok(());
        }
        let listener = TcpListener::bind(addr).map_err(|error| PreBindError {
            socket_type: SocketType::Tcp,
            socket_addr: addr,
            error,
        })?;
        self.tcp.insert(addr, listener);
        Ok(())
    }

    /// Take a bound UDP socket, converted for the async runtime.
    pub fn take_udp(&mut self, addr: &SocketAddr) -> Option<tokio::net::UdpSocket> {
        let socket = self.udp.remove(addr)?;
        socket.set_nonblocking(true).ok()?;
        tokio::net::UdpSocket::from_std(socket).ok()
    }

    /// Take a bound TCP listener, converted for the async runtime.
    pub fn take_tcp(&mut self, addr: &SocketAddr) -> Option<tokio::net::TcpListener> {
        let listener = self.tcp.remove(addr)?;
        listener.set_nonblocking(true).ok()?;
        tokio::net::TcpListener::from_std(listener).ok()
    }
}
