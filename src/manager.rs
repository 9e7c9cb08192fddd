//! Spawning and steering the units.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use palisade_proto::Name;

use crate::center::{self, Center};
use crate::daemon::SocketProvider;
use crate::doh;
use crate::units::dns_server::DnsServerUnit;
use crate::units::doh_server::DohServerUnit;
use crate::units::transfer::TransferUnit;

/// How often the ACL pool and TSIG keyring are reloaded from the backing
/// store.
const ACL_RELOAD_SECS: u64 = 300;

//----------- Commands ---------------------------------------------------------

/// A control message to a unit.
#[derive(Clone, Debug)]
pub enum ApplicationCommand {
    /// Shut the unit down.
    Terminate,
    /// Reload the ACL pool and keyring now.
    ReloadAcl,
    /// Refresh one zone out of schedule.
    RefreshZone(Name),
}

/// A unit ended; either commanded or because its work is impossible.
#[derive(Clone, Copy, Debug)]
pub struct Terminated;

/// The handles the manager keeps per unit.
pub type UnitHandles = Vec<(String, mpsc::UnboundedSender<ApplicationCommand>)>;

//----------- Spawning ---------------------------------------------------------

/// Spawn every unit.  Sockets come out of the provider; missing sockets are
/// a startup failure.
pub fn spawn(
    center: &Arc<Center>,
    refresh_rx: mpsc::Receiver<Name>,
    socket_provider: &mut SocketProvider,
    unit_txs: &mut UnitHandles,
) -> Result<(), String> {
    // Plain DNS on every configured listen address.
    let mut udp = Vec::new();
    let mut tcp = Vec::new();
    for addr in &center.config.listen {
        udp.push(
            socket_provider
                .take_udp(addr)
                .ok_or_else(|| format!("UDP socket for {addr} was not bound"))?,
        );
        tcp.push(
            socket_provider
                .take_tcp(addr)
                .ok_or_else(|| format!("TCP socket for {addr} was not bound"))?,
        );
    }
    let (dns_tx, dns_rx) = mpsc::unbounded_channel();
    let dns_unit = DnsServerUnit {
        center: center.clone(),
        udp,
        tcp,
    };
    tokio::spawn(async move {
        let _ = dns_unit.run(dns_rx).await;
    });
    unit_txs.push(("DS".into(), dns_tx));

    // The transfer scheduler.
    let (xfr_tx, xfr_rx) = mpsc::unbounded_channel();
    let transfer_unit = TransferUnit {
        center: center.clone(),
        refresh_rx,
    };
    tokio::spawn(async move {
        let _ = transfer_unit.run(xfr_rx).await;
    });
    unit_txs.push(("XF".into(), xfr_tx));

    // DoH, when configured.
    if center.config.doh.enabled {
        let doh_addr = std::net::SocketAddr::new(
            "0.0.0.0".parse().unwrap(),
            center.config.doh.port,
        );
        let listener = socket_provider
            .take_tcp(&doh_addr)
            .ok_or_else(|| format!("TCP socket for {doh_addr} was not bound"))?;
        let acceptor = doh::tls_acceptor(&center.config.doh.cert, &center.config.doh.key)?;
        let (doh_tx, doh_rx) = mpsc::unbounded_channel();
        let doh_unit = DohServerUnit {
            center: center.clone(),
            listener,
            acceptor,
        };
        tokio::spawn(async move {
            let _ = doh_unit.run(doh_rx).await;
        });
        unit_txs.push(("DoH".into(), doh_tx));
    }

    spawn_reload_task(center.clone());
    if center.recursor.is_some() {
        spawn_cache_sweep(center.clone());
    }
    Ok(())
}

/// Periodically drop expired cache entries.
fn spawn_cache_sweep(center: Arc<Center>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let Some(recursor) = &center.recursor else {
                return;
            };
            let removed = recursor.cache().sweep(center.clock.now_unix());
            if removed > 0 {
                debug!("cache sweep removed {removed} expired entries");
            }
        }
    });
}

/// Periodic ACL/keyring reload, plus SIGHUP for an immediate one.
fn spawn_reload_task(center: Arc<Center>) {
    tokio::spawn(async move {
        let mut tick =
            tokio::time::interval(std::time::Duration::from_secs(ACL_RELOAD_SECS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately and would reload right after
        // startup; skip it.
        tick.tick().await;

        #[cfg(unix)]
        let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(hup) => hup,
            Err(err) => {
                error!("cannot listen for SIGHUP: {err}");
                return;
            }
        };

        loop {
            #[cfg(unix)]
            tokio::select! {
                _ = tick.tick() => {
                    debug!("periodic ACL reload");
                    center::reload_acl(&center);
                }
                _ = hup.recv() => {
                    info!("SIGHUP received; reloading ACL rules and TSIG keys");
                    center::reload_acl(&center);
                }
            }
            #[cfg(not(unix))]
            {
                tick.tick().await;
                center::reload_acl(&center);
            }
        }
    });
}

/// Tell every unit to stop.
pub fn terminate(unit_txs: &UnitHandles) {
    for (name, tx) in unit_txs {
        if tx.send(ApplicationCommand::Terminate).is_err() {
            warn!("unit {name} was already gone at shutdown");
        }
    }
}
