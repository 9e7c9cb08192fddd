//! The zone-transfer scheduler and workers.
//!
//! A periodic tick walks every slave zone with a configured master and
//! refreshes the ones that are due; NOTIFY pushes zones onto the refresh
//! queue out of band.  Failures back off exponentially, bounded by the
//! zone's SOA retry value, and after `max_retries` consecutive failures a
//! zone is benched until the next interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use palisade_proto::Name;

use crate::center::Center;
use crate::config::{MasterConfig, TransferSettings};
use crate::manager::{ApplicationCommand, Terminated};
use crate::metrics::bump;
use crate::store::ZoneMeta;
use crate::xfr::{TransferClient, TransferOutcome};

//----------- TransferUnit -----------------------------------------------------

/// Per-zone retry bookkeeping.
#[derive(Clone, Copy, Debug, Default)]
struct RetryState {
    consecutive_failures: u32,
    /// Unix time before which the zone is not retried.
    not_before: u64,
}

/// The transfer unit.
#[derive(Debug)]
pub struct TransferUnit {
    pub center: Arc<Center>,
    pub refresh_rx: mpsc::Receiver<Name>,
}

impl TransferUnit {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ApplicationCommand>,
    ) -> Result<(), Terminated> {
        let TransferUnit {
            center,
            mut refresh_rx,
        } = self;

        let settings = center.config.transfer;
        let client = TransferClient::new(
            center.store.clone(),
            center.backend.clone(),
            center.keyring.clone(),
            center.clock.clone(),
        );
        let mut retry: foldhash::HashMap<Name, RetryState> = Default::default();
        let mut tick = tokio::time::interval(Duration::from_secs(settings.interval.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            "[XF]: transfer scheduler running (interval {}s, timeout {}s)",
            settings.interval, settings.timeout
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    // The interval clears benches.
                    for state in retry.values_mut() {
                        if state.consecutive_failures >= settings.max_retries {
                            *state = RetryState::default();
                        }
                    }
                    for zone in center.store.zones() {
                        if !zone.active || !zone.slave_mode {
                            continue;
                        }
                        maybe_refresh(&center, &client, settings, &zone, &mut retry).await;
                    }
                }

                zone_name = refresh_rx.recv() => {
                    let Some(zone_name) = zone_name else { continue };
                    match center.store.find_zone(&zone_name) {
                        Some(zone) if zone.origin == zone_name => {
                            maybe_refresh(&center, &client, settings, &zone, &mut retry).await;
                        }
                        _ => debug!("[XF]: refresh request for unknown zone '{zone_name}'"),
                    }
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ApplicationCommand::RefreshZone(zone_name)) => {
                            if let Some(zone) = center.store.find_zone(&zone_name) {
                                maybe_refresh(&center, &client, settings, &zone, &mut retry)
                                    .await;
                            }
                        }
                        Some(ApplicationCommand::Terminate) | None => {
                            debug!("[XF]: terminating");
                            return Err(Terminated);
                        }
                        Some(other) => trace!("[XF]: ignoring {other:?}"),
                    }
                }
            }
        }
    }
}

/// Refresh one zone unless its backoff says otherwise.
async fn maybe_refresh(
    center: &Center,
    client: &TransferClient,
    settings: TransferSettings,
    zone: &ZoneMeta,
    retry: &mut foldhash::HashMap<Name, RetryState>,
) {
    let now = center.clock.now_unix();
    {
        let state = retry.entry(zone.origin.clone()).or_default();
        if state.consecutive_failures >= settings.max_retries {
            trace!("[XF]: '{}' benched until the next interval", zone.origin);
            return;
        }
        if now < state.not_before {
            return;
        }
    }

    let Some(master) = MasterConfig::for_zone(&center.config.masters, &zone.origin) else {
        trace!("[XF]: no master configured for '{}'", zone.origin);
        return;
    };

    let started = std::time::Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_secs(settings.timeout),
        client.refresh_zone(zone, master),
    )
    .await;

    match outcome {
        Ok(Ok(outcome)) => {
            retry.insert(zone.origin.clone(), RetryState::default());
            match outcome {
                TransferOutcome::UpToDate { .. } => {}
                TransferOutcome::Axfr { serial, records } => {
                    bump(&center.metrics.transfers);
                    info!(
                        "[XF]: zone '{}' AXFR complete: {records} records, \
                         serial {} -> {serial}, {}ms",
                        zone.origin,
                        zone.soa.serial,
                        started.elapsed().as_millis(),
                    );
                }
                TransferOutcome::Ixfr {
                    serial,
                    deleted,
                    added,
                } => {
                    bump(&center.metrics.transfers);
                    info!(
                        "[XF]: zone '{}' IXFR complete: -{deleted}/+{added} records, \
                         serial {} -> {serial}, {}ms",
                        zone.origin,
                        zone.soa.serial,
                        started.elapsed().as_millis(),
                    );
                }
            }
        }
        failure => {
            let reason = match failure {
                Ok(Err(err)) => err.to_string(),
                _ => "transfer deadline exceeded".to_string(),
            };
            bump(&center.metrics.transfer_failures);
            let state = retry.entry(zone.origin.clone()).or_default();
            state.consecutive_failures += 1;

            // Exponential backoff from retry_delay, bounded by the zone's
            // own SOA retry.
            let backoff = settings
                .retry_delay
                .saturating_mul(1 << (state.consecutive_failures - 1).min(16))
                .min(u64::from(zone.soa.retry.max(1)));
            state.not_before = now + backoff;

            if state.consecutive_failures >= settings.max_retries {
                warn!(
                    "[XF]: zone '{}' transfer failed ({reason}); giving up until \
                     the next interval after {} attempts",
                    zone.origin, state.consecutive_failures,
                );
            } else {
                warn!(
                    "[XF]: zone '{}' transfer failed ({reason}); retrying in {backoff}s",
                    zone.origin,
                );
            }
        }
    }
}
