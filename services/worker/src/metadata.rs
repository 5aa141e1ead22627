//! Periodic write-back of live peer telemetry to the device records.
//!
//! Every tick, each live peer with an endpoint has its endpoint IP, transfer
//! counters and last handshake written onto the record holding its public
//! key. Only those fields are touched, and a peer without a record is
//! skipped, so a device deleted mid-tick stays deleted. A tick waits for all
//! of its writes before the next tick may start.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use wgfleet_networking::LivePeer;

use crate::interface::InterfaceControl;
use crate::store::{DeviceStore, StoreError, Telemetry};

/// Counters of one poll tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Records written back.
    pub updated: usize,

    /// Peers without an endpoint or without a record.
    pub skipped: usize,

    pub failed: usize,
}

enum PeerOutcome {
    Updated,
    Skipped,
    Failed,
}

/// Copies live telemetry into device records on an interval.
pub struct MetadataPoller {
    store: Arc<dyn DeviceStore>,
    interface: Arc<dyn InterfaceControl>,
    interval: Duration,
}

impl MetadataPoller {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        interface: Arc<dyn InterfaceControl>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            interface,
            interval,
        }
    }

    /// Poll until shutdown. A tick in progress is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting metadata poller"
        );

        let mut ticker = tokio::time::interval(self.interval);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.poll_once().await;
                    debug!(
                        updated = report.updated,
                        skipped = report.skipped,
                        failed = report.failed,
                        "Metadata poll complete"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Metadata poller shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one tick.
    pub async fn poll_once(&self) -> PollReport {
        let mut report = PollReport::default();

        let peers = match self.interface.list_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                error!(error = %e, "Error listing peers");
                return report;
            }
        };

        let mut tasks = JoinSet::new();
        for peer in peers {
            if peer.endpoint_ip().is_none() {
                report.skipped += 1;
                continue;
            }
            let store = Arc::clone(&self.store);
            tasks.spawn(async move { write_back(store.as_ref(), peer).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(PeerOutcome::Updated) => report.updated += 1,
                Ok(PeerOutcome::Skipped) => report.skipped += 1,
                Ok(PeerOutcome::Failed) => report.failed += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(error = %e, "Metadata task panicked");
                }
            }
        }

        report
    }
}

async fn write_back(store: &dyn DeviceStore, peer: LivePeer) -> PeerOutcome {
    let telemetry = Telemetry {
        endpoint: peer.endpoint_ip().unwrap_or_default(),
        receive_bytes: peer.rx_bytes,
        transmit_bytes: peer.tx_bytes,
        last_handshake_time: peer.last_handshake,
    };

    match store.update_telemetry(&peer.public_key, &telemetry).await {
        Ok(()) => PeerOutcome::Updated,
        Err(StoreError::NotFound(_)) => PeerOutcome::Skipped,
        Err(e) => {
            error!(public_key = %peer.public_key, error = %e, "Error saving device telemetry");
            PeerOutcome::Failed
        }
    }
}
