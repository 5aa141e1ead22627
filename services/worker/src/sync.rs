//! Startup reconciliation of the interface against the record store.
//!
//! The reconciler:
//! - Lists device records (desired) and live peers (current)
//! - Removes live peers that have no record
//! - Adds every recorded peer (adds are idempotent)
//!
//! Per-peer failures are logged and counted; they never abort the pass.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use wgfleet_reconcile::{DesiredPeer, PeerPlan, ReconcileReport};

use crate::interface::InterfaceControl;
use crate::store::DeviceStore;

/// Converges the live peer table to the device records.
pub struct Reconciler {
    store: Arc<dyn DeviceStore>,
    interface: Arc<dyn InterfaceControl>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DeviceStore>, interface: Arc<dyn InterfaceControl>) -> Self {
        Self { store, interface }
    }

    /// Run one reconciliation pass.
    ///
    /// Fails only if the records or the live peers cannot be listed.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let devices = self
            .store
            .list(None)
            .await
            .context("failed to list devices")?;
        let peers = self
            .interface
            .list_peers()
            .await
            .context("failed to list peers")?;

        let plan = PeerPlan::compute(
            devices
                .iter()
                .map(|d| DesiredPeer::new(d.public_key.as_str(), d.address.as_str())),
            peers.iter().map(|p| p.public_key.as_str()),
        );
        debug!(
            records = plan.to_add.len(),
            live = peers.len(),
            orphans = plan.to_remove.len(),
            "Computed peer plan"
        );

        let mut report = ReconcileReport::for_plan(&plan);

        for public_key in &plan.to_remove {
            match self.interface.remove_peer(public_key).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(public_key = %public_key, error = %e, "Failed to remove peer during sync");
                }
            }
        }

        for peer in &plan.to_add {
            match self.interface.add_peer(&peer.public_key, &peer.address).await {
                Ok(()) => report.added += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        public_key = %peer.public_key,
                        address = %peer.address,
                        error = %e,
                        "Failed to add peer during sync"
                    );
                }
            }
        }

        info!(
            status = ?report.status,
            removed = report.removed,
            added = report.added,
            failed = report.failed,
            "Peer sync complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::MockInterface;
    use crate::store::MemoryDeviceStore;
    use wgfleet_events::Device;
    use wgfleet_networking::LivePeer;

    #[tokio::test]
    async fn test_fails_when_interface_unavailable() {
        let reconciler = Reconciler::new(
            Arc::new(MemoryDeviceStore::new()),
            Arc::new(MockInterface::failing()),
        );
        assert!(reconciler.reconcile().await.is_err());
    }

    #[tokio::test]
    async fn test_per_peer_failure_does_not_abort() {
        let store = Arc::new(MemoryDeviceStore::with_devices([
            Device::new("alice", "laptop", "A", "10.44.0.2/32"),
            Device::new("alice", "phone", "B", "10.44.0.3/32"),
        ]));
        let wg = Arc::new(MockInterface::with_peers([LivePeer::new("X")]));
        wg.fail_peer("A").await;

        let report = Reconciler::new(store, wg.clone()).reconcile().await.unwrap();

        assert_eq!(report.removed, 1);
        assert_eq!(report.added, 1);
        assert_eq!(report.failed, 1);
        assert!(!report.is_clean());
        assert_eq!(wg.peer_keys().await, vec!["B"]);
    }
}
