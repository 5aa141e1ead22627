//! Reconciliation primitives for peer state.
//!
//! This library provides the pure half of the peer reconciliation loop:
//!
//! - **Desired state**: device records in the record store.
//! - **Current state**: peers configured on the live interface.
//! - **Convergence**: remove orphaned peers, (re-)add every recorded peer.
//!
//! # Invariants
//!
//! - Plans are deterministic given the same inputs
//! - A live peer without a record is always scheduled for removal
//! - Every record is always scheduled for addition (adds are idempotent)

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Convergence status of the peer set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Live peers already match the records.
    #[default]
    Converged,

    /// Applying the plan will change the live peer set.
    Converging,
}

impl ConvergenceStatus {
    /// Returns true if the peer set has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// A peer that should be present on the interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredPeer {
    /// Peer's public key (base64).
    pub public_key: String,

    /// Allowed address (`10.44.0.2/32`).
    pub address: String,
}

impl DesiredPeer {
    pub fn new(public_key: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            address: address.into(),
        }
    }
}

/// The actions one reconciliation pass performs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerPlan {
    /// Live peers with no matching record, in live order.
    pub to_remove: Vec<String>,

    /// Every recorded peer, in record order.
    pub to_add: Vec<DesiredPeer>,

    /// How many of `to_add` are already live.
    pub already_present: usize,
}

impl PeerPlan {
    /// Diff desired peers against live public keys.
    pub fn compute<'a, D, L>(desired: D, live: L) -> Self
    where
        D: IntoIterator<Item = DesiredPeer>,
        L: IntoIterator<Item = &'a str>,
    {
        let to_add: Vec<DesiredPeer> = desired.into_iter().collect();
        let wanted: HashSet<&str> = to_add.iter().map(|p| p.public_key.as_str()).collect();

        let mut live_keys = HashSet::new();
        let mut to_remove = Vec::new();
        for key in live {
            if !live_keys.insert(key) {
                continue;
            }
            if !wanted.contains(key) {
                to_remove.push(key.to_string());
            }
        }

        let already_present = to_add
            .iter()
            .filter(|p| live_keys.contains(p.public_key.as_str()))
            .count();

        Self {
            to_remove,
            to_add,
            already_present,
        }
    }

    /// Whether applying this plan would change the live peer set.
    pub fn status(&self) -> ConvergenceStatus {
        if self.to_remove.is_empty() && self.already_present == self.to_add.len() {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::Converging
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Status of the peer set before the pass was applied.
    pub status: ConvergenceStatus,

    pub removed: usize,
    pub added: usize,
    pub failed: usize,
}

impl ReconcileReport {
    /// Start a report for a pass that will apply `plan`.
    pub fn for_plan(plan: &PeerPlan) -> Self {
        Self {
            status: plan.status(),
            ..Self::default()
        }
    }

    /// Returns true if the pass found the live peers already converged.
    pub fn was_converged(&self) -> bool {
        self.status.is_converged()
    }

    /// Returns true if every interface call succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// A handshake younger than this means the device is connected.
///
/// WireGuard sends no keepalives by default, so a quiet device looks
/// disconnected once this window passes.
pub const CONNECTED_WINDOW: Duration = Duration::from_secs(3 * 60);

/// Whether a device with the given last handshake counts as connected at `now`.
pub fn is_connected(last_handshake: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    let Some(last_handshake) = last_handshake else {
        return false;
    };
    let window = chrono::Duration::seconds(CONNECTED_WINDOW.as_secs() as i64);
    last_handshake > now - window
}

/// Default metadata poll interval.
pub const DEFAULT_METADATA_INTERVAL: Duration = Duration::from_secs(20);

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(keys: &[&str]) -> Vec<DesiredPeer> {
        keys.iter()
            .enumerate()
            .map(|(i, k)| DesiredPeer::new(*k, format!("10.44.0.{}/32", i + 2)))
            .collect()
    }

    #[test]
    fn test_orphan_removed_record_kept() {
        let plan = PeerPlan::compute(desired(&["A"]), ["A", "B"]);

        assert_eq!(plan.to_remove, vec!["B".to_string()]);
        assert_eq!(plan.to_add.len(), 1);
        assert_eq!(plan.to_add[0].public_key, "A");
        assert_eq!(plan.already_present, 1);
        assert_eq!(plan.status(), ConvergenceStatus::Converging);
    }

    #[test]
    fn test_converged_plan() {
        let plan = PeerPlan::compute(desired(&["A", "B"]), ["B", "A"]);

        assert!(plan.to_remove.is_empty());
        assert_eq!(plan.to_add.len(), 2);
        assert!(plan.status().is_converged());
    }

    #[test]
    fn test_missing_peer_is_converging() {
        let plan = PeerPlan::compute(desired(&["A", "B"]), ["A"]);

        assert!(plan.to_remove.is_empty());
        assert_eq!(plan.already_present, 1);
        assert!(!plan.status().is_converged());
    }

    #[test]
    fn test_empty_inputs() {
        let plan = PeerPlan::compute(Vec::<DesiredPeer>::new(), std::iter::empty::<&str>());
        assert_eq!(plan, PeerPlan::default());
        assert!(plan.status().is_converged());
    }

    #[test]
    fn test_duplicate_live_keys_removed_once() {
        let plan = PeerPlan::compute(Vec::<DesiredPeer>::new(), ["X", "X"]);
        assert_eq!(plan.to_remove, vec!["X".to_string()]);
    }

    #[test]
    fn test_is_connected() {
        let now = Utc::now();

        assert!(!is_connected(None, now));
        assert!(is_connected(Some(now - chrono::Duration::seconds(30)), now));
        assert!(is_connected(Some(now - chrono::Duration::seconds(179)), now));
        assert!(!is_connected(Some(now - chrono::Duration::seconds(180)), now));
        assert!(!is_connected(Some(now - chrono::Duration::minutes(10)), now));
    }

    #[test]
    fn test_report_for_plan_carries_status() {
        let converging = PeerPlan::compute(desired(&["A"]), ["B"]);
        let report = ReconcileReport::for_plan(&converging);
        assert_eq!(report.status, ConvergenceStatus::Converging);
        assert!(!report.was_converged());
        assert_eq!((report.removed, report.added, report.failed), (0, 0, 0));

        let converged = PeerPlan::compute(desired(&["A"]), ["A"]);
        assert!(ReconcileReport::for_plan(&converged).was_converged());
    }

    #[test]
    fn test_report_is_clean() {
        let mut report = ReconcileReport::default();
        assert!(report.is_clean());
        report.failed = 1;
        assert!(!report.is_clean());
    }
}
