//! WireGuard interface control.
//!
//! The [`InterfaceControl`] trait abstracts the live peer table:
//! - Adding and removing peers
//! - Listing peers with their telemetry
//! - Reading the interface's own public key
//!
//! A mock implementation is provided for testing and development.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info};
use wgfleet_networking::LivePeer;

/// Errors from interface operations.
#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("command execution failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse interface dump: {0}")]
    Parse(String),

    #[error("interface unavailable: {0}")]
    Unavailable(String),
}

/// Control over the live WireGuard peer table.
#[async_trait]
pub trait InterfaceControl: Send + Sync {
    /// Configure a peer. Adding an existing peer updates its allowed address.
    async fn add_peer(&self, public_key: &str, address: &str) -> Result<(), InterfaceError>;

    /// Remove a peer. Removing an absent peer is not an error.
    async fn remove_peer(&self, public_key: &str) -> Result<(), InterfaceError>;

    async fn list_peers(&self) -> Result<Vec<LivePeer>, InterfaceError>;

    /// The interface's own public key.
    async fn public_key(&self) -> Result<String, InterfaceError>;
}

// =============================================================================
// wg CLI
// =============================================================================

/// Drives a kernel interface through the `wg` command line tool.
#[derive(Debug, Clone)]
pub struct WgCommandInterface {
    interface: String,
}

impl WgCommandInterface {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    async fn run_wg(&self, args: &[&str]) -> Result<String, InterfaceError> {
        let output = Command::new("wg").args(args).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InterfaceError::CommandFailed {
                command: format!("wg {}", args.join(" ")),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl InterfaceControl for WgCommandInterface {
    async fn add_peer(&self, public_key: &str, address: &str) -> Result<(), InterfaceError> {
        self.run_wg(&[
            "set",
            &self.interface,
            "peer",
            public_key,
            "allowed-ips",
            address,
        ])
        .await?;
        debug!(interface = %self.interface, public_key, address, "Peer configured");
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<(), InterfaceError> {
        self.run_wg(&["set", &self.interface, "peer", public_key, "remove"])
            .await?;
        debug!(interface = %self.interface, public_key, "Peer removed");
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<LivePeer>, InterfaceError> {
        let dump = self.run_wg(&["show", &self.interface, "dump"]).await?;
        parse_dump(&dump)
    }

    async fn public_key(&self) -> Result<String, InterfaceError> {
        let key = self
            .run_wg(&["show", &self.interface, "public-key"])
            .await?;
        Ok(key.trim().to_string())
    }
}

/// Parse `wg show <if> dump` output.
///
/// The first line describes the interface itself and is skipped. Each
/// following line is a tab-separated peer: public key, preshared key,
/// endpoint, allowed ips, latest handshake (unix seconds, 0 if never),
/// rx bytes, tx bytes, persistent keepalive.
pub fn parse_dump(dump: &str) -> Result<Vec<LivePeer>, InterfaceError> {
    dump.lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(parse_peer_line)
        .collect()
}

fn parse_peer_line(line: &str) -> Result<LivePeer, InterfaceError> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 7 {
        return Err(InterfaceError::Parse(format!(
            "expected at least 7 fields, got {}: {}",
            fields.len(),
            line
        )));
    }

    let number = |i: usize| -> Result<i64, InterfaceError> {
        fields[i]
            .parse::<i64>()
            .map_err(|_| InterfaceError::Parse(format!("bad number '{}' in: {}", fields[i], line)))
    };

    let mut peer = LivePeer::new(fields[0]).with_transfer(number(5)?, number(6)?);

    if fields[2] != "(none)" && !fields[2].is_empty() {
        peer = peer.with_endpoint(fields[2]);
    }

    let handshake = number(4)?;
    if handshake > 0 {
        if let Some(at) = DateTime::<Utc>::from_timestamp(handshake, 0) {
            peer = peer.with_handshake(at);
        }
    }

    Ok(peer)
}

// =============================================================================
// Mock
// =============================================================================

#[derive(Debug, Clone)]
struct MockPeer {
    peer: LivePeer,
    address: String,
}

/// In-memory interface for testing and development.
#[derive(Debug)]
pub struct MockInterface {
    public_key: String,
    peers: RwLock<Vec<MockPeer>>,
    failing_keys: RwLock<HashSet<String>>,
    fail_all: bool,
    add_calls: AtomicU64,
    remove_calls: AtomicU64,
}

impl MockInterface {
    /// Create an empty mock interface.
    pub fn new() -> Self {
        Self {
            public_key: "bW9jay1pbnRlcmZhY2UtcHVibGljLWtleS0wMDAwMDA=".to_string(),
            peers: RwLock::new(Vec::new()),
            failing_keys: RwLock::new(HashSet::new()),
            fail_all: false,
            add_calls: AtomicU64::new(0),
            remove_calls: AtomicU64::new(0),
        }
    }

    /// Create a mock interface whose every operation fails.
    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::new()
        }
    }

    /// Create a mock interface with peers already configured.
    pub fn with_peers(peers: impl IntoIterator<Item = LivePeer>) -> Self {
        let peers = peers
            .into_iter()
            .map(|peer| MockPeer {
                peer,
                address: String::new(),
            })
            .collect();
        Self {
            peers: RwLock::new(peers),
            ..Self::new()
        }
    }

    /// Make operations on one peer fail.
    pub async fn fail_peer(&self, public_key: &str) {
        self.failing_keys
            .write()
            .await
            .insert(public_key.to_string());
    }

    /// Replace the telemetry of a configured peer, as the kernel would.
    pub async fn set_telemetry(&self, telemetry: LivePeer) -> bool {
        let mut peers = self.peers.write().await;
        match peers
            .iter_mut()
            .find(|p| p.peer.public_key == telemetry.public_key)
        {
            Some(entry) => {
                entry.peer = telemetry;
                true
            }
            None => false,
        }
    }

    /// Public keys of configured peers, sorted.
    pub async fn peer_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .peers
            .read()
            .await
            .iter()
            .map(|p| p.peer.public_key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Allowed address per configured peer.
    pub async fn allowed_addresses(&self) -> HashMap<String, String> {
        self.peers
            .read()
            .await
            .iter()
            .map(|p| (p.peer.public_key.clone(), p.address.clone()))
            .collect()
    }

    pub fn add_calls(&self) -> u64 {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> u64 {
        self.remove_calls.load(Ordering::SeqCst)
    }

    async fn check(&self, public_key: &str) -> Result<(), InterfaceError> {
        if self.fail_all {
            return Err(InterfaceError::Unavailable(
                "mock interface configured to fail".to_string(),
            ));
        }
        if self.failing_keys.read().await.contains(public_key) {
            return Err(InterfaceError::Unavailable(format!(
                "mock interface configured to fail for peer {}",
                public_key
            )));
        }
        Ok(())
    }
}

impl Default for MockInterface {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InterfaceControl for MockInterface {
    async fn add_peer(&self, public_key: &str, address: &str) -> Result<(), InterfaceError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        self.check(public_key).await?;

        let mut peers = self.peers.write().await;
        match peers.iter_mut().find(|p| p.peer.public_key == public_key) {
            Some(existing) => existing.address = address.to_string(),
            None => peers.push(MockPeer {
                peer: LivePeer::new(public_key),
                address: address.to_string(),
            }),
        }

        info!(public_key, address, "[MOCK] Peer configured");
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<(), InterfaceError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.check(public_key).await?;

        self.peers
            .write()
            .await
            .retain(|p| p.peer.public_key != public_key);

        info!(public_key, "[MOCK] Peer removed");
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<LivePeer>, InterfaceError> {
        if self.fail_all {
            return Err(InterfaceError::Unavailable(
                "mock interface configured to fail".to_string(),
            ));
        }
        Ok(self
            .peers
            .read()
            .await
            .iter()
            .map(|p| p.peer.clone())
            .collect())
    }

    async fn public_key(&self) -> Result<String, InterfaceError> {
        Ok(self.public_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "cHJpdmF0ZQ==\tcHVibGlj\t51820\toff\n\
        peerA=\t(none)\t203.0.113.7:51820\t10.44.0.2/32\t1700000000\t1024\t2048\toff\n\
        peerB=\t(none)\t(none)\t10.44.0.3/32\t0\t0\t0\toff\n";

    #[test]
    fn test_parse_dump() {
        let peers = parse_dump(DUMP).unwrap();
        assert_eq!(peers.len(), 2);

        let a = &peers[0];
        assert_eq!(a.public_key, "peerA=");
        assert_eq!(a.endpoint.as_deref(), Some("203.0.113.7:51820"));
        assert_eq!(a.endpoint_ip().as_deref(), Some("203.0.113.7"));
        assert_eq!(a.last_handshake.unwrap().timestamp(), 1_700_000_000);
        assert_eq!((a.rx_bytes, a.tx_bytes), (1024, 2048));

        let b = &peers[1];
        assert!(b.endpoint.is_none());
        assert!(b.last_handshake.is_none());
    }

    #[test]
    fn test_parse_dump_interface_only() {
        assert!(parse_dump("cHJpdmF0ZQ==\tcHVibGlj\t51820\toff\n")
            .unwrap()
            .is_empty());
        assert!(parse_dump("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_dump_rejects_short_line() {
        let err = parse_dump("iface\nonly\ttwo\n").unwrap_err();
        assert!(matches!(err, InterfaceError::Parse(_)));
    }

    #[tokio::test]
    async fn test_mock_add_is_idempotent() {
        let wg = MockInterface::new();
        wg.add_peer("A", "10.44.0.2/32").await.unwrap();
        wg.add_peer("A", "10.44.0.2/32").await.unwrap();

        assert_eq!(wg.peer_keys().await, vec!["A"]);
        assert_eq!(wg.add_calls(), 2);
    }

    #[tokio::test]
    async fn test_mock_remove() {
        let wg = MockInterface::with_peers([LivePeer::new("A"), LivePeer::new("B")]);
        wg.remove_peer("A").await.unwrap();
        wg.remove_peer("missing").await.unwrap();
        assert_eq!(wg.peer_keys().await, vec!["B"]);
    }

    #[tokio::test]
    async fn test_mock_failures() {
        let wg = MockInterface::failing();
        assert!(wg.add_peer("A", "10.44.0.2/32").await.is_err());
        assert!(wg.list_peers().await.is_err());

        let wg = MockInterface::new();
        wg.fail_peer("B").await;
        assert!(wg.add_peer("A", "10.44.0.2/32").await.is_ok());
        assert!(wg.add_peer("B", "10.44.0.3/32").await.is_err());
    }
}
