//! Networking utilities for the device fleet.
//!
//! This library provides helpers for:
//! - IPAM (IP Address Management) for the IPv4 VPN subnet
//! - WireGuard public keys and live peer telemetry

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Every host address in the subnet is taken.
    #[error("there are no free IP addresses in the vpn subnet: '{0}'")]
    AddressSpaceExhausted(String),

    /// Invalid WireGuard key.
    #[error("invalid WireGuard key: {0}")]
    InvalidKey(String),
}

// ============================================================================
// IPAM (IP Address Management)
// ============================================================================

/// Default address space handed out to devices.
pub const DEFAULT_VPN_CIDR: &str = "10.44.0.0/24";

/// IPv4 subnet that device addresses are allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Subnet {
    /// Base (network) address of the subnet.
    pub address: Ipv4Addr,

    /// Prefix length (e.g., 24 for /24).
    pub prefix_len: u8,
}

impl Ipv4Subnet {
    /// Create a new subnet, masking the address to the prefix.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv4(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "10.44.0.0/24").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.trim().split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// The network address (x.x.x.0 for a /24).
    pub fn network(&self) -> Ipv4Addr {
        self.address
    }

    /// The address reserved for the interface itself (network + 1).
    ///
    /// Wraps back to the network address for a /32.
    pub fn gateway(&self) -> Ipv4Addr {
        let next = next_ip(self.address);
        if self.contains(next) {
            next
        } else {
            self.address
        }
    }

    /// Check if an address is within this subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        mask_ipv4(addr, self.prefix_len) == self.address
    }

    /// Number of addresses in this subnet.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix_len))
    }
}

impl Default for Ipv4Subnet {
    /// The default VPN subnet, `10.44.0.0/24`.
    fn default() -> Self {
        Self {
            address: Ipv4Addr::new(10, 44, 0, 0),
            prefix_len: 24,
        }
    }
}

impl std::fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Ipv4Subnet {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

/// Mask an IPv4 address to a prefix length.
fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from(addr);
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ipv4Addr::from(bits & mask)
}

/// The numerically next address, wrapping at 255.255.255.255.
pub fn next_ip(addr: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr).wrapping_add(1))
}

/// Pick the lowest free host address in `subnet`.
///
/// The network address and the gateway address are always treated as used.
/// Addresses are scanned in ascending order starting from the base, so the
/// result is deterministic for a given `used` set. Callers must serialize
/// calls relative to each other until the chosen address is persisted.
pub fn next_client_address<I>(subnet: &Ipv4Subnet, used: I) -> Result<Ipv4Addr, NetworkError>
where
    I: IntoIterator<Item = Ipv4Addr>,
{
    let mut taken: HashSet<Ipv4Addr> = used.into_iter().collect();
    taken.insert(subnet.network());
    taken.insert(subnet.gateway());

    let base = u64::from(u32::from(subnet.network()));
    (0..subnet.size())
        .map(|offset| Ipv4Addr::from((base + offset) as u32))
        .find(|candidate| !taken.contains(candidate))
        .ok_or_else(|| NetworkError::AddressSpaceExhausted(subnet.to_string()))
}

/// Render a host address as a single-address CIDR (`a.b.c.d/32`).
pub fn format_host_cidr(addr: Ipv4Addr) -> String {
    format!("{}/32", addr)
}

/// Parse a stored device address, accepting `a.b.c.d` or `a.b.c.d/n`.
pub fn parse_host_address(s: &str) -> Result<Ipv4Addr, NetworkError> {
    let addr_str = s.trim().split_once('/').map_or(s.trim(), |(a, _)| a);
    Ipv4Addr::from_str(addr_str).map_err(|_| NetworkError::InvalidAddress(s.to_string()))
}

// ============================================================================
// WireGuard
// ============================================================================

/// Default WireGuard port.
pub const WIREGUARD_DEFAULT_PORT: u16 = 51820;

/// WireGuard public key (base64-encoded, 32 bytes).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WgPublicKey(String);

impl WgPublicKey {
    /// Create from a base64-encoded string.
    pub fn from_base64(s: &str) -> Result<Self, NetworkError> {
        use base64::Engine;

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|_| NetworkError::InvalidKey(format!("invalid base64: {}", s)))?;

        if decoded.len() != 32 {
            return Err(NetworkError::InvalidKey(format!(
                "key must be 32 bytes, got {}",
                decoded.len()
            )));
        }

        Ok(Self(s.to_string()))
    }

    /// Get the base64-encoded key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WgPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A peer as currently configured on the live interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePeer {
    /// Peer's public key (base64).
    pub public_key: String,

    /// Last observed endpoint (`ip:port`), if the peer has ever connected.
    pub endpoint: Option<String>,

    /// Time of the most recent handshake; `None` if never.
    pub last_handshake: Option<DateTime<Utc>>,

    /// Bytes received from the peer.
    pub rx_bytes: i64,

    /// Bytes transmitted to the peer.
    pub tx_bytes: i64,
}

impl LivePeer {
    /// Create a peer with no telemetry.
    pub fn new(public_key: &str) -> Self {
        Self {
            public_key: public_key.to_string(),
            endpoint: None,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }

    /// Set the endpoint.
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = Some(endpoint.to_string());
        self
    }

    /// Set the last handshake time.
    pub fn with_handshake(mut self, at: DateTime<Utc>) -> Self {
        self.last_handshake = Some(at);
        self
    }

    /// Set the transfer counters.
    pub fn with_transfer(mut self, rx_bytes: i64, tx_bytes: i64) -> Self {
        self.rx_bytes = rx_bytes;
        self.tx_bytes = tx_bytes;
        self
    }

    /// The endpoint host without the port (`1.2.3.4:51820` -> `1.2.3.4`).
    pub fn endpoint_ip(&self) -> Option<String> {
        let endpoint = self.endpoint.as_deref()?.trim();
        if endpoint.is_empty() {
            return None;
        }
        match endpoint.parse::<std::net::SocketAddr>() {
            Ok(sock) => Some(sock.ip().to_string()),
            Err(_) => Some(endpoint.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    const NONE: [Ipv4Addr; 0] = [];

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_ipv4_subnet() {
        let subnet = Ipv4Subnet::from_cidr("10.44.0.7/24").unwrap();
        assert_eq!(subnet.network(), addr("10.44.0.0"));
        assert_eq!(subnet.gateway(), addr("10.44.0.1"));
        assert_eq!(subnet.size(), 256);
        assert_eq!(subnet.to_string(), "10.44.0.0/24");

        assert!(subnet.contains(addr("10.44.0.255")));
        assert!(!subnet.contains(addr("10.44.1.0")));
    }

    #[rstest]
    #[case("10.44.0.0")]
    #[case("10.44.0.0/33")]
    #[case("not-an-ip/24")]
    #[case("10.44.0.0/abc")]
    fn test_invalid_cidr(#[case] cidr: &str) {
        assert!(Ipv4Subnet::from_cidr(cidr).is_err());
    }

    #[test]
    fn test_default_subnet_matches_default_cidr() {
        assert_eq!(
            Ipv4Subnet::default(),
            Ipv4Subnet::from_cidr(DEFAULT_VPN_CIDR).unwrap()
        );
    }

    #[test]
    fn test_first_allocation_skips_network_and_gateway() {
        let subnet = Ipv4Subnet::from_cidr(DEFAULT_VPN_CIDR).unwrap();
        let first = next_client_address(&subnet, NONE).unwrap();
        assert_eq!(format_host_cidr(first), "10.44.0.2/32");
    }

    #[test]
    fn test_allocation_after_save_moves_on() {
        let subnet = Ipv4Subnet::from_cidr(DEFAULT_VPN_CIDR).unwrap();
        let first = next_client_address(&subnet, NONE).unwrap();
        let second = next_client_address(&subnet, [first]).unwrap();
        assert_eq!(second, addr("10.44.0.3"));
    }

    #[test]
    fn test_allocation_fills_gaps_lowest_first() {
        let subnet = Ipv4Subnet::from_cidr(DEFAULT_VPN_CIDR).unwrap();
        let used = [addr("10.44.0.2"), addr("10.44.0.4"), addr("10.44.0.5")];
        assert_eq!(
            next_client_address(&subnet, used).unwrap(),
            addr("10.44.0.3")
        );
    }

    #[test]
    fn test_allocation_exhausted() {
        let subnet = Ipv4Subnet::from_cidr("10.44.0.0/30").unwrap();
        let used = [addr("10.44.0.2"), addr("10.44.0.3")];
        let err = next_client_address(&subnet, used).unwrap_err();
        assert!(matches!(err, NetworkError::AddressSpaceExhausted(_)));
    }

    #[test]
    fn test_tiny_subnets_are_exhausted() {
        for cidr in ["10.44.0.9/32", "10.44.0.8/31"] {
            let subnet = Ipv4Subnet::from_cidr(cidr).unwrap();
            assert!(next_client_address(&subnet, NONE).is_err());
        }
    }

    #[test]
    fn test_used_addresses_outside_subnet_are_ignored() {
        let subnet = Ipv4Subnet::from_cidr("10.44.0.0/29").unwrap();
        let used = [addr("192.168.0.2")];
        assert_eq!(
            next_client_address(&subnet, used).unwrap(),
            addr("10.44.0.2")
        );
    }

    #[rstest]
    #[case("10.44.0.2/32", "10.44.0.2")]
    #[case("10.44.0.2", "10.44.0.2")]
    #[case(" 10.44.0.9/24 ", "10.44.0.9")]
    fn test_parse_host_address(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(parse_host_address(input).unwrap(), addr(expected));
    }

    #[test]
    fn test_wg_public_key() {
        let valid = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";
        assert!(WgPublicKey::from_base64(valid).is_ok());

        assert!(WgPublicKey::from_base64("AAAA").is_err());
        assert!(WgPublicKey::from_base64("not base64!").is_err());
    }

    #[rstest]
    #[case(Some("203.0.113.7:51820"), Some("203.0.113.7"))]
    #[case(Some("[2001:db8::1]:51820"), Some("2001:db8::1"))]
    #[case(Some(""), None)]
    #[case(None, None)]
    fn test_endpoint_ip(#[case] endpoint: Option<&str>, #[case] expected: Option<&str>) {
        let mut peer = LivePeer::new("key");
        peer.endpoint = endpoint.map(str::to_string);
        assert_eq!(peer.endpoint_ip().as_deref(), expected);
    }

    proptest! {
        #[test]
        fn prop_allocation_is_free_and_in_subnet(
            base in any::<u32>(),
            prefix_len in 24u8..=30,
            offsets in proptest::collection::vec(0u32..64, 0..64),
        ) {
            let subnet = Ipv4Subnet::new(Ipv4Addr::from(base), prefix_len).unwrap();
            let network = u32::from(subnet.network());
            let used: Vec<Ipv4Addr> = offsets
                .iter()
                .map(|o| Ipv4Addr::from(network.wrapping_add(*o)))
                .collect();

            let reserved = [subnet.network(), subnet.gateway()];
            let all_taken = (0..subnet.size()).all(|o| {
                let candidate = Ipv4Addr::from(network.wrapping_add(o as u32));
                reserved.contains(&candidate) || used.contains(&candidate)
            });

            match next_client_address(&subnet, used.clone()) {
                Ok(chosen) => {
                    prop_assert!(subnet.contains(chosen));
                    prop_assert_ne!(chosen, subnet.network());
                    prop_assert_ne!(chosen, subnet.gateway());
                    prop_assert!(!used.contains(&chosen));
                    prop_assert!(!all_taken);
                }
                Err(NetworkError::AddressSpaceExhausted(_)) => prop_assert!(all_taken),
                Err(other) => prop_assert!(false, "unexpected error: {other}"),
            }
        }
    }
}
