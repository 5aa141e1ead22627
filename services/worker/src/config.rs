//! Configuration for the worker.

use std::time::Duration;

use anyhow::{Context, Result};
use wgfleet_networking::Ipv4Subnet;
use wgfleet_reconcile::DEFAULT_METADATA_INTERVAL;

/// Which medium backs the message bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    /// Postgres tables plus `LISTEN`/`NOTIFY`.
    Postgres,

    /// In-process only; a single replica.
    Memory,
}

impl std::str::FromStr for BusKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "pg" => Ok(Self::Postgres),
            "memory" | "mem" => Ok(Self::Memory),
            other => anyhow::bail!("unknown bus medium '{}'", other),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address space handed out to devices.
    pub vpn_cidr: Ipv4Subnet,

    /// WireGuard interface name.
    pub wg_interface: String,

    /// Drive the real interface through the `wg` CLI. Otherwise use the mock.
    pub wg_enabled: bool,

    /// Metadata poll interval in seconds.
    pub metadata_interval_secs: u64,

    /// Bus medium.
    pub bus: BusKind,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Development mode: run migrations at startup.
    pub dev_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vpn_cidr: Ipv4Subnet::default(),
            wg_interface: "wg0".to_string(),
            wg_enabled: false,
            metadata_interval_secs: DEFAULT_METADATA_INTERVAL.as_secs(),
            bus: BusKind::Postgres,
            log_level: "info".to_string(),
            dev_mode: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let vpn_cidr = match std::env::var("WGFLEET_VPN_CIDR") {
            Ok(s) => Ipv4Subnet::from_cidr(&s)
                .with_context(|| format!("invalid WGFLEET_VPN_CIDR '{}'", s))?,
            Err(_) => defaults.vpn_cidr,
        };

        let wg_interface =
            std::env::var("WGFLEET_WG_INTERFACE").unwrap_or(defaults.wg_interface);

        let wg_enabled = std::env::var("WGFLEET_WG_ENABLED")
            .map(|v| parse_bool(&v))
            .unwrap_or(false);

        let metadata_interval_secs = std::env::var("WGFLEET_METADATA_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(defaults.metadata_interval_secs);

        let bus = match std::env::var("WGFLEET_BUS") {
            Ok(s) => s.parse()?,
            Err(_) => defaults.bus,
        };

        let log_level = std::env::var("WGFLEET_LOG_LEVEL").unwrap_or(defaults.log_level);

        let dev_mode = std::env::var("WGFLEET_DEV")
            .map(|v| parse_bool(&v))
            .unwrap_or(false);

        Ok(Self {
            vpn_cidr,
            wg_interface,
            wg_enabled,
            metadata_interval_secs,
            bus,
            log_level,
            dev_mode,
        })
    }

    /// Metadata poll interval.
    pub fn metadata_interval(&self) -> Duration {
        Duration::from_secs(self.metadata_interval_secs)
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim(), "1" | "true" | "TRUE" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.vpn_cidr.to_string(), "10.44.0.0/24");
        assert_eq!(config.wg_interface, "wg0");
        assert!(!config.wg_enabled);
        assert_eq!(config.metadata_interval(), Duration::from_secs(20));
        assert_eq!(config.bus, BusKind::Postgres);
    }

    #[test]
    fn test_bus_kind_parse() {
        assert_eq!("postgres".parse::<BusKind>().unwrap(), BusKind::Postgres);
        assert_eq!("Memory".parse::<BusKind>().unwrap(), BusKind::Memory);
        assert!("redis".parse::<BusKind>().is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("no"));
    }
}
