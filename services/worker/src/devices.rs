//! Device lifecycle.
//!
//! Adding a device allocates its address and persists the record, then
//! announces it on the bus; the bus handlers (on whichever replica claims
//! the message) apply the change to the interface.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use wgfleet_bus::{BusError, PubSubClient};
use wgfleet_events::{topics, Device, DevicePayload, EventError, Message};
use wgfleet_networking::{
    format_host_cidr, next_client_address, parse_host_address, Ipv4Subnet, NetworkError,
    WgPublicKey, WIREGUARD_DEFAULT_PORT,
};

use crate::interface::{InterfaceControl, InterfaceError};
use crate::store::{DeviceStore, StoreError};

/// Device lifecycle errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device name must not be empty")]
    EmptyName,

    /// The owner already has a device with this name.
    #[error("device {owner}/{name} already exists")]
    AlreadyExists { owner: String, name: String },

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Interface(#[from] InterfaceError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Event(#[from] EventError),
}

/// The user a device belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOwner {
    /// Stable identifier of the user.
    pub slug: String,
    pub name: String,
    pub email: String,
}

impl DeviceOwner {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            name: String::new(),
            email: String::new(),
        }
    }

    pub fn with_contact(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.name = name.into();
        self.email = email.into();
        self
    }
}

/// What a client needs to configure its tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub public_key: String,
    pub port: u16,

    /// Address of the interface inside the VPN.
    pub host_vpn_ip: String,

    pub subnet: Ipv4Subnet,
}

/// Device operations over the record store, interface and bus.
pub struct DeviceService {
    store: Arc<dyn DeviceStore>,
    interface: Arc<dyn InterfaceControl>,
    bus: PubSubClient,
    subnet: Ipv4Subnet,

    /// Held from reading the used set until the new record is saved.
    allocation: Mutex<()>,
}

impl DeviceService {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        interface: Arc<dyn InterfaceControl>,
        bus: PubSubClient,
        subnet: Ipv4Subnet,
    ) -> Self {
        Self {
            store,
            interface,
            bus,
            subnet,
            allocation: Mutex::new(()),
        }
    }

    /// Register a new device and announce it.
    ///
    /// An existing `(owner, name)` is never replaced; remove it first.
    pub async fn add_device(
        &self,
        owner: &DeviceOwner,
        name: &str,
        public_key: &str,
    ) -> Result<Device, DeviceError> {
        if name.trim().is_empty() {
            return Err(DeviceError::EmptyName);
        }
        let public_key = WgPublicKey::from_base64(public_key)?;

        let device = {
            let _guard = self.allocation.lock().await;

            match self.store.get(&owner.slug, name).await {
                Ok(_) => {
                    return Err(DeviceError::AlreadyExists {
                        owner: owner.slug.clone(),
                        name: name.to_string(),
                    })
                }
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }

            let address = self.next_client_address().await?;
            let mut device = Device::new(
                owner.slug.as_str(),
                name,
                public_key.as_str(),
                format_host_cidr(address),
            );
            device.owner_name = owner.name.clone();
            device.owner_email = owner.email.clone();

            self.store.create(&device).await?;
            device
        };

        info!(
            owner = %device.owner,
            name = %device.name,
            address = %device.address,
            "Device added"
        );

        self.announce(topics::DEVICE_CREATE, DevicePayload::created(device.clone()))
            .await;
        Ok(device)
    }

    /// Announce removal of a device, then delete its record.
    pub async fn delete_device(&self, owner: &str, name: &str) -> Result<(), DeviceError> {
        let device = self.store.get(owner, name).await?;

        self.announce(topics::DEVICE_DELETE, DevicePayload::deleted(device.clone()))
            .await;
        self.store.delete(&device).await?;

        info!(owner, name, "Device deleted");
        Ok(())
    }

    pub async fn list_devices(&self, owner: &str) -> Result<Vec<Device>, DeviceError> {
        Ok(self.store.list(Some(owner)).await?)
    }

    pub async fn list_all_devices(&self) -> Result<Vec<Device>, DeviceError> {
        Ok(self.store.list(None).await?)
    }

    pub async fn get_by_public_key(&self, public_key: &str) -> Result<Device, DeviceError> {
        Ok(self.store.get_by_public_key(public_key).await?)
    }

    pub async fn server_info(&self) -> Result<ServerInfo, DeviceError> {
        Ok(ServerInfo {
            public_key: self.interface.public_key().await?,
            port: WIREGUARD_DEFAULT_PORT,
            host_vpn_ip: self.subnet.gateway().to_string(),
            subnet: self.subnet,
        })
    }

    /// Must be called with the allocation lock held.
    async fn next_client_address(&self) -> Result<std::net::Ipv4Addr, DeviceError> {
        let devices = self.store.list(None).await?;
        let used = devices
            .iter()
            .filter_map(|d| parse_host_address(&d.address).ok());
        Ok(next_client_address(&self.subnet, used)?)
    }

    /// The record is already authoritative; a lost announcement is healed
    /// by the next startup reconcile.
    async fn announce(&self, topic: &str, payload: DevicePayload) {
        let message = match Message::json(topic, &payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(topic, error = %e, "Failed to encode device event");
                return;
            }
        };

        if let Err(e) = self.bus.publish(message).await {
            warn!(topic, error = %e, "Failed to publish device event");
        }
    }
}
