//! Device record store.
//!
//! The record store is the source of truth for which peers should exist on
//! the interface. Natural key is `(owner, name)`. Records are created once,
//! afterwards only their telemetry fields change, and they are removed by
//! explicit delete.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error};
use wgfleet_events::Device;

/// Record store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No matching record.
    #[error("device not found: {0}")]
    NotFound(String),

    /// A record with the same owner and name, public key or address exists.
    #[error("device already exists: {0}")]
    AlreadyExists(String),

    /// The backing storage failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

/// Live peer telemetry written back onto a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Telemetry {
    /// Endpoint IP, without port.
    pub endpoint: String,
    pub receive_bytes: i64,
    pub transmit_bytes: i64,

    /// `None` keeps the stored handshake time.
    pub last_handshake_time: Option<DateTime<Utc>>,
}

/// Persistence for device records.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Insert a new record. Fails with [`StoreError::AlreadyExists`] if any
    /// unique field is taken.
    async fn create(&self, device: &Device) -> Result<(), StoreError>;

    /// Update the telemetry fields of the record holding `public_key`.
    ///
    /// Never inserts; a missing record is [`StoreError::NotFound`].
    async fn update_telemetry(
        &self,
        public_key: &str,
        telemetry: &Telemetry,
    ) -> Result<(), StoreError>;

    /// All devices, or only those of `owner`.
    async fn list(&self, owner: Option<&str>) -> Result<Vec<Device>, StoreError>;

    async fn get(&self, owner: &str, name: &str) -> Result<Device, StoreError>;

    async fn get_by_public_key(&self, public_key: &str) -> Result<Device, StoreError>;

    async fn delete(&self, device: &Device) -> Result<(), StoreError>;
}

// =============================================================================
// Postgres
// =============================================================================

const DEVICE_COLUMNS: &str = "owner, owner_name, owner_email, name, public_key, address, \
     created_at, updated_at, last_handshake_time, receive_bytes, transmit_bytes, endpoint";

fn device_from_row(row: &PgRow) -> Result<Device, sqlx::Error> {
    Ok(Device {
        owner: row.try_get("owner")?,
        owner_name: row.try_get("owner_name")?,
        owner_email: row.try_get("owner_email")?,
        name: row.try_get("name")?,
        public_key: row.try_get("public_key")?,
        address: row.try_get("address")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_handshake_time: row.try_get("last_handshake_time")?,
        receive_bytes: row.try_get("receive_bytes")?,
        transmit_bytes: row.try_get("transmit_bytes")?,
        endpoint: row.try_get("endpoint")?,
    })
}

/// Device store backed by the `devices` table.
#[derive(Debug, Clone)]
pub struct PgDeviceStore {
    pool: PgPool,
}

impl PgDeviceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        binds: &[&str],
        what: String,
    ) -> Result<Device, StoreError> {
        let sql = format!("SELECT {} FROM devices WHERE {}", DEVICE_COLUMNS, clause);
        let mut query = sqlx::query(&sql);
        for bind in binds {
            query = query.bind(*bind);
        }

        let row = query
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(what))?;
        Ok(device_from_row(&row)?)
    }
}

#[async_trait]
impl DeviceStore for PgDeviceStore {
    async fn create(&self, device: &Device) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO devices (
                owner, owner_name, owner_email, name, public_key, address,
                created_at, updated_at, last_handshake_time,
                receive_bytes, transmit_bytes, endpoint
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&device.owner)
        .bind(&device.owner_name)
        .bind(&device.owner_email)
        .bind(&device.name)
        .bind(&device.public_key)
        .bind(&device.address)
        .bind(device.created_at)
        .bind(device.updated_at)
        .bind(device.last_handshake_time)
        .bind(device.receive_bytes)
        .bind(device.transmit_bytes)
        .bind(&device.endpoint)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::AlreadyExists(match db.constraint() {
                    Some("devices_public_key_idx") => format!("public key {}", device.public_key),
                    Some("devices_address_idx") => format!("address {}", device.address),
                    _ => format!("{}/{}", device.owner, device.name),
                })
            }
            e => {
                error!(owner = %device.owner, name = %device.name, error = %e, "Failed to create device");
                StoreError::from(e)
            }
        })?;

        Ok(())
    }

    async fn update_telemetry(
        &self,
        public_key: &str,
        telemetry: &Telemetry,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET
                endpoint = $2,
                receive_bytes = $3,
                transmit_bytes = $4,
                last_handshake_time = COALESCE($5, last_handshake_time),
                updated_at = now()
            WHERE public_key = $1
            "#,
        )
        .bind(public_key)
        .bind(&telemetry.endpoint)
        .bind(telemetry.receive_bytes)
        .bind(telemetry.transmit_bytes)
        .bind(telemetry.last_handshake_time)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(public_key.to_string()));
        }
        Ok(())
    }

    async fn list(&self, owner: Option<&str>) -> Result<Vec<Device>, StoreError> {
        let rows = match owner {
            Some(owner) => {
                let sql = format!(
                    "SELECT {} FROM devices WHERE owner = $1 ORDER BY created_at, name",
                    DEVICE_COLUMNS
                );
                sqlx::query(&sql).bind(owner).fetch_all(&self.pool).await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM devices ORDER BY created_at, owner, name",
                    DEVICE_COLUMNS
                );
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
        };

        let devices = rows
            .iter()
            .map(device_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = devices.len(), "Listed devices");
        Ok(devices)
    }

    async fn get(&self, owner: &str, name: &str) -> Result<Device, StoreError> {
        self.fetch_one_where(
            "owner = $1 AND name = $2",
            &[owner, name],
            format!("{}/{}", owner, name),
        )
        .await
    }

    async fn get_by_public_key(&self, public_key: &str) -> Result<Device, StoreError> {
        self.fetch_one_where("public_key = $1", &[public_key], public_key.to_string())
            .await
    }

    async fn delete(&self, device: &Device) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM devices WHERE owner = $1 AND name = $2")
            .bind(&device.owner)
            .bind(&device.name)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!(owner = %device.owner, name = %device.name, error = %e, "Failed to delete device");
                StoreError::from(e)
            })?;
        Ok(())
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Device store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    devices: RwLock<HashMap<(String, String), Device>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `devices`.
    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let devices = devices
            .into_iter()
            .map(|d| ((d.owner.clone(), d.name.clone()), d))
            .collect();
        Self {
            devices: RwLock::new(devices),
        }
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn create(&self, device: &Device) -> Result<(), StoreError> {
        let mut devices = self.devices.write().await;

        let key = (device.owner.clone(), device.name.clone());
        if devices.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!(
                "{}/{}",
                device.owner, device.name
            )));
        }
        if devices.values().any(|d| d.public_key == device.public_key) {
            return Err(StoreError::AlreadyExists(format!(
                "public key {}",
                device.public_key
            )));
        }
        if devices.values().any(|d| d.address == device.address) {
            return Err(StoreError::AlreadyExists(format!(
                "address {}",
                device.address
            )));
        }

        devices.insert(key, device.clone());
        Ok(())
    }

    async fn update_telemetry(
        &self,
        public_key: &str,
        telemetry: &Telemetry,
    ) -> Result<(), StoreError> {
        let mut devices = self.devices.write().await;
        let device = devices
            .values_mut()
            .find(|d| d.public_key == public_key)
            .ok_or_else(|| StoreError::NotFound(public_key.to_string()))?;

        device.endpoint = telemetry.endpoint.clone();
        device.receive_bytes = telemetry.receive_bytes;
        device.transmit_bytes = telemetry.transmit_bytes;
        if telemetry.last_handshake_time.is_some() {
            device.last_handshake_time = telemetry.last_handshake_time;
        }
        device.updated_at = Utc::now();
        Ok(())
    }

    async fn list(&self, owner: Option<&str>) -> Result<Vec<Device>, StoreError> {
        let mut devices: Vec<Device> = self
            .devices
            .read()
            .await
            .values()
            .filter(|d| owner.is_none_or(|o| d.owner == o))
            .cloned()
            .collect();
        devices.sort_by(|a, b| {
            (a.created_at, &a.owner, &a.name).cmp(&(b.created_at, &b.owner, &b.name))
        });
        Ok(devices)
    }

    async fn get(&self, owner: &str, name: &str) -> Result<Device, StoreError> {
        self.devices
            .read()
            .await
            .get(&(owner.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", owner, name)))
    }

    async fn get_by_public_key(&self, public_key: &str) -> Result<Device, StoreError> {
        self.devices
            .read()
            .await
            .values()
            .find(|d| d.public_key == public_key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(public_key.to_string()))
    }

    async fn delete(&self, device: &Device) -> Result<(), StoreError> {
        self.devices
            .write()
            .await
            .remove(&(device.owner.clone(), device.name.clone()));
        Ok(())
    }
}
