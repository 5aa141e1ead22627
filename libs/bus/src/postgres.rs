//! Postgres medium.
//!
//! Counters and the TTL key-value store are tables; broadcast goes through
//! `pg_notify` on a single notification channel whose payload carries the
//! bus channel name. Pattern filtering happens locally per connection.
//!
//! The tables are created by the worker's migrations (`bus_counters`,
//! `bus_kv`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool};
use sqlx::Row;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::medium::{BusMedium, ChannelMessage, PatternSet, DELIVERY_BUFFER};
use crate::BusError;

/// Postgres notification channel carrying every bus broadcast.
pub const NOTIFY_CHANNEL: &str = "wgfleet_bus";

/// Default interval between purges of expired rows.
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Backoff after a listener error before receiving again.
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A connection to the Postgres medium.
pub struct PgMedium {
    pool: PgPool,
    patterns: Arc<PatternSet>,
}

impl PgMedium {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            patterns: Arc::new(PatternSet::new()),
        }
    }

    /// Delete expired key-value rows. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, BusError> {
        let result = sqlx::query("DELETE FROM bus_kv WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Purge expired rows every `interval` until shutdown.
    pub async fn run_purger(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        info!(interval_secs = interval.as_secs(), "Starting expired row purger");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => debug!(purged, "Purged expired bus rows"),
                        Err(e) => warn!(error = %e, "Failed to purge expired bus rows"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Expired row purger shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl BusMedium for PgMedium {
    async fn incr(&self, key: &str) -> Result<i64, BusError> {
        let row = sqlx::query(
            r#"
            INSERT INTO bus_counters (key, value) VALUES ($1, 1)
            ON CONFLICT (key) DO UPDATE SET value = bus_counters.value + 1
            RETURNING value
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("value")?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BusError> {
        sqlx::query(
            r#"
            INSERT INTO bus_kv (key, value, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BusError> {
        // The conflicting row is only overwritten once it has expired.
        let result = sqlx::query(
            r#"
            INSERT INTO bus_kv (key, value, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            WHERE bus_kv.expires_at <= now()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        let row = sqlx::query("SELECT value FROM bus_kv WHERE key = $1 AND expires_at > now()")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), BusError> {
        let payload = serde_json::to_string(&ChannelMessage::new(channel, message))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<(), BusError> {
        self.patterns.add(pattern).await
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<(), BusError> {
        self.patterns.remove(pattern).await;
        Ok(())
    }

    async fn messages(&self) -> Result<mpsc::Receiver<ChannelMessage>, BusError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;
        info!(channel = NOTIFY_CHANNEL, "Listening for bus notifications");

        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let patterns = self.patterns.clone();

        tokio::spawn(async move {
            loop {
                let notification = match listener.recv().await {
                    Ok(n) => n,
                    Err(e) => {
                        error!(error = %e, "Bus listener failed");
                        tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                        if tx.is_closed() {
                            break;
                        }
                        continue;
                    }
                };

                let msg: ChannelMessage = match serde_json::from_str(notification.payload()) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(error = %e, "Ignoring undecodable bus notification");
                        continue;
                    }
                };

                if !patterns.matches(&msg.channel).await {
                    continue;
                }
                if tx.send(msg).await.is_err() {
                    debug!("Delivery stream dropped, stopping listener");
                    break;
                }
            }
        });

        Ok(rx)
    }
}
