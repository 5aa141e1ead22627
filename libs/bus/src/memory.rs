//! In-process medium.
//!
//! A [`MemoryBackend`] is the shared state; every [`MemoryMedium`] obtained
//! from [`MemoryBackend::connect`] behaves like an independent replica's
//! connection with its own pattern set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::medium::{BusMedium, ChannelMessage, PatternSet, DELIVERY_BUFFER};
use crate::BusError;

/// Capacity of the fan-out channel shared by all connections.
const FANOUT_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug)]
struct Shared {
    counters: Mutex<HashMap<String, i64>>,
    kv: Mutex<HashMap<String, Entry>>,
    fanout: broadcast::Sender<ChannelMessage>,
}

/// Shared state of the in-process medium.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                counters: Mutex::new(HashMap::new()),
                kv: Mutex::new(HashMap::new()),
                fanout,
            }),
        }
    }

    /// Open a new connection.
    ///
    /// Broadcasts published after this call are buffered for the connection
    /// until its delivery stream is taken.
    pub fn connect(&self) -> MemoryMedium {
        MemoryMedium {
            shared: self.shared.clone(),
            patterns: Arc::new(PatternSet::new()),
            inbox: Mutex::new(Some(self.shared.fanout.subscribe())),
        }
    }

    /// Number of live (unexpired) keys.
    pub async fn live_keys(&self) -> usize {
        let now = Instant::now();
        self.shared
            .kv
            .lock()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    /// Drop expired keys. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut kv = self.shared.kv.lock().await;
        let before = kv.len();
        kv.retain(|_, e| e.is_live(now));
        before - kv.len()
    }
}

/// One connection to a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemoryMedium {
    shared: Arc<Shared>,
    patterns: Arc<PatternSet>,
    inbox: Mutex<Option<broadcast::Receiver<ChannelMessage>>>,
}

#[async_trait]
impl BusMedium for MemoryMedium {
    async fn incr(&self, key: &str) -> Result<i64, BusError> {
        let mut counters = self.shared.counters.lock().await;
        let value = counters.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BusError> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        };
        self.shared.kv.lock().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BusError> {
        let now = Instant::now();
        let mut kv = self.shared.kv.lock().await;
        if kv.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        let now = Instant::now();
        let kv = self.shared.kv.lock().await;
        Ok(kv
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), BusError> {
        // No receivers is not an error; nobody was listening.
        let _ = self
            .shared
            .fanout
            .send(ChannelMessage::new(channel, message));
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
        let mut inbox = self
            .inbox
            .lock()
            .await
            .take()
            .ok_or_else(|| BusError::Medium("delivery stream already taken".to_string()))?;

        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let patterns = self.patterns.clone();

        tokio::spawn(async move {
            loop {
                match inbox.recv().await {
                    Ok(msg) => {
                        if !patterns.matches(&msg.channel).await {
                            continue;
                        }
                        if tx.send(msg).await.is_err() {
                            debug!("Delivery stream dropped, stopping pump");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Connection lagged behind the fan-out channel");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_incr_per_key() {
        let medium = MemoryBackend::new().connect();
        assert_eq!(medium.incr("a").await.unwrap(), 1);
        assert_eq!(medium.incr("a").await.unwrap(), 2);
        assert_eq!(medium.incr("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_counters_shared_between_connections() {
        let backend = MemoryBackend::new();
        let a = backend.connect();
        let b = backend.connect();
        assert_eq!(a.incr("DEVICE.CREATE.nextId").await.unwrap(), 1);
        assert_eq!(b.incr("DEVICE.CREATE.nextId").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_set_nx_only_once() {
        let medium = MemoryBackend::new().connect();
        let ttl = Duration::from_secs(15);
        assert!(medium.set_nx_ex("lock.x.1", "v", ttl).await.unwrap());
        assert!(!medium.set_nx_ex("lock.x.1", "v", ttl).await.unwrap());
        assert_eq!(medium.get("lock.x.1").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_expired_key_reads_absent_and_can_be_reclaimed() {
        let backend = MemoryBackend::new();
        let medium = backend.connect();
        medium
            .set_ex("x.1", "v", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(medium.get("x.1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(medium.get("x.1").await.unwrap().is_none());
        assert!(medium
            .set_nx_ex("x.1", "w", Duration::from_secs(1))
            .await
            .unwrap());
        assert_eq!(backend.live_keys().await, 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let backend = MemoryBackend::new();
        let medium = backend.connect();
        medium
            .set_ex("gone", "v", Duration::from_millis(10))
            .await
            .unwrap();
        medium
            .set_ex("kept", "v", Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(backend.purge_expired().await, 1);
        assert_eq!(backend.live_keys().await, 1);
    }

    #[tokio::test]
    async fn test_delivery_filtered_by_pattern() {
        let backend = MemoryBackend::new();
        let consumer = backend.connect();
        let producer = backend.connect();
        consumer.psubscribe("DEVICE.*").await.unwrap();
        let mut rx = consumer.messages().await.unwrap();

        producer.publish("USER.CREATE", "u").await.unwrap();
        producer.publish("DEVICE.CREATE", "d").await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg, ChannelMessage::new("DEVICE.CREATE", "d"));
    }

    #[tokio::test]
    async fn test_messages_taken_once() {
        let medium = MemoryBackend::new().connect();
        let _rx = medium.messages().await.unwrap();
        assert!(matches!(medium.messages().await, Err(BusError::Medium(_))));
    }
}
