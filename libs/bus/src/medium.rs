//! The shared medium behind the bus.
//!
//! A medium offers atomic counters, a key-value store with TTLs and
//! set-if-absent, and pattern-filtered broadcast. Each connection keeps its
//! own pattern set and delivers only channels matching one of its patterns.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

use crate::BusError;

/// Buffer size of a connection's delivery stream.
pub const DELIVERY_BUFFER: usize = 1024;

/// A message received on a broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub message: String,
}

impl ChannelMessage {
    pub fn new(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            message: message.into(),
        }
    }
}

/// A connection to the shared medium.
#[async_trait]
pub trait BusMedium: Send + Sync {
    /// Atomically increment the counter at `key`, returning the new value.
    async fn incr(&self, key: &str) -> Result<i64, BusError>;

    /// Store `value` at `key`, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BusError>;

    /// Store `value` at `key` only if it is absent or expired.
    ///
    /// Returns true if this call stored the value.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BusError>;

    /// Read `key`; expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, BusError>;

    /// Broadcast `message` on `channel`.
    async fn publish(&self, channel: &str, message: &str) -> Result<(), BusError>;

    /// Start receiving channels matching `pattern`.
    async fn psubscribe(&self, pattern: &str) -> Result<(), BusError>;

    /// Stop receiving channels matching `pattern`.
    async fn punsubscribe(&self, pattern: &str) -> Result<(), BusError>;

    /// Take this connection's delivery stream. Can only be taken once.
    async fn messages(&self) -> Result<mpsc::Receiver<ChannelMessage>, BusError>;
}

/// Compile a topic pattern.
pub fn compile_pattern(pattern: &str) -> Result<Regex, BusError> {
    Regex::new(pattern).map_err(|e| BusError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Channel patterns one connection listens on.
#[derive(Debug, Default)]
pub struct PatternSet {
    patterns: RwLock<Vec<(String, Regex)>>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pattern; adding one that is already present is a no-op.
    pub async fn add(&self, pattern: &str) -> Result<(), BusError> {
        let regex = compile_pattern(pattern)?;
        let mut patterns = self.patterns.write().await;
        if !patterns.iter().any(|(p, _)| p == pattern) {
            patterns.push((pattern.to_string(), regex));
        }
        Ok(())
    }

    /// Remove a pattern. Returns true if it was present.
    pub async fn remove(&self, pattern: &str) -> bool {
        let mut patterns = self.patterns.write().await;
        let before = patterns.len();
        patterns.retain(|(p, _)| p != pattern);
        patterns.len() != before
    }

    /// Whether `channel` matches any pattern.
    pub async fn matches(&self, channel: &str) -> bool {
        self.patterns
            .read()
            .await
            .iter()
            .any(|(_, regex)| regex.is_match(channel))
    }

    pub async fn len(&self) -> usize {
        self.patterns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.patterns.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("DEVICE.*", "DEVICE.CREATE", true)]
    #[case("DEVICE.*", "USER.CREATE", false)]
    #[case("DEVICE.CREATE", "DEVICE.CREATE", true)]
    #[case("DEVICE.CREATE", "DEVICE.DELETE", false)]
    #[case("^DEVICE\\.(CREATE|DELETE)$", "DEVICE.DELETE", true)]
    #[case(".*", "ANYTHING", true)]
    fn test_compiled_pattern_matching(
        #[case] pattern: &str,
        #[case] channel: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(compile_pattern(pattern).unwrap().is_match(channel), expected);
    }

    #[tokio::test]
    async fn test_pattern_set_matching() {
        let set = PatternSet::new();
        assert!(!set.matches("DEVICE.CREATE").await);

        set.add("DEVICE.*").await.unwrap();
        assert!(set.matches("DEVICE.CREATE").await);
        assert!(set.matches("DEVICE.DELETE").await);
        assert!(!set.matches("USER.CREATE").await);
    }

    #[tokio::test]
    async fn test_pattern_set_dedup_and_remove() {
        let set = PatternSet::new();
        set.add("DEVICE.*").await.unwrap();
        set.add("DEVICE.*").await.unwrap();
        assert_eq!(set.len().await, 1);

        assert!(set.remove("DEVICE.*").await);
        assert!(!set.remove("DEVICE.*").await);
        assert!(set.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_pattern() {
        let set = PatternSet::new();
        let err = set.add("DEVICE.(").await.unwrap_err();
        assert!(matches!(err, BusError::InvalidPattern { .. }));
    }

    #[test]
    fn test_channel_message_wire_format() {
        let json = serde_json::to_string(&ChannelMessage::new("DEVICE.CREATE", "{}")).unwrap();
        assert_eq!(json, r#"{"channel":"DEVICE.CREATE","message":"{}"}"#);
    }
}
