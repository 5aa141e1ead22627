//! Message handlers and the pattern registry.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::sync::RwLock;
use wgfleet_events::{EventError, Message};

use crate::medium::compile_pattern;
use crate::BusError;

/// Error returned by a handler. Logged by the bus, never retried.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload did not decode.
    #[error("invalid payload: {0}")]
    Payload(#[from] EventError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Something that acts on delivered messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

/// A handler backed by a closure. See [`handler_fn`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (self.f)(message.clone()).await
    }
}

/// Wrap a closure as a handler.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

struct Registration {
    pattern: String,
    regex: Regex,
    handlers: Vec<Arc<dyn MessageHandler>>,
}

/// Handlers keyed by topic pattern, in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: RwLock<Vec<Registration>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append handlers under `pattern`.
    pub async fn register(
        &self,
        pattern: &str,
        handlers: Vec<Arc<dyn MessageHandler>>,
    ) -> Result<(), BusError> {
        let regex = compile_pattern(pattern)?;
        let mut entries = self.entries.write().await;

        match entries.iter_mut().find(|e| e.pattern == pattern) {
            Some(entry) => entry.handlers.extend(handlers),
            None => entries.push(Registration {
                pattern: pattern.to_string(),
                regex,
                handlers,
            }),
        }
        Ok(())
    }

    /// Remove every registered pattern whose regex matches `input`.
    ///
    /// Returns the removed patterns.
    pub async fn remove_matching(&self, input: &str) -> Vec<String> {
        let mut entries = self.entries.write().await;
        let mut removed = Vec::new();
        entries.retain(|e| {
            if e.regex.is_match(input) {
                removed.push(e.pattern.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Every handler registered under a pattern matching `topic`.
    pub async fn handlers_for(&self, topic: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.regex.is_match(topic))
            .flat_map(|e| e.handlers.iter().cloned())
            .collect()
    }

    /// Registered patterns, in registration order.
    pub async fn patterns(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .map(|e| e.pattern.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> Arc<dyn MessageHandler> {
        handler_fn(name, |_msg| async { Ok(()) })
    }

    #[tokio::test]
    async fn test_handlers_for_topic() {
        let registry = HandlerRegistry::new();
        registry
            .register("DEVICE.*", vec![noop("a"), noop("b")])
            .await
            .unwrap();
        registry.register("USER.CREATE", vec![noop("c")]).await.unwrap();

        let names: Vec<String> = registry
            .handlers_for("DEVICE.CREATE")
            .await
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(registry.handlers_for("ORG.CREATE").await.is_empty());
    }

    #[tokio::test]
    async fn test_register_appends_to_existing_pattern() {
        let registry = HandlerRegistry::new();
        registry.register("DEVICE.*", vec![noop("a")]).await.unwrap();
        registry.register("DEVICE.*", vec![noop("b")]).await.unwrap();

        assert_eq!(registry.patterns().await, vec!["DEVICE.*"]);
        assert_eq!(registry.handlers_for("DEVICE.DELETE").await.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_matches_registered_regex_against_input() {
        let registry = HandlerRegistry::new();
        registry.register("DEVICE.*", vec![noop("a")]).await.unwrap();
        registry.register("DEVICE.CREATE", vec![noop("b")]).await.unwrap();
        registry.register("USER.*", vec![noop("c")]).await.unwrap();

        let mut removed = registry.remove_matching("DEVICE.CREATE").await;
        removed.sort();
        assert_eq!(removed, vec!["DEVICE.*", "DEVICE.CREATE"]);
        assert_eq!(registry.patterns().await, vec!["USER.*"]);
    }

    #[tokio::test]
    async fn test_remove_with_broader_input_keeps_narrow_pattern() {
        let registry = HandlerRegistry::new();
        registry.register("DEVICE.CREATE", vec![noop("a")]).await.unwrap();

        // "DEVICE.CREATE" as a regex does not match the string "DEVICE.*".
        assert!(registry.remove_matching("DEVICE.*").await.is_empty());
        assert_eq!(registry.patterns().await, vec!["DEVICE.CREATE"]);
    }

    #[tokio::test]
    async fn test_closure_handler_error() {
        let handler = handler_fn("fails", |_msg| async {
            Err(HandlerError::Other(anyhow::anyhow!("boom")))
        });
        let err = handler
            .handle(&Message::new("DEVICE.CREATE", "{}"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(handler.name(), "fails");
    }
}
