//! Publish/subscribe client.
//!
//! Publishing stores the envelope under a per-topic sequence number and
//! broadcasts only a pointer to it. Every subscribed replica receives the
//! pointer, but only the one that wins the claim lock fetches the envelope
//! and runs its handlers.
//!
//! Per-message and per-handler tasks are tracked, and [`PubSubClient::run`]
//! waits for them after shutdown is signalled.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, field, info, info_span, warn, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use wgfleet_events::{sequence_key, Message, Pointer};

use crate::handler::{HandlerRegistry, MessageHandler};
use crate::medium::{compile_pattern, BusMedium, ChannelMessage};
use crate::propagation::{extract_parent, inject_span, trace_id};
use crate::BusError;

/// How long a published envelope stays retrievable.
pub const DEFAULT_PAYLOAD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// How long a claim lock is held.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(15);

/// Bus timing configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub payload_ttl: Duration,
    pub lock_ttl: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            payload_ttl: DEFAULT_PAYLOAD_TTL,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }
}

/// Result of trying to claim a pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This consumer holds the lock and the envelope was fetched.
    Claimed(Message),

    /// The lock was not acquired: another consumer claimed the pointer
    /// first, or the medium refused the write.
    LockHeld,

    /// The lock was taken but the envelope is gone (expired or never stored).
    Missing,
}

/// Client for one process. Cheap to clone.
#[derive(Clone)]
pub struct PubSubClient {
    medium: Arc<dyn BusMedium>,
    registry: Arc<HandlerRegistry>,
    config: BusConfig,
    tasks: TaskTracker,
}

impl PubSubClient {
    pub fn new(medium: Arc<dyn BusMedium>) -> Self {
        Self::with_config(medium, BusConfig::default())
    }

    pub fn with_config(medium: Arc<dyn BusMedium>, config: BusConfig) -> Self {
        Self {
            medium,
            registry: Arc::new(HandlerRegistry::new()),
            config,
            tasks: TaskTracker::new(),
        }
    }

    /// Handler registry of this client.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Store the envelope and broadcast a pointer to it.
    ///
    /// The context of a `bus_publish` span, a child of the caller's span, is
    /// injected into the metadata unless a `traceparent` is already present.
    /// Once this returns, the envelope is retrievable for the payload TTL.
    pub async fn publish(&self, mut message: Message) -> Result<Pointer, BusError> {
        if message.is_empty() {
            return Err(BusError::EmptyMessage);
        }

        let span = info_span!("bus_publish", topic = %message.topic);
        inject_span(&span, &mut message.metadata.otel_trace_header);
        self.store_and_broadcast(message).instrument(span).await
    }

    async fn store_and_broadcast(&self, message: Message) -> Result<Pointer, BusError> {
        let seq = self.medium.incr(&sequence_key(&message.topic)).await?;
        let pointer = Pointer::new(message.topic.clone(), seq);

        self.medium
            .set_ex(
                &pointer.payload_key(),
                &message.to_json()?,
                self.config.payload_ttl,
            )
            .await?;
        self.medium
            .publish(&message.topic, &pointer.to_json()?)
            .await?;

        debug!(topic = %message.topic, seq, "Published message");
        Ok(pointer)
    }

    /// Register handlers for topics matching `pattern`.
    pub async fn subscribe(
        &self,
        pattern: &str,
        handlers: Vec<Arc<dyn MessageHandler>>,
    ) -> Result<(), BusError> {
        compile_pattern(pattern)?;

        if let Err(e) = self.medium.psubscribe(pattern).await {
            error!(pattern, error = %e, "Failed to subscribe on the medium");
        }

        let count = handlers.len();
        self.registry.register(pattern, handlers).await?;
        info!(pattern, handlers = count, "Subscribed");
        Ok(())
    }

    /// Drop every registered pattern whose regex matches `pattern`.
    pub async fn unsubscribe(&self, pattern: &str) -> Result<(), BusError> {
        for removed in self.registry.remove_matching(pattern).await {
            if let Err(e) = self.medium.punsubscribe(&removed).await {
                error!(pattern = %removed, error = %e, "Failed to unsubscribe on the medium");
            }
            info!(pattern = %removed, "Unsubscribed");
        }
        Ok(())
    }

    /// Try to take the lock for `pointer` and fetch its envelope.
    ///
    /// A medium error while taking the lock counts as not acquired. Errors
    /// fetching or decoding the envelope are returned.
    pub async fn claim(&self, pointer: &Pointer) -> Result<ClaimOutcome, BusError> {
        let lock_ttl = chrono::Duration::from_std(self.config.lock_ttl)
            .map_err(|e| BusError::Medium(e.to_string()))?;
        let expiry = (Utc::now() + lock_ttl).to_rfc3339();

        match self
            .medium
            .set_nx_ex(&pointer.lock_key(), &expiry, self.config.lock_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => return Ok(ClaimOutcome::LockHeld),
            Err(e) => {
                debug!(lock = %pointer.lock_key(), error = %e, "Lock not acquired");
                return Ok(ClaimOutcome::LockHeld);
            }
        }

        let Some(raw) = self.medium.get(&pointer.payload_key()).await? else {
            return Ok(ClaimOutcome::Missing);
        };

        Message::from_json(&raw)
            .map(ClaimOutcome::Claimed)
            .map_err(|e| BusError::MalformedEnvelope(e.to_string()))
    }

    /// Run every handler matching the message's topic, each in its own task.
    pub async fn dispatch(&self, message: Message) -> Vec<JoinHandle<()>> {
        if message.is_empty() {
            return Vec::new();
        }

        let handlers = self.registry.handlers_for(&message.topic).await;
        if handlers.is_empty() {
            debug!(topic = %message.topic, "No handlers for topic");
            return Vec::new();
        }

        let parent = extract_parent(&message.metadata.otel_trace_header);
        let message = Arc::new(message);

        handlers
            .into_iter()
            .map(|handler| {
                let span = info_span!(
                    "bus_handler",
                    topic = %message.topic,
                    handler = %handler.name(),
                    trace_id = field::Empty,
                );
                if let Some(parent) = parent.clone() {
                    let _ = span.set_parent(parent);
                }
                if let Some(id) = trace_id(&span.context()) {
                    span.record("trace_id", id.as_str());
                }
                let message = message.clone();

                self.tasks.spawn(
                    async move {
                        match handler.handle(&message).await {
                            Ok(()) => debug!("Handler completed"),
                            Err(e) => error!(
                                error = %e,
                                payload = %message.payload,
                                "Handler failed"
                            ),
                        }
                    }
                    .instrument(span),
                )
            })
            .collect()
    }

    /// Consume pointers until shutdown is signalled.
    ///
    /// Each pointer is processed in its own task. After shutdown no new
    /// pointers are taken, and this waits for every task already spawned by
    /// this client (and its clones) to finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), BusError> {
        let mut deliveries = self.medium.messages().await?;
        info!("Bus consumer started");

        loop {
            tokio::select! {
                delivery = deliveries.recv() => {
                    let Some(delivery) = delivery else {
                        warn!("Bus delivery stream closed");
                        break;
                    };
                    let client = self.clone();
                    self.tasks.spawn(async move { client.process(delivery).await });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Bus consumer shutting down");
                        break;
                    }
                }
            }
        }

        self.tasks.close();
        if !self.tasks.is_empty() {
            info!(tasks = self.tasks.len(), "Waiting for in-flight bus tasks");
        }
        self.tasks.wait().await;
        self.tasks.reopen();
        info!("Bus consumer stopped");
        Ok(())
    }

    async fn process(&self, delivery: ChannelMessage) {
        let pointer = match Pointer::from_json(&delivery.message) {
            Ok(pointer) => pointer,
            Err(e) => {
                let err = BusError::MalformedPointer(e.to_string());
                error!(channel = %delivery.channel, error = %err, "Dropping delivery");
                return;
            }
        };

        match self.claim(&pointer).await {
            Ok(ClaimOutcome::Claimed(message)) => {
                debug!(topic = %pointer.topic, seq = pointer.key, "Claimed message");
                self.dispatch(message).await;
            }
            Ok(ClaimOutcome::LockHeld) => {
                debug!(topic = %pointer.topic, seq = pointer.key, "Message claimed elsewhere");
            }
            Ok(ClaimOutcome::Missing) => {
                info!(topic = %pointer.topic, seq = pointer.key, "Message payload expired or missing");
            }
            Err(e) => {
                error!(topic = %pointer.topic, seq = pointer.key, error = %e, "Failed to fetch claimed message");
            }
        }
    }
}
