//! Claim-check publish/subscribe bus.
//!
//! Messages are stored in a shared key-value medium under a per-topic
//! sequence number (`{topic}.{seq}`, 24h TTL) and only a small pointer
//! `{Topic, Key}` is broadcast. Every replica subscribed to a matching
//! pattern races for `lock.{topic}.{seq}` (set-if-absent, 15s TTL); the
//! winner fetches the envelope and runs its handlers concurrently.
//!
//! Two media are provided:
//!
//! - [`MemoryBackend`]: in-process, for development and tests
//! - [`PgMedium`]: Postgres tables plus `LISTEN`/`NOTIFY`
//!
//! Handler spans join the publisher's trace through the `traceparent`
//! carried in the envelope metadata.

mod client;
mod error;
mod handler;
mod medium;
mod memory;
mod postgres;
mod propagation;

pub use client::{BusConfig, ClaimOutcome, PubSubClient, DEFAULT_LOCK_TTL, DEFAULT_PAYLOAD_TTL};
pub use error::BusError;
pub use handler::{handler_fn, FnHandler, HandlerError, HandlerRegistry, MessageHandler};
pub use medium::{compile_pattern, BusMedium, ChannelMessage, PatternSet, DELIVERY_BUFFER};
pub use memory::{MemoryBackend, MemoryMedium};
pub use postgres::{PgMedium, DEFAULT_PURGE_INTERVAL, NOTIFY_CHANNEL};
pub use propagation::{extract_parent, inject_span, trace_id, TRACEPARENT};
