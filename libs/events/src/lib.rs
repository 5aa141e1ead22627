//! # wgfleet-events
//!
//! Event type definitions and wire formats for the device fleet.
//!
//! ## Design Principles
//!
//! - The broadcast channel only ever carries a small [`Pointer`]
//! - The full [`Message`] envelope lives in the payload store, keyed by pointer
//! - Envelopes carry trace propagation headers across process boundaries
//!
//! ## Keys
//!
//! For a topic `T` and sequence `n`:
//! - `T.nextId` holds the per-topic sequence counter
//! - `T.n` holds the serialized envelope
//! - `lock.T.n` is the single-winner claim marker
//!
//! ## Event Types
//!
//! Device lifecycle events (`DEVICE.*`) carry a [`DevicePayload`].

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
