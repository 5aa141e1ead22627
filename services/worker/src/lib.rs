//! wgfleet worker library.
//!
//! The worker keeps a WireGuard interface converged to the device records:
//!
//! - **Startup sync**: removes orphaned peers and re-adds every recorded peer
//! - **Bus handlers**: apply `DEVICE.CREATE` / `DEVICE.DELETE` as they arrive
//! - **Metadata poller**: writes live endpoint, transfer and handshake data
//!   back to the records
//!
//! The binary wires these together; the modules are exposed for
//! integration tests and for an API layer to reuse.

pub mod config;
pub mod db;
pub mod devices;
pub mod handlers;
pub mod interface;
pub mod metadata;
pub mod store;
pub mod sync;

pub use devices::{DeviceError, DeviceOwner, DeviceService, ServerInfo};
pub use interface::{InterfaceControl, InterfaceError, MockInterface, WgCommandInterface};
pub use metadata::{MetadataPoller, PollReport};
pub use store::{DeviceStore, MemoryDeviceStore, PgDeviceStore, StoreError, Telemetry};
pub use sync::Reconciler;
