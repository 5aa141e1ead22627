//! Bus handlers that apply device events to the interface.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tracing::info;
use wgfleet_bus::{BusError, HandlerError, MessageHandler, PubSubClient};
use wgfleet_events::{topics, Device, DevicePayload, Message};

use crate::interface::InterfaceControl;

fn device_from(message: &Message) -> Result<Device, HandlerError> {
    let payload: DevicePayload = message.decode_payload()?;
    payload
        .device
        .ok_or_else(|| HandlerError::Other(anyhow!("{} payload has no device", message.topic)))
}

/// `DEVICE.CREATE`: configure the peer.
pub struct CreateDeviceHandler {
    interface: Arc<dyn InterfaceControl>,
}

impl CreateDeviceHandler {
    pub fn new(interface: Arc<dyn InterfaceControl>) -> Self {
        Self { interface }
    }
}

#[async_trait]
impl MessageHandler for CreateDeviceHandler {
    fn name(&self) -> &str {
        "create_device"
    }

    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let device = device_from(message)?;
        info!(public_key = %device.public_key, address = %device.address, "Received create device message");

        self.interface
            .add_peer(&device.public_key, &device.address)
            .await
            .context("failed to add peer")?;
        Ok(())
    }
}

/// `DEVICE.DELETE`: remove the peer.
pub struct DeleteDeviceHandler {
    interface: Arc<dyn InterfaceControl>,
}

impl DeleteDeviceHandler {
    pub fn new(interface: Arc<dyn InterfaceControl>) -> Self {
        Self { interface }
    }
}

#[async_trait]
impl MessageHandler for DeleteDeviceHandler {
    fn name(&self) -> &str {
        "delete_device"
    }

    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let device = device_from(message)?;
        info!(public_key = %device.public_key, "Received delete device message");

        self.interface
            .remove_peer(&device.public_key)
            .await
            .context("failed to remove peer")?;
        Ok(())
    }
}

/// Register the device handlers on `bus`.
pub async fn subscribe_device_handlers(
    bus: &PubSubClient,
    interface: Arc<dyn InterfaceControl>,
) -> Result<(), BusError> {
    let create: Arc<dyn MessageHandler> = Arc::new(CreateDeviceHandler::new(interface.clone()));
    let delete: Arc<dyn MessageHandler> = Arc::new(DeleteDeviceHandler::new(interface));

    bus.subscribe(topics::DEVICE_CREATE, vec![create]).await?;
    bus.subscribe(topics::DEVICE_DELETE, vec![delete]).await
}
