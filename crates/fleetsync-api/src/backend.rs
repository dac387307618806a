//! Device backend seam.
//!
//! One implementation per backend account. The core never talks HTTP
//! itself: request signing, token refresh and pagination all live behind
//! this trait.

use async_trait::async_trait;

use crate::error::Error;
use crate::wire::{CommandPayload, DeviceCapabilities, DeviceDescriptor, PropertyPayload};

/// Read/write access to one backend account's devices.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// List every device the account can see.
    async fn fetch_devices(&self) -> Result<Vec<DeviceDescriptor>, Error>;

    /// Fetch extended capability metadata (ranges, functions, local strategy)
    /// for a single device.
    async fn fetch_capabilities(&self, device_id: &str) -> Result<DeviceCapabilities, Error>;

    /// Issue regular status commands.
    async fn send_commands(
        &self,
        device_id: &str,
        commands: &[CommandPayload],
    ) -> Result<(), Error>;

    /// Issue property updates.
    async fn send_properties(
        &self,
        device_id: &str,
        properties: &[PropertyPayload],
    ) -> Result<(), Error>;
}
