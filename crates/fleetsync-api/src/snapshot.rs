//! File-backed device backend.
//!
//! Reads a JSON snapshot of an account (device listing plus per-device
//! capability metadata) and records outgoing writes instead of sending
//! them. The file is re-read on every bulk fetch so edits show up on the
//! next refresh.
//!
//! ```json
//! {
//!   "devices": [{ "id": "d1", "category": "cz", "status": [{ "code": "switch_1", "value": true }] }],
//!   "capabilities": { "d1": { "status_range": [], "function": [], "local_strategy": {} } }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::backend::DeviceBackend;
use crate::error::Error;
use crate::wire::{CommandPayload, DeviceCapabilities, DeviceDescriptor, PropertyPayload};

/// Parsed contents of a snapshot file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
    #[serde(default)]
    pub capabilities: BTreeMap<String, DeviceCapabilities>,
}

impl Snapshot {
    pub fn parse(body: &str) -> Result<Self, Error> {
        serde_json::from_str(body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: body.to_owned(),
        })
    }
}

/// A write the backend accepted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordedWrite {
    Commands {
        device_id: String,
        commands: Vec<CommandPayload>,
    },
    Properties {
        device_id: String,
        properties: Vec<PropertyPayload>,
    },
}

pub struct SnapshotBackend {
    path: Option<PathBuf>,
    snapshot: Mutex<Snapshot>,
    writes: Mutex<Vec<RecordedWrite>>,
}

impl SnapshotBackend {
    /// Backend that reads `path` on every bulk fetch.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            snapshot: Mutex::new(Snapshot::default()),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Backend serving a fixed in-memory snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            path: None,
            snapshot: Mutex::new(snapshot),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Replace the in-memory snapshot (ignored on the next fetch if file-backed).
    pub async fn replace(&self, snapshot: Snapshot) {
        *self.snapshot.lock().await = snapshot;
    }

    pub async fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().await.clone()
    }

    async fn reload(&self) -> Result<(), Error> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let body = tokio::fs::read_to_string(path).await?;
        let parsed = Snapshot::parse(&body)?;
        tracing::debug!(
            path = %path.display(),
            devices = parsed.devices.len(),
            "loaded device snapshot"
        );
        *self.snapshot.lock().await = parsed;
        Ok(())
    }

    async fn require_device(&self, device_id: &str) -> Result<(), Error> {
        let snap = self.snapshot.lock().await;
        if snap.devices.iter().any(|d| d.id == device_id) {
            Ok(())
        } else {
            Err(Error::UnknownDevice {
                device_id: device_id.to_owned(),
            })
        }
    }
}

#[async_trait]
impl DeviceBackend for SnapshotBackend {
    async fn fetch_devices(&self) -> Result<Vec<DeviceDescriptor>, Error> {
        self.reload().await?;
        Ok(self.snapshot.lock().await.devices.clone())
    }

    async fn fetch_capabilities(&self, device_id: &str) -> Result<DeviceCapabilities, Error> {
        self.require_device(device_id).await?;
        Ok(self
            .snapshot
            .lock()
            .await
            .capabilities
            .get(device_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_commands(
        &self,
        device_id: &str,
        commands: &[CommandPayload],
    ) -> Result<(), Error> {
        self.require_device(device_id).await?;
        tracing::info!(device_id, count = commands.len(), "recorded commands");
        self.writes.lock().await.push(RecordedWrite::Commands {
            device_id: device_id.to_owned(),
            commands: commands.to_vec(),
        });
        Ok(())
    }

    async fn send_properties(
        &self,
        device_id: &str,
        properties: &[PropertyPayload],
    ) -> Result<(), Error> {
        self.require_device(device_id).await?;
        tracing::info!(device_id, count = properties.len(), "recorded property updates");
        self.writes.lock().await.push(RecordedWrite::Properties {
            device_id: device_id.to_owned(),
            properties: properties.to_vec(),
        });
        Ok(())
    }
}
