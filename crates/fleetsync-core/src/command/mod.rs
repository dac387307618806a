// ── Command API ──
//
// Device writes are classified per code into three batches and each batch
// travels through the transport its local-strategy entry asks for.

pub mod routing;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

use fleetsync_api::wire::{CommandPayload, PropertyPayload};

use crate::model::SourceId;

pub use routing::{CommandRouter, classify};

/// One `(code, value)` write requested by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub code: String,
    pub value: Value,
}

impl DeviceCommand {
    pub fn new(code: impl Into<String>, value: Value) -> Self {
        Self {
            code: code.into(),
            value,
        }
    }
}

/// Transport and payload shape of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BatchKind {
    /// Regular command on the default transport.
    RegularDefault,
    /// Regular command on the alternate transport.
    RegularAlternate,
    /// Property update on the alternate transport.
    PropertyAlternate,
}

/// The batches a set of commands splits into.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommandPlan {
    pub device_id: String,
    /// `false` when no cache lists the device; the commands then go to the
    /// default source unmodified.
    pub known_device: bool,
    pub regular_default: Vec<CommandPayload>,
    pub regular_alternate: Vec<CommandPayload>,
    pub property_alternate: Vec<PropertyPayload>,
}

impl CommandPlan {
    pub fn is_empty(&self) -> bool {
        self.regular_default.is_empty()
            && self.regular_alternate.is_empty()
            && self.property_alternate.is_empty()
    }

    /// Non-empty batches with their sizes, in dispatch order.
    pub fn batches(&self) -> Vec<(BatchKind, usize)> {
        [
            (BatchKind::RegularDefault, self.regular_default.len()),
            (BatchKind::RegularAlternate, self.regular_alternate.len()),
            (BatchKind::PropertyAlternate, self.property_alternate.len()),
        ]
        .into_iter()
        .filter(|(_, n)| *n > 0)
        .collect()
    }
}

/// A batch that was handed to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchedBatch {
    pub kind: BatchKind,
    pub source_id: SourceId,
    pub count: usize,
}

/// Everything a `send_commands` call dispatched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    pub plan: CommandPlan,
    pub dispatched: Vec<DispatchedBatch>,
}
