// Wire types shared by both backends
//
// Shapes of bulk device listings, per-device capability metadata, push
// messages and outgoing writes. Fields use `#[serde(default)]` liberally
// because neither backend is consistent about field presence.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Push protocol numbers ────────────────────────────────────────────

/// Push message carrying a `status` array of reported values.
pub const PROTOCOL_DEVICE_REPORT: i64 = 4;

/// Push message carrying a `bizCode` lifecycle event in `bizData`.
pub const PROTOCOL_OTHER_EVENT: i64 = 20;

// ── Bulk refresh ─────────────────────────────────────────────────────

/// One device as listed by a backend's bulk refresh endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Product category, e.g. `"cz"` (socket) or `"wsdcg"` (climate sensor).
    #[serde(default)]
    pub category: String,
    #[serde(default, alias = "productId")]
    pub product_id: String,
    #[serde(default, alias = "productName")]
    pub product_name: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default, alias = "updateTime")]
    pub update_time: Option<i64>,
    #[serde(default)]
    pub status: Vec<StatusEntry>,
    /// Catch-all for undocumented fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A `(code, value)` pair inside a device listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub code: String,
    #[serde(default)]
    pub value: Value,
}

/// Per-device capability metadata, fetched after the bulk listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    #[serde(default)]
    pub status_range: Vec<CapabilityDescriptor>,
    #[serde(default)]
    pub function: Vec<CapabilityDescriptor>,
    /// Transport id → strategy entry. JSON object keys are the ids as strings.
    #[serde(default)]
    pub local_strategy: BTreeMap<u32, StrategyEntry>,
}

/// Value-domain descriptor of one capability code.
///
/// `values` is the backend's encoded constraint blob (a JSON string such as
/// `{"min":0,"max":100,"scale":1}`), kept opaque here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub code: String,
    #[serde(rename = "type", default)]
    pub value_type: String,
    #[serde(default)]
    pub values: String,
}

/// Local strategy entry: how one transport id maps onto a capability code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyEntry {
    pub status_code: String,
    #[serde(default)]
    pub config_item: ConfigItem,
    /// Writes for this code are property updates rather than commands.
    #[serde(default)]
    pub property_update: bool,
    /// Writes for this code go through the OpenAPI backend.
    #[serde(default)]
    pub use_open_api: bool,
}

/// Codec hints of a strategy entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigItem {
    #[serde(default)]
    pub value_type: String,
    #[serde(default)]
    pub value_desc: String,
    #[serde(default)]
    pub pid: Option<String>,
    #[serde(default)]
    pub status_format: String,
}

// ── Push messages ────────────────────────────────────────────────────

/// Inbound push message from either backend's message bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub protocol: i64,
    #[serde(default)]
    pub data: PushData,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushData {
    #[serde(default)]
    pub dev_id: Option<String>,
    #[serde(default)]
    pub biz_data: Option<BizData>,
    #[serde(default)]
    pub status: Option<Vec<ReportedStatus>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Lifecycle event payload (`online`, `offline`, `nameUpdate`, `delete`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BizData {
    #[serde(default)]
    pub dev_id: Option<String>,
    #[serde(default)]
    pub biz_code: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// One reported value. Either `code` or `dp_id` identifies the data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedStatus {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, rename = "dpId")]
    pub dp_id: Option<u32>,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub t: Option<i64>,
}

// ── Outgoing writes ──────────────────────────────────────────────────

/// Regular status command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub code: String,
    pub value: Value,
}

/// Property update. The value is always carried as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyPayload {
    pub code: String,
    pub value: String,
}
