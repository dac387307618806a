// ── Device record ──

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::capability::{CapabilitySpec, ValueType};
use super::strategy::LocalStrategy;

/// One resolved `(code, value)` pair on its way into `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPair {
    pub code: String,
    pub dp_id: Option<u32>,
    pub value: Value,
}

impl StatusPair {
    pub fn new(code: impl Into<String>, value: Value) -> Self {
        Self {
            code: code.into(),
            dp_id: None,
            value,
        }
    }
}

/// The canonical device type, as one cache (or the merged directory) sees it.
///
/// Every map may be partially populated; absent entries are the normal case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    /// Product category; selects the virtual state rules.
    pub category: String,
    pub product_id: String,
    pub product_name: String,
    pub online: bool,
    pub update_time: Option<DateTime<Utc>>,

    /// Current value per capability code.
    pub status: BTreeMap<String, Value>,
    /// Read-side value domains.
    pub status_range: BTreeMap<String, CapabilitySpec>,
    /// Writable capabilities.
    pub function: BTreeMap<String, CapabilitySpec>,
    pub local_strategy: LocalStrategy,
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    // ── Lookups ──────────────────────────────────────────────────────

    pub fn get_transport_id(&self, code: &str) -> Option<u32> {
        self.local_strategy.get_transport_id(code)
    }

    pub fn get_code(&self, id: u32) -> Option<&str> {
        self.local_strategy.get_code(id)
    }

    /// Whether the code appears anywhere in this record.
    pub fn knows_code(&self, code: &str) -> bool {
        self.status.contains_key(code)
            || self.status_range.contains_key(code)
            || self.function.contains_key(code)
            || self.local_strategy.contains_code(code)
    }

    /// Descriptor for `code`, preferring the writable one.
    pub fn spec_for(&self, code: &str) -> Option<&CapabilitySpec> {
        self.function
            .get(code)
            .or_else(|| self.status_range.get(code))
    }

    /// Declared value type of `code`, from the strategy entry or descriptors.
    pub fn value_type_of(&self, code: &str) -> ValueType {
        self.local_strategy
            .entry_for_code(code)
            .map(|(_, e)| e.config_item.value_type)
            .filter(|t| *t != ValueType::Unknown)
            .or_else(|| self.spec_for(code).map(|s| s.value_type))
            .unwrap_or_default()
    }

    // ── Mutation ─────────────────────────────────────────────────────

    /// Write resolved pairs into `status`, in order.
    pub fn write_pairs(&mut self, pairs: &[StatusPair]) {
        for pair in pairs {
            self.status.insert(pair.code.clone(), pair.value.clone());
        }
    }

    /// Union-merge another record of the same device into this one.
    ///
    /// Ranges, functions and status values are added or overwritten from
    /// `other`, never deleted. Strategy entries are unioned.
    pub fn absorb(&mut self, other: &DeviceRecord) {
        for (code, spec) in &other.status_range {
            self.status_range.insert(code.clone(), spec.clone());
        }
        for (code, spec) in &other.function {
            self.function.insert(code.clone(), spec.clone());
        }
        for (code, value) in &other.status {
            self.status.insert(code.clone(), value.clone());
        }
        self.local_strategy.absorb(&other.local_strategy);
    }
}
