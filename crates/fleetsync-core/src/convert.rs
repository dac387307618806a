// ── Wire-to-domain conversions ──
//
// Bridges `fleetsync_api::wire` listing and capability types into the
// canonical `DeviceRecord`. Value types are parsed leniently; timestamps
// are epoch milliseconds on the wire.

use chrono::{DateTime, Utc};

use fleetsync_api::wire;

use crate::command::DeviceCommand;
use crate::model::{
    CapabilitySpec, CodecHints, DeviceRecord, LocalStrategy, StrategyEntry, ValueType,
};

fn millis_to_datetime(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(DateTime::from_timestamp_millis)
}

impl From<wire::CapabilityDescriptor> for CapabilitySpec {
    fn from(d: wire::CapabilityDescriptor) -> Self {
        Self {
            value_type: ValueType::parse_lenient(&d.value_type),
            code: d.code,
            values: d.values,
        }
    }
}

impl From<wire::ConfigItem> for CodecHints {
    fn from(c: wire::ConfigItem) -> Self {
        Self {
            value_type: ValueType::parse_lenient(&c.value_type),
            value_desc: c.value_desc,
            pid: c.pid,
            status_format: c.status_format,
        }
    }
}

impl From<wire::StrategyEntry> for StrategyEntry {
    fn from(e: wire::StrategyEntry) -> Self {
        Self {
            status_code: e.status_code,
            config_item: e.config_item.into(),
            property_update: e.property_update,
            use_open_api: e.use_open_api,
        }
    }
}

impl From<wire::DeviceDescriptor> for DeviceRecord {
    fn from(d: wire::DeviceDescriptor) -> Self {
        Self {
            id: d.id,
            name: d.name,
            category: d.category,
            product_id: d.product_id,
            product_name: d.product_name,
            online: d.online,
            update_time: millis_to_datetime(d.update_time),
            status: d.status.into_iter().map(|s| (s.code, s.value)).collect(),
            ..Self::default()
        }
    }
}

/// Install capability metadata on a freshly listed record.
///
/// Descriptors and strategy entries replace whatever the record held;
/// status values are left alone.
pub(crate) fn apply_capabilities(record: &mut DeviceRecord, caps: wire::DeviceCapabilities) {
    record.status_range = caps
        .status_range
        .into_iter()
        .map(|d| (d.code.clone(), CapabilitySpec::from(d)))
        .collect();
    record.function = caps
        .function
        .into_iter()
        .map(|d| (d.code.clone(), CapabilitySpec::from(d)))
        .collect();
    record.local_strategy = caps
        .local_strategy
        .into_iter()
        .map(|(id, e)| (id, StrategyEntry::from(e)))
        .collect::<LocalStrategy>();
}

impl From<&DeviceCommand> for wire::CommandPayload {
    fn from(c: &DeviceCommand) -> Self {
        Self {
            code: c.code.clone(),
            value: c.value.clone(),
        }
    }
}
