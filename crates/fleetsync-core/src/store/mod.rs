// ── Per-source caches and their aggregation ──

mod aggregator;
mod merge;
mod source_cache;

use std::collections::BTreeMap;

use crate::model::DeviceRecord;

pub use aggregator::{Aggregator, RefreshReport};
pub use source_cache::{DeviceEventOutcome, SourceCache};

/// Device id → record, ordered by id.
pub type DeviceMap = BTreeMap<String, DeviceRecord>;
