// ── Domain model ──
//
// Canonical in-memory types shared by the caches, the rule engine and the
// routers. Wire shapes live in `fleetsync_api::wire`; `crate::convert`
// bridges the two.

pub mod capability;
pub mod device;
pub mod source;
pub mod strategy;
pub mod value;

pub use capability::{CapabilitySpec, ValueType};
pub use device::{DeviceRecord, StatusPair};
pub use source::{SourceId, SourceKind};
pub use strategy::{CodecHints, LocalStrategy, StrategyEntry, VIRTUAL_ID_BASE};
