// ── Capability descriptors ──

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Declared value type of a capability code.
///
/// Both backends spell these inconsistently (`"Boolean"` vs `"bool"`,
/// `"Integer"` vs `"value"`), so parsing is case-insensitive with aliases.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum ValueType {
    #[strum(to_string = "Boolean", serialize = "bool")]
    Boolean,
    #[strum(to_string = "Integer", serialize = "value")]
    Integer,
    Enum,
    String,
    Json,
    Raw,
    Bitmap,
    #[default]
    Unknown,
}

impl ValueType {
    /// Parse a backend spelling, falling back to [`ValueType::Unknown`].
    pub fn parse_lenient(raw: &str) -> Self {
        raw.trim().parse().unwrap_or_default()
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer)
    }
}

/// Value-domain descriptor of one code, as held in `status_range` or `function`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub code: String,
    pub value_type: ValueType,
    /// Encoded constraints (min/max/scale, enum range, ...), kept opaque.
    pub values: String,
}

impl CapabilitySpec {
    /// Clone this descriptor under another code.
    pub fn renamed(&self, code: &str) -> Self {
        Self {
            code: code.to_owned(),
            ..self.clone()
        }
    }
}
