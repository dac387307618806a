// ── Local strategy table ──
//
// Per-device mapping between numeric transport ids and capability codes.
// All lookups are pure and only ever consult the owning device's table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::capability::ValueType;

/// Lowest transport id handed out to derived (virtual) codes. Real ids from
/// both backends stay well below this.
pub const VIRTUAL_ID_BASE: u32 = 10_000;

/// Codec hints attached to a strategy entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecHints {
    pub value_type: ValueType,
    pub value_desc: String,
    pub pid: Option<String>,
    pub status_format: String,
}

/// How one transport id maps onto a capability code and how writes for it
/// travel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyEntry {
    pub status_code: String,
    pub config_item: CodecHints,
    pub property_update: bool,
    pub use_open_api: bool,
}

impl StrategyEntry {
    /// Clone this entry under another code.
    pub fn renamed(&self, code: &str) -> Self {
        Self {
            status_code: code.to_owned(),
            ..self.clone()
        }
    }
}

/// Transport id → strategy entry, ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalStrategy {
    entries: BTreeMap<u32, StrategyEntry>,
}

impl LocalStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport id mapped to `code`. When several ids carry the same code
    /// the lowest wins.
    pub fn get_transport_id(&self, code: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|(_, e)| e.status_code == code)
            .map(|(id, _)| *id)
    }

    /// Capability code mapped to transport id `id`.
    pub fn get_code(&self, id: u32) -> Option<&str> {
        self.entries.get(&id).map(|e| e.status_code.as_str())
    }

    pub fn get(&self, id: u32) -> Option<&StrategyEntry> {
        self.entries.get(&id)
    }

    /// Entry for `code` along with its transport id.
    pub fn entry_for_code(&self, code: &str) -> Option<(u32, &StrategyEntry)> {
        self.entries
            .iter()
            .find(|(_, e)| e.status_code == code)
            .map(|(id, e)| (*id, e))
    }

    pub fn contains_code(&self, code: &str) -> bool {
        self.get_transport_id(code).is_some()
    }

    /// Lowest unused id at or above [`VIRTUAL_ID_BASE`], found by probing
    /// upward. `None` only if the id space above the base is exhausted.
    pub fn allocate_free_id(&self) -> Option<u32> {
        (VIRTUAL_ID_BASE..=u32::MAX).find(|id| !self.entries.contains_key(id))
    }

    /// Insert or replace the entry at `id`.
    pub fn insert(&mut self, id: u32, entry: StrategyEntry) -> Option<StrategyEntry> {
        self.entries.insert(id, entry)
    }

    /// Union `other` into `self`. An entry is skipped when `self` already
    /// maps its code, or already uses its real id for a different code.
    /// Virtual ids are allocated per cache, so a colliding virtual entry is
    /// re-numbered instead. Returns the number of entries added.
    pub fn absorb(&mut self, other: &LocalStrategy) -> usize {
        let mut added = 0;
        for (id, entry) in &other.entries {
            if self.contains_code(&entry.status_code) {
                continue;
            }
            let target = if self.entries.contains_key(id) {
                let renumbered = if *id >= VIRTUAL_ID_BASE {
                    self.allocate_free_id()
                } else {
                    None
                };
                let Some(free) = renumbered else {
                    continue;
                };
                free
            } else {
                *id
            };
            self.entries.insert(target, entry.clone());
            added += 1;
        }
        added
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &StrategyEntry)> {
        self.entries.iter().map(|(id, e)| (*id, e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(u32, StrategyEntry)> for LocalStrategy {
    fn from_iter<I: IntoIterator<Item = (u32, StrategyEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn entry(code: &str) -> StrategyEntry {
        StrategyEntry {
            status_code: code.into(),
            config_item: CodecHints::default(),
            property_update: false,
            use_open_api: false,
        }
    }

    #[test]
    fn lookups_in_both_directions() {
        let table: LocalStrategy = [(1, entry("switch_1")), (18, entry("cur_current"))]
            .into_iter()
            .collect();

        assert_eq!(table.get_transport_id("cur_current"), Some(18));
        assert_eq!(table.get_code(1), Some("switch_1"));
        assert_eq!(table.get_transport_id("missing"), None);
        assert_eq!(table.get_code(99), None);
    }

    #[test]
    fn allocate_starts_at_base() {
        let table: LocalStrategy = [(1, entry("a"))].into_iter().collect();
        assert_eq!(table.allocate_free_id(), Some(VIRTUAL_ID_BASE));
    }

    #[test]
    fn allocate_probes_past_used_ids() {
        let table: LocalStrategy = [
            (VIRTUAL_ID_BASE, entry("a")),
            (VIRTUAL_ID_BASE + 1, entry("b")),
            (VIRTUAL_ID_BASE + 3, entry("c")),
        ]
        .into_iter()
        .collect();
        assert_eq!(table.allocate_free_id(), Some(VIRTUAL_ID_BASE + 2));
    }

    #[test]
    fn allocate_is_deterministic_without_insert() {
        let table = LocalStrategy::new();
        assert_eq!(table.allocate_free_id(), table.allocate_free_id());
    }

    #[test]
    fn absorb_skips_known_codes_and_taken_ids() {
        let mut mine: LocalStrategy = [(1, entry("switch_1"))].into_iter().collect();
        let theirs: LocalStrategy = [
            (1, entry("other")),
            (2, entry("switch_1")),
            (3, entry("countdown_1")),
        ]
        .into_iter()
        .collect();

        assert_eq!(mine.absorb(&theirs), 1);
        assert_eq!(mine.get_code(1), Some("switch_1"));
        assert_eq!(mine.get_code(2), None);
        assert_eq!(mine.get_code(3), Some("countdown_1"));
    }

    #[test]
    fn absorb_renumbers_colliding_virtual_ids() {
        let mut mine: LocalStrategy = [(VIRTUAL_ID_BASE, entry("power_a"))].into_iter().collect();
        let theirs: LocalStrategy = [(VIRTUAL_ID_BASE, entry("power_b"))].into_iter().collect();

        assert_eq!(mine.absorb(&theirs), 1);
        assert_eq!(mine.get_code(VIRTUAL_ID_BASE), Some("power_a"));
        assert_eq!(mine.get_transport_id("power_b"), Some(VIRTUAL_ID_BASE + 1));
    }

    #[test]
    fn serializes_as_plain_map() {
        let table: LocalStrategy = [(7, entry("temp"))].into_iter().collect();
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json["7"]["status_code"], "temp");
    }
}
