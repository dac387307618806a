// ── Virtual state rules ──
//
// Declarative per-category rules that derive extra capability values from
// real ones. Rules are registered once from capability-description tables
// and applied at exactly two points: device load (`engine::apply_load_time_rules`)
// and inbound report (`engine::apply_report_time_rules`).

pub mod engine;

use std::collections::HashMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub use engine::{Derivation, apply_load_time_rules, apply_report_time_rules};

bitflags! {
    /// What a rule does with its source code. One rule may combine kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VirtualStateKind: u32 {
        /// Mirror the source value into every `copy_to` code.
        const COPY_TO_MULTIPLE = 0x0001;
        /// The reported payload is a delta; the stored value is a running total.
        const SUMMED_IN_REPORTING_PAYLOAD = 0x0002;
        /// Add the source's change to every `copy_delta_to` code.
        const COPY_DELTA_TO_MULTIPLE = 0x0004;
    }
}

/// Rule as written in a capability-description table.
///
/// ```json
/// { "key": "add_ele", "kind": 3, "copyToState": ["add_ele_total"], "copyDeltaToState": [] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDeclaration {
    pub key: String,
    pub kind: u32,
    #[serde(default)]
    pub copy_to_state: Vec<String>,
    #[serde(default)]
    pub copy_delta_to_state: Vec<String>,
}

/// A registered rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualStateRule {
    pub key: String,
    pub kind: VirtualStateKind,
    pub copy_to: Vec<String>,
    pub copy_delta_to: Vec<String>,
}

impl VirtualStateRule {
    pub fn copy(key: impl Into<String>, targets: &[&str]) -> Self {
        Self {
            key: key.into(),
            kind: VirtualStateKind::COPY_TO_MULTIPLE,
            copy_to: targets.iter().map(|t| (*t).to_owned()).collect(),
            copy_delta_to: Vec::new(),
        }
    }

    pub fn summed(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: VirtualStateKind::SUMMED_IN_REPORTING_PAYLOAD,
            copy_to: Vec::new(),
            copy_delta_to: Vec::new(),
        }
    }

    pub fn copy_delta(key: impl Into<String>, targets: &[&str]) -> Self {
        Self {
            key: key.into(),
            kind: VirtualStateKind::COPY_DELTA_TO_MULTIPLE,
            copy_to: Vec::new(),
            copy_delta_to: targets.iter().map(|t| (*t).to_owned()).collect(),
        }
    }

    /// Codes that get descriptors and strategy entries cloned at load time.
    pub(crate) fn load_time_targets(&self) -> impl Iterator<Item = &String> {
        let copy = self
            .kind
            .contains(VirtualStateKind::COPY_TO_MULTIPLE)
            .then_some(self.copy_to.iter());
        let delta = self
            .kind
            .contains(VirtualStateKind::COPY_DELTA_TO_MULTIPLE)
            .then_some(self.copy_delta_to.iter());
        copy.into_iter()
            .flatten()
            .chain(delta.into_iter().flatten())
            .filter(|t| **t != self.key)
    }

    fn merge(&mut self, other: &VirtualStateRule) {
        self.kind |= other.kind;
        for t in &other.copy_to {
            if !self.copy_to.contains(t) {
                self.copy_to.push(t.clone());
            }
        }
        for t in &other.copy_delta_to {
            if !self.copy_delta_to.contains(t) {
                self.copy_delta_to.push(t.clone());
            }
        }
    }
}

impl From<RuleDeclaration> for VirtualStateRule {
    fn from(decl: RuleDeclaration) -> Self {
        let kind = VirtualStateKind::from_bits_truncate(decl.kind);
        if kind.bits() != decl.kind {
            tracing::warn!(key = %decl.key, kind = decl.kind, "ignoring unknown virtual state kind bits");
        }
        Self {
            key: decl.key,
            kind,
            copy_to: decl.copy_to_state,
            copy_delta_to: decl.copy_delta_to_state,
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────

/// Rules per device category, in registration order.
///
/// Built once at startup and shared read-only afterwards. Registering the
/// same category again merges: rules with a known key gain the new kinds
/// and targets, new keys are appended.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    by_category: HashMap<String, Vec<VirtualStateRule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        category: impl Into<String>,
        rules: impl IntoIterator<Item = VirtualStateRule>,
    ) {
        let slot = self.by_category.entry(category.into()).or_default();
        for rule in rules {
            if let Some(existing) = slot.iter_mut().find(|r| r.key == rule.key) {
                existing.merge(&rule);
            } else {
                slot.push(rule);
            }
        }
    }

    pub fn register_declarations(
        &mut self,
        category: impl Into<String>,
        declarations: impl IntoIterator<Item = RuleDeclaration>,
    ) {
        self.register(
            category,
            declarations.into_iter().map(VirtualStateRule::from),
        );
    }

    /// The ordered rules for `category`; empty for unknown categories.
    pub fn rules_for(&self, category: &str) -> &[VirtualStateRule] {
        self.by_category.get(category).map_or(&[], Vec::as_slice)
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.by_category.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.by_category.values().all(Vec::is_empty)
    }
}

impl FromIterator<(String, Vec<RuleDeclaration>)> for RuleRegistry {
    fn from_iter<I: IntoIterator<Item = (String, Vec<RuleDeclaration>)>>(iter: I) -> Self {
        let mut registry = Self::new();
        for (category, decls) in iter {
            registry.register_declarations(category, decls);
        }
        registry
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn declaration_parses_camel_case() {
        let decl: RuleDeclaration = serde_json::from_value(json!({
            "key": "add_ele",
            "kind": 3,
            "copyToState": ["add_ele_total"]
        }))
        .unwrap();
        let rule = VirtualStateRule::from(decl);

        assert!(rule.kind.contains(VirtualStateKind::COPY_TO_MULTIPLE));
        assert!(rule.kind.contains(VirtualStateKind::SUMMED_IN_REPORTING_PAYLOAD));
        assert!(!rule.kind.contains(VirtualStateKind::COPY_DELTA_TO_MULTIPLE));
        assert_eq!(rule.copy_to, vec!["add_ele_total".to_owned()]);
    }

    #[test]
    fn unknown_kind_bits_are_dropped() {
        let rule = VirtualStateRule::from(RuleDeclaration {
            key: "x".into(),
            kind: 0x0101,
            copy_to_state: vec![],
            copy_delta_to_state: vec![],
        });
        assert_eq!(rule.kind, VirtualStateKind::COPY_TO_MULTIPLE);
    }

    #[test]
    fn re_registration_merges_by_key() {
        let mut registry = RuleRegistry::new();
        registry.register("cz", [VirtualStateRule::copy("add_ele", &["a"])]);
        registry.register(
            "cz",
            [
                VirtualStateRule::summed("add_ele"),
                VirtualStateRule::copy("add_ele", &["a", "b"]),
                VirtualStateRule::copy("cur_power", &["p"]),
            ],
        );

        let rules = registry.rules_for("cz");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].key, "add_ele");
        assert_eq!(
            rules[0].kind,
            VirtualStateKind::COPY_TO_MULTIPLE | VirtualStateKind::SUMMED_IN_REPORTING_PAYLOAD
        );
        assert_eq!(rules[0].copy_to, vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(rules[1].key, "cur_power");
    }

    #[test]
    fn unknown_category_has_no_rules() {
        let registry = RuleRegistry::new();
        assert!(registry.rules_for("kg").is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn load_time_targets_ignore_self_reference() {
        let mut rule = VirtualStateRule::copy("x", &["x", "y"]);
        rule.kind |= VirtualStateKind::COPY_DELTA_TO_MULTIPLE;
        rule.copy_delta_to = vec!["z".into()];

        let targets: Vec<&String> = rule.load_time_targets().collect();
        assert_eq!(targets, vec!["y", "z"]);
    }
}
