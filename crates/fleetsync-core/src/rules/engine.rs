// ── Rule application ──
//
// The two entry points that evaluate virtual state rules. Both are pure
// functions of their inputs; the per-source cache calls them inside its
// write lock.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, trace};

use super::{VirtualStateKind, VirtualStateRule};
use crate::model::{DeviceRecord, StatusPair, value};

/// What a load-time pass added to a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Derivation {
    pub values: usize,
    pub descriptors: usize,
    pub strategy_entries: usize,
}

impl Derivation {
    pub fn is_empty(&self) -> bool {
        self.values == 0 && self.descriptors == 0 && self.strategy_entries == 0
    }
}

/// Materialize copy targets on a freshly loaded record.
///
/// For every copy rule whose source has a value and a range or function
/// descriptor, each target receives the value, the renamed descriptors and
/// a cloned strategy entry under a newly allocated transport id. Every
/// write is gated on the target lacking that field, so repeated calls are
/// no-ops.
pub fn apply_load_time_rules(rules: &[VirtualStateRule], device: &mut DeviceRecord) -> Derivation {
    let mut derived = Derivation::default();

    for rule in rules {
        let Some(source_value) = device.status.get(&rule.key).cloned() else {
            trace!(device_id = %device.id, code = %rule.key, "rule source has no value, skipping");
            continue;
        };
        let range = device.status_range.get(&rule.key).cloned();
        let function = device.function.get(&rule.key).cloned();
        if range.is_none() && function.is_none() {
            trace!(device_id = %device.id, code = %rule.key, "rule source has no descriptor, skipping");
            continue;
        }
        let source_entry = device
            .local_strategy
            .entry_for_code(&rule.key)
            .map(|(_, e)| e.clone());

        for target in rule.load_time_targets() {
            if !device.status.contains_key(target) {
                device.status.insert(target.clone(), source_value.clone());
                derived.values += 1;
            }
            if let Some(ref spec) = range {
                if !device.status_range.contains_key(target) {
                    device.status_range.insert(target.clone(), spec.renamed(target));
                    derived.descriptors += 1;
                }
            }
            if let Some(ref spec) = function {
                if !device.function.contains_key(target) {
                    device.function.insert(target.clone(), spec.renamed(target));
                    derived.descriptors += 1;
                }
            }
            if let Some(ref entry) = source_entry {
                if !device.local_strategy.contains_code(target) {
                    if let Some(id) = device.local_strategy.allocate_free_id() {
                        device.local_strategy.insert(id, entry.renamed(target));
                        derived.strategy_entries += 1;
                    }
                }
            }
        }
    }

    if !derived.is_empty() {
        debug!(device_id = %device.id, ?derived, "applied load-time virtual states");
    }
    derived
}

/// Rewrite an incoming report before it is merged into `status`.
///
/// Summed codes have the stored running total added to the payload.
/// Copy codes fan out to their targets. Copy-delta codes add the change in
/// the source value to each target's stored value. Returns a new list; the
/// input is left untouched. Pairs without a matching rule pass through.
pub fn apply_report_time_rules(
    rules: &[VirtualStateRule],
    device: &DeviceRecord,
    incoming: &[StatusPair],
) -> Vec<StatusPair> {
    let mut out = Vec::with_capacity(incoming.len());
    // Values produced earlier in this batch, so repeated codes accumulate in order.
    let mut pending: BTreeMap<String, Value> = BTreeMap::new();

    let stored = |pending: &BTreeMap<String, Value>, code: &str| -> Option<Value> {
        pending
            .get(code)
            .or_else(|| device.status.get(code))
            .cloned()
    };

    for pair in incoming {
        let Some(rule) = rules.iter().find(|r| r.key == pair.code) else {
            out.push(pair.clone());
            continue;
        };

        let previous = stored(&pending, &pair.code);
        let mut current = pair.clone();
        let mut delta = None;

        if rule.kind.contains(VirtualStateKind::SUMMED_IN_REPORTING_PAYLOAD) {
            let base = previous
                .clone()
                .filter(value::is_numeric)
                .unwrap_or_else(|| Value::from(0));
            if let Some(total) = value::add(&base, &pair.value) {
                current.value = total;
                delta = value::is_numeric(&pair.value).then(|| pair.value.clone());
            } else {
                debug!(device_id = %device.id, code = %pair.code, "summed payload is not numeric, keeping as reported");
            }
        } else if let Some(ref old) = previous {
            delta = value::subtract(&current.value, old);
        }

        pending.insert(current.code.clone(), current.value.clone());
        out.push(current.clone());

        if rule.kind.contains(VirtualStateKind::COPY_TO_MULTIPLE) {
            for target in rule.copy_to.iter().filter(|t| **t != rule.key) {
                pending.insert(target.clone(), current.value.clone());
                out.push(StatusPair {
                    code: target.clone(),
                    dp_id: device.get_transport_id(target),
                    value: current.value.clone(),
                });
            }
        }

        if rule.kind.contains(VirtualStateKind::COPY_DELTA_TO_MULTIPLE) {
            let Some(delta) = delta else {
                continue;
            };
            for target in rule.copy_delta_to.iter().filter(|t| **t != rule.key) {
                let base = stored(&pending, target)
                    .filter(value::is_numeric)
                    .unwrap_or_else(|| Value::from(0));
                if let Some(next) = value::add(&base, &delta) {
                    pending.insert(target.clone(), next.clone());
                    out.push(StatusPair {
                        code: target.clone(),
                        dp_id: device.get_transport_id(target),
                        value: next,
                    });
                }
            }
        }
    }

    out
}
