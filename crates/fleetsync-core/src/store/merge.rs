// ── Cross-source field merge ──
//
// Every device id listed by more than one cache is merged across all of
// them, in place. The records are first folded into one union in
// precedence order, then every holder absorbs that union. Receivers only
// gain or overwrite fields, so when two caches disagree on a value the one
// later in precedence order wins for every receiver. Only maps flagged
// fresh contribute to the union; stale maps still receive it.

use std::collections::BTreeSet;

use super::DeviceMap;
use crate::model::DeviceRecord;

/// Full-mesh union merge over `maps`, which must be in precedence order.
/// `fresh[i]` says whether `maps[i]` may contribute fields.
/// Returns the number of device ids that were present in two or more maps.
pub(crate) fn merge_full_mesh(maps: &mut [&mut DeviceMap], fresh: &[bool]) -> usize {
    let mut shared = BTreeSet::new();
    let mut seen = BTreeSet::new();
    for map in maps.iter() {
        for id in map.keys() {
            if !seen.insert(id.clone()) {
                shared.insert(id.clone());
            }
        }
    }

    for id in &shared {
        let mut union: Option<DeviceRecord> = None;
        for (map, _) in maps.iter().zip(fresh).filter(|(_, f)| **f) {
            let Some(record) = map.get(id) else {
                continue;
            };
            match union {
                Some(ref mut u) => u.absorb(record),
                None => union = Some(record.clone()),
            }
        }
        let Some(union) = union else {
            continue;
        };
        for map in maps.iter_mut() {
            if let Some(record) = map.get_mut(id) {
                record.absorb(&union);
            }
        }
    }
    shared.len()
}
