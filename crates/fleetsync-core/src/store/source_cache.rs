// ── Per-source device cache ──
//
// One cache per backend account. Its device map is replaced wholesale by
// `refresh()` and kept current by push reports. Every mutation, rule
// application included, happens under the cache's write lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, watch};
use tracing::{debug, warn};

use fleetsync_api::DeviceBackend;
use fleetsync_api::wire::{BizData, ReportedStatus};

use super::DeviceMap;
use crate::config::SourceConfig;
use crate::convert::apply_capabilities;
use crate::error::CoreError;
use crate::model::{DeviceRecord, SourceId, SourceKind, StatusPair};
use crate::observe::{CoreEvent, EventSink};
use crate::rules::{RuleRegistry, apply_load_time_rules, apply_report_time_rules};

/// Result of applying a lifecycle event to a cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventOutcome {
    /// A field of the cached record changed.
    Updated,
    /// The change needs a full refresh; nothing was modified.
    RefreshRequested,
    UnknownDevice,
}

pub struct SourceCache {
    id: SourceId,
    kind: SourceKind,
    backing: Option<SourceId>,
    backend: Arc<dyn DeviceBackend>,
    rules: Arc<RuleRegistry>,
    sink: Arc<dyn EventSink>,
    devices: RwLock<DeviceMap>,
    last_refresh: watch::Sender<Option<DateTime<Utc>>>,
}

impl SourceCache {
    pub fn new(
        config: &SourceConfig,
        backend: Arc<dyn DeviceBackend>,
        rules: Arc<RuleRegistry>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (last_refresh, _) = watch::channel(None);
        Self {
            id: config.id.clone(),
            kind: config.kind,
            backing: config.backing.clone(),
            backend,
            rules,
            sink,
            devices: RwLock::new(DeviceMap::new()),
            last_refresh,
        }
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn backing(&self) -> Option<&SourceId> {
        self.backing.as_ref()
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    /// Time of the last successful refresh; `None` until the first one.
    pub fn last_refresh(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.last_refresh.subscribe()
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub async fn snapshot(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        self.devices.read().await.contains_key(device_id)
    }

    pub async fn device_ids(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, DeviceMap> {
        self.devices.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, DeviceMap> {
        self.devices.write().await
    }

    // ── Full refresh ─────────────────────────────────────────────────

    /// Replace the device map with a fresh listing from the backend.
    ///
    /// The write lock is held for the whole call, so reports wait until the
    /// new map is complete. A failed listing leaves the previous map in
    /// place. A failed capability fetch only affects that one device.
    pub async fn refresh(&self) -> Result<usize, CoreError> {
        let mut devices = self.devices.write().await;

        let listing = match self.backend.fetch_devices().await {
            Ok(listing) => listing,
            Err(e) => {
                let message = e.to_string();
                warn!(source = %self.id, error = %message, "device listing failed, keeping last map");
                self.sink.emit(CoreEvent::RefreshFailed {
                    source_id: self.id.clone(),
                    message: message.clone(),
                });
                return Err(CoreError::RefreshFailed {
                    source_id: self.id.clone(),
                    message,
                });
            }
        };

        let capabilities = join_all(
            listing
                .iter()
                .map(|d| self.backend.fetch_capabilities(&d.id)),
        )
        .await;

        let mut next = DeviceMap::new();
        for (descriptor, caps) in listing.into_iter().zip(capabilities) {
            let mut record = DeviceRecord::from(descriptor);
            match caps {
                Ok(caps) => apply_capabilities(&mut record, caps),
                Err(e) => {
                    debug!(source = %self.id, device_id = %record.id, error = %e, "capability fetch failed (non-fatal)");
                }
            }

            let derivation =
                apply_load_time_rules(self.rules.rules_for(&record.category), &mut record);
            if !derivation.is_empty() {
                self.sink.emit(CoreEvent::DerivationApplied {
                    source_id: self.id.clone(),
                    device_id: record.id.clone(),
                    derivation,
                });
            }
            next.insert(record.id.clone(), record);
        }

        let count = next.len();
        *devices = next;
        drop(devices);

        self.last_refresh.send_replace(Some(Utc::now()));
        self.sink.emit(CoreEvent::RefreshFinished {
            source_id: self.id.clone(),
            devices: count,
        });
        Ok(count)
    }

    // ── Push reports ─────────────────────────────────────────────────

    /// Resolve, derive and write one report. Returns the pairs written.
    ///
    /// Unknown devices and unresolvable pairs are dropped without error.
    pub async fn on_report(&self, device_id: &str, reported: &[ReportedStatus]) -> Vec<StatusPair> {
        let mut devices = self.devices.write().await;
        let Some(record) = devices.get_mut(device_id) else {
            debug!(source = %self.id, device_id, "report for device not in this cache");
            return Vec::new();
        };

        let resolved = self.resolve(record, reported);
        let written =
            apply_report_time_rules(self.rules.rules_for(&record.category), record, &resolved);
        record.write_pairs(&written);

        self.sink.emit(CoreEvent::ReportApplied {
            source_id: self.id.clone(),
            device_id: device_id.to_owned(),
            pairs: written.len(),
        });
        written
    }

    /// Resolve and write a report without running any rules.
    pub async fn write_raw(&self, device_id: &str, reported: &[ReportedStatus]) -> Vec<StatusPair> {
        let mut devices = self.devices.write().await;
        let Some(record) = devices.get_mut(device_id) else {
            return Vec::new();
        };
        let resolved = self.resolve(record, reported);
        record.write_pairs(&resolved);
        resolved
    }

    /// Write already resolved pairs. Returns whether the device exists here.
    pub async fn write_resolved(&self, device_id: &str, pairs: &[StatusPair]) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get_mut(device_id) {
            Some(record) => {
                record.write_pairs(pairs);
                true
            }
            None => false,
        }
    }

    fn resolve(&self, record: &DeviceRecord, reported: &[ReportedStatus]) -> Vec<StatusPair> {
        let mut pairs = Vec::with_capacity(reported.len());
        for entry in reported {
            let code = entry.code.as_deref().filter(|c| !c.is_empty());
            match (code, entry.dp_id) {
                (Some(code), dp_id) => pairs.push(StatusPair {
                    code: code.to_owned(),
                    dp_id: dp_id.or_else(|| record.get_transport_id(code)),
                    value: entry.value.clone(),
                }),
                (None, Some(dp_id)) => match record.get_code(dp_id) {
                    Some(code) => pairs.push(StatusPair {
                        code: code.to_owned(),
                        dp_id: Some(dp_id),
                        value: entry.value.clone(),
                    }),
                    None => self.drop_pair(record, Some(dp_id), "transport id not in local strategy"),
                },
                (None, None) => self.drop_pair(record, None, "pair carries neither code nor transport id"),
            }
        }
        pairs
    }

    fn drop_pair(&self, record: &DeviceRecord, dp_id: Option<u32>, reason: &str) {
        self.sink.emit(CoreEvent::PairDropped {
            source_id: self.id.clone(),
            device_id: record.id.clone(),
            dp_id,
            reason: reason.to_owned(),
        });
    }

    // ── Lifecycle events ─────────────────────────────────────────────

    pub async fn on_device_event(&self, device_id: &str, biz: &BizData) -> DeviceEventOutcome {
        let mut devices = self.devices.write().await;
        let Some(record) = devices.get_mut(device_id) else {
            return DeviceEventOutcome::UnknownDevice;
        };

        let outcome = match biz.biz_code.as_str() {
            "online" => {
                record.online = true;
                DeviceEventOutcome::Updated
            }
            "offline" => {
                record.online = false;
                DeviceEventOutcome::Updated
            }
            "nameUpdate" => match biz.extra.get("name").and_then(serde_json::Value::as_str) {
                Some(name) => {
                    name.clone_into(&mut record.name);
                    DeviceEventOutcome::Updated
                }
                None => DeviceEventOutcome::RefreshRequested,
            },
            _ => DeviceEventOutcome::RefreshRequested,
        };
        drop(devices);

        let event = match outcome {
            DeviceEventOutcome::Updated => CoreEvent::DeviceUpdated {
                source_id: self.id.clone(),
                device_id: device_id.to_owned(),
                biz_code: biz.biz_code.clone(),
            },
            _ => CoreEvent::RefreshRequested {
                source_id: self.id.clone(),
                device_id: device_id.to_owned(),
                biz_code: biz.biz_code.clone(),
            },
        };
        self.sink.emit(event);
        outcome
    }
}

impl std::fmt::Debug for SourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceCache")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("backing", &self.backing)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::observe::NullSink;
    use crate::rules::VirtualStateRule;
    use fleetsync_api::SnapshotBackend;
    use fleetsync_api::snapshot::Snapshot;
    use serde_json::json;

    fn snapshot() -> Snapshot {
        serde_json::from_value(json!({
            "devices": [
                { "id": "plug", "category": "cz", "online": true,
                  "status": [{ "code": "switch_1", "value": false }, { "code": "add_ele", "value": 10 }] }
            ],
            "capabilities": {
                "plug": {
                    "status_range": [
                        { "code": "switch_1", "type": "Boolean", "values": "{}" },
                        { "code": "add_ele", "type": "Integer", "values": "{}" }
                    ],
                    "local_strategy": {
                        "1": { "status_code": "switch_1" },
                        "17": { "status_code": "add_ele" }
                    }
                }
            }
        }))
        .unwrap()
    }

    fn cache(rules: RuleRegistry) -> SourceCache {
        SourceCache::new(
            &SourceConfig::new("home", SourceKind::Sharing),
            Arc::new(SnapshotBackend::from_snapshot(snapshot())),
            Arc::new(rules),
            Arc::new(NullSink),
        )
    }

    fn by_dp(dp_id: u32, value: serde_json::Value) -> ReportedStatus {
        ReportedStatus {
            code: None,
            dp_id: Some(dp_id),
            value,
            t: None,
        }
    }

    #[tokio::test]
    async fn refresh_loads_and_derives() {
        let mut rules = RuleRegistry::new();
        rules.register("cz", [VirtualStateRule::copy("add_ele", &["add_ele_total"])]);
        let cache = cache(rules);

        assert_eq!(cache.refresh().await.unwrap(), 1);

        let plug = cache.snapshot("plug").await.unwrap();
        assert_eq!(plug.status["add_ele_total"], json!(10));
        assert!(plug.get_transport_id("add_ele_total").is_some());
        assert!(cache.last_refresh().borrow().is_some());
    }

    #[tokio::test]
    async fn report_resolves_transport_ids() {
        let cache = cache(RuleRegistry::new());
        cache.refresh().await.unwrap();

        let written = cache
            .on_report("plug", &[by_dp(1, json!(true)), by_dp(99, json!(1))])
            .await;

        assert_eq!(written.len(), 1);
        assert_eq!(written[0].code, "switch_1");
        assert_eq!(cache.snapshot("plug").await.unwrap().status["switch_1"], json!(true));
    }

    #[tokio::test]
    async fn report_for_unknown_device_is_ignored() {
        let cache = cache(RuleRegistry::new());
        cache.refresh().await.unwrap();
        assert!(cache.on_report("ghost", &[by_dp(1, json!(true))]).await.is_empty());
    }

    #[tokio::test]
    async fn failed_listing_keeps_previous_map() {
        let cache = cache(RuleRegistry::new());
        cache.refresh().await.unwrap();

        let broken = SourceCache {
            backend: Arc::new(SnapshotBackend::from_path("/nonexistent/fleetsync.json")),
            ..cache
        };
        let err = broken.refresh().await.unwrap_err();
        assert!(matches!(err, CoreError::RefreshFailed { .. }));
        assert!(broken.contains("plug").await);
    }

    #[tokio::test]
    async fn lifecycle_events() {
        let cache = cache(RuleRegistry::new());
        cache.refresh().await.unwrap();

        let offline = BizData {
            dev_id: Some("plug".into()),
            biz_code: "offline".into(),
            extra: serde_json::Map::new(),
        };
        assert_eq!(cache.on_device_event("plug", &offline).await, DeviceEventOutcome::Updated);
        assert!(!cache.snapshot("plug").await.unwrap().online);

        let mut rename = offline.clone();
        rename.biz_code = "nameUpdate".into();
        rename.extra.insert("name".into(), json!("Desk lamp"));
        cache.on_device_event("plug", &rename).await;
        assert_eq!(cache.snapshot("plug").await.unwrap().name, "Desk lamp");

        let mut delete = offline;
        delete.biz_code = "delete".into();
        assert_eq!(
            cache.on_device_event("plug", &delete).await,
            DeviceEventOutcome::RefreshRequested
        );
        assert!(cache.contains("plug").await);
    }
}
