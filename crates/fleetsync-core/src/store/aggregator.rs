// ── Aggregator ──
//
// Arena of per-source caches keyed by source id, in precedence order. The
// aggregator owns cross-cache operations: refresh-then-merge, the canonical
// directory, report delivery through backing relationships and the
// staleness check.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::future::join_all;
use indexmap::IndexMap;
use tracing::{debug, info};

use fleetsync_api::DeviceBackend;
use fleetsync_api::wire::{BizData, ReportedStatus};

use super::merge::merge_full_mesh;
use super::source_cache::{DeviceEventOutcome, SourceCache};
use super::DeviceMap;
use crate::error::CoreError;
use crate::model::{DeviceRecord, SourceId, SourceKind, StatusPair};

/// Outcome of refreshing every cache.
#[derive(Debug, Default)]
pub struct RefreshReport {
    /// Sources that refreshed, with their device counts.
    pub refreshed: Vec<(SourceId, usize)>,
    /// Sources that failed and kept their previous map.
    pub failed: Vec<(SourceId, CoreError)>,
    /// Device ids listed by two or more sources after the refresh.
    pub shared_devices: usize,
    /// Ids that were in the directory before and are in no source now.
    pub removed: Vec<String>,
}

impl RefreshReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceId> {
        self.failed.iter().map(|(id, _)| id)
    }
}

#[derive(Debug, Default)]
pub struct Aggregator {
    caches: IndexMap<SourceId, Arc<SourceCache>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cache at the lowest precedence.
    pub fn insert(&mut self, cache: SourceCache) -> Result<Arc<SourceCache>, CoreError> {
        if self.caches.contains_key(cache.id()) {
            return Err(CoreError::Config {
                message: format!("duplicate source id '{}'", cache.id()),
            });
        }
        let cache = Arc::new(cache);
        self.caches.insert(cache.id().clone(), Arc::clone(&cache));
        Ok(cache)
    }

    pub fn cache(&self, id: &SourceId) -> Option<&Arc<SourceCache>> {
        self.caches.get(id)
    }

    pub fn caches(&self) -> impl Iterator<Item = &Arc<SourceCache>> {
        self.caches.values()
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    fn require(&self, id: &SourceId) -> Result<&Arc<SourceCache>, CoreError> {
        self.caches.get(id).ok_or_else(|| CoreError::SourceNotFound {
            source_id: id.clone(),
        })
    }

    // ── Backing relationships ────────────────────────────────────────

    /// Source whose message bus carries `id`'s traffic: its backing when it
    /// has one, otherwise itself.
    pub fn transport_source(&self, id: &SourceId) -> Option<&SourceId> {
        let cache = self.caches.get(id)?;
        Some(cache.backing().unwrap_or(cache.id()))
    }

    /// Backend that carries writes issued on behalf of `id`.
    pub fn command_backend(&self, id: &SourceId) -> Result<Arc<dyn DeviceBackend>, CoreError> {
        let cache = self.require(id)?;
        let target = match cache.backing() {
            Some(backing) => self.require(backing)?,
            None => cache,
        };
        Ok(Arc::clone(target.backend()))
    }

    /// First cache backed by `backing` that lists `device_id`.
    async fn dependent_of(&self, backing: &SourceId, device_id: &str) -> Option<Arc<SourceCache>> {
        for cache in self.caches.values() {
            if cache.backing() == Some(backing) && cache.contains(device_id).await {
                return Some(Arc::clone(cache));
            }
        }
        None
    }

    // ── Refresh and merge ────────────────────────────────────────────

    /// Refresh every cache concurrently, then merge.
    ///
    /// Failing caches keep their last-known-good map and are listed in the
    /// report. They receive merged fields but never contribute any.
    pub async fn refresh_all(&self) -> RefreshReport {
        let results = join_all(self.caches.values().map(|cache| async move {
            (cache.id().clone(), cache.refresh().await)
        }))
        .await;

        let mut report = RefreshReport::default();
        for (id, result) in results {
            match result {
                Ok(count) => report.refreshed.push((id, count)),
                Err(e) => report.failed.push((id, e)),
            }
        }
        let fresh: BTreeSet<SourceId> = report.refreshed.iter().map(|(id, _)| id.clone()).collect();
        report.shared_devices = self.merge(&fresh).await;

        info!(
            refreshed = report.refreshed.len(),
            failed = report.failed.len(),
            shared = report.shared_devices,
            "refresh complete"
        );
        report
    }

    /// Merge every device listed by more than one cache, in place. Only
    /// caches in `fresh` contribute fields.
    ///
    /// Takes every cache's write lock in precedence order.
    pub async fn merge(&self, fresh: &BTreeSet<SourceId>) -> usize {
        let contributes: Vec<bool> = self.caches.keys().map(|id| fresh.contains(id)).collect();
        let mut guards = Vec::with_capacity(self.caches.len());
        for cache in self.caches.values() {
            guards.push(cache.write().await);
        }
        let mut maps: Vec<&mut DeviceMap> = guards.iter_mut().map(|g| &mut **g).collect();
        merge_full_mesh(&mut maps, &contributes)
    }

    // ── Canonical directory ──────────────────────────────────────────

    /// One record per device id; the first cache in precedence order that
    /// lists an id supplies its record.
    pub async fn aggregated_device_map(&self) -> DeviceMap {
        let mut directory = DeviceMap::new();
        for cache in self.caches.values() {
            let map = cache.read().await;
            for (id, record) in map.iter() {
                directory
                    .entry(id.clone())
                    .or_insert_with(|| record.clone());
            }
        }
        directory
    }

    pub async fn device(&self, device_id: &str) -> Option<DeviceRecord> {
        for cache in self.caches.values() {
            if let Some(record) = cache.snapshot(device_id).await {
                return Some(record);
            }
        }
        None
    }

    /// Sources whose cache lists `device_id`, in precedence order.
    pub async fn owners(&self, device_id: &str) -> Vec<SourceId> {
        let mut owners = Vec::new();
        for cache in self.caches.values() {
            if cache.contains(device_id).await {
                owners.push(cache.id().clone());
            }
        }
        owners
    }

    /// Where a message tagged `source_tag` for `device_id` is delivered.
    ///
    /// The tagged source alone when it owns the device, otherwise every
    /// owner. Backed owners collapse onto their backing, which runs the
    /// backed report path once.
    pub async fn delivery_targets(&self, source_tag: &SourceId, device_id: &str) -> Vec<SourceId> {
        let owners = self.owners(device_id).await;
        let chosen = if owners.contains(source_tag) {
            vec![source_tag.clone()]
        } else {
            owners
        };

        let mut targets: Vec<SourceId> = Vec::with_capacity(chosen.len());
        for id in chosen {
            let target = self.transport_source(&id).cloned().unwrap_or(id);
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        targets
    }

    /// First cache of `kind` listing the device, else the first cache of
    /// `kind` at all.
    pub async fn source_for(&self, device_id: &str, kind: SourceKind) -> Option<Arc<SourceCache>> {
        let mut fallback = None;
        for cache in self.caches.values().filter(|c| c.kind() == kind) {
            if cache.contains(device_id).await {
                return Some(Arc::clone(cache));
            }
            if fallback.is_none() {
                fallback = Some(Arc::clone(cache));
            }
        }
        fallback
    }

    // ── Reports ──────────────────────────────────────────────────────

    /// Apply a report through `target`.
    ///
    /// A backed cache (or a backing wrapped by a cache that lists the
    /// device) first has the raw pairs written to the backing, then derives
    /// locally, then mirrors the derived pairs back into the backing.
    pub async fn on_report(
        &self,
        target: &SourceId,
        device_id: &str,
        reported: &[ReportedStatus],
    ) -> Result<Vec<StatusPair>, CoreError> {
        let cache = self.require(target)?;

        let (dependent, backing) = if let Some(backing) = cache.backing() {
            (Arc::clone(cache), Arc::clone(self.require(backing)?))
        } else if let Some(dependent) = self.dependent_of(target, device_id).await {
            (dependent, Arc::clone(cache))
        } else {
            return Ok(cache.on_report(device_id, reported).await);
        };

        backing.write_raw(device_id, reported).await;
        let derived = dependent.on_report(device_id, reported).await;
        backing.write_resolved(device_id, &derived).await;
        debug!(
            device_id,
            source = %dependent.id(),
            backing = %backing.id(),
            pairs = derived.len(),
            "report applied through backing"
        );
        Ok(derived)
    }

    /// Apply a lifecycle event through `target` and, for backing pairs, to
    /// the other side too.
    pub async fn on_device_event(
        &self,
        target: &SourceId,
        device_id: &str,
        biz: &BizData,
    ) -> Result<DeviceEventOutcome, CoreError> {
        let cache = self.require(target)?;
        let outcome = cache.on_device_event(device_id, biz).await;

        let partner = match cache.backing() {
            Some(backing) => Some(Arc::clone(self.require(backing)?)),
            None => self.dependent_of(target, device_id).await,
        };
        if let Some(partner) = partner {
            partner.on_device_event(device_id, biz).await;
        }
        Ok(outcome)
    }

    // ── Staleness ────────────────────────────────────────────────────

    /// Ids from `previous` that no cache lists any more.
    ///
    /// Holds every cache's read lock at once, so an in-flight refresh is
    /// waited for before an id is reported gone.
    pub async fn stale_device_ids(&self, previous: &BTreeSet<String>) -> Vec<String> {
        let mut guards = Vec::with_capacity(self.caches.len());
        for cache in self.caches.values() {
            guards.push(cache.read().await);
        }
        previous
            .iter()
            .filter(|id| guards.iter().all(|map| !map.contains_key(id.as_str())))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::observe::NullSink;
    use crate::rules::RuleRegistry;
    use fleetsync_api::SnapshotBackend;
    use fleetsync_api::snapshot::Snapshot;
    use serde_json::json;

    fn cache(config: SourceConfig, device_ids: &[&str]) -> SourceCache {
        let devices: Vec<_> = device_ids.iter().map(|id| json!({ "id": id })).collect();
        let snapshot: Snapshot = serde_json::from_value(json!({ "devices": devices })).unwrap();
        SourceCache::new(
            &config,
            Arc::new(SnapshotBackend::from_snapshot(snapshot)),
            Arc::new(RuleRegistry::new()),
            Arc::new(NullSink),
        )
    }

    async fn arena() -> Aggregator {
        let mut agg = Aggregator::new();
        agg.insert(cache(SourceConfig::new("home", SourceKind::Sharing), &["a", "b"]))
            .unwrap();
        agg.insert(cache(
            SourceConfig::new("wrap", SourceKind::Sharing).backed_by("home"),
            &["a"],
        ))
        .unwrap();
        agg.insert(cache(SourceConfig::new("cloud", SourceKind::OpenApi), &["b", "c"]))
            .unwrap();
        agg.refresh_all().await;
        agg
    }

    #[test]
    fn duplicate_source_is_rejected() {
        let mut agg = Aggregator::new();
        agg.insert(cache(SourceConfig::new("x", SourceKind::Sharing), &[]))
            .unwrap();
        let err = agg
            .insert(cache(SourceConfig::new("x", SourceKind::OpenApi), &[]))
            .unwrap_err();
        assert!(matches!(err, CoreError::Config { .. }));
    }

    #[tokio::test]
    async fn delivery_prefers_tagged_owner() {
        let agg = arena().await;
        let home = SourceId::from("home");
        let cloud = SourceId::from("cloud");

        assert_eq!(agg.delivery_targets(&cloud, "b").await, vec![cloud.clone()]);
        assert_eq!(agg.delivery_targets(&SourceId::from("other"), "b").await, vec![home.clone(), cloud]);
        assert_eq!(agg.delivery_targets(&SourceId::from("wrap"), "a").await, vec![home]);
        assert!(agg.delivery_targets(&SourceId::from("home"), "zz").await.is_empty());
    }

    #[tokio::test]
    async fn source_for_falls_back_to_first_of_kind() {
        let agg = arena().await;

        let found = agg.source_for("c", SourceKind::OpenApi).await.unwrap();
        assert_eq!(found.id().as_str(), "cloud");

        let fallback = agg.source_for("c", SourceKind::Sharing).await.unwrap();
        assert_eq!(fallback.id().as_str(), "home");
    }

    #[tokio::test]
    async fn stale_ids_are_those_listed_nowhere() {
        let agg = arena().await;
        let previous: BTreeSet<String> = ["a", "c", "gone"].iter().map(|s| (*s).to_owned()).collect();
        assert_eq!(agg.stale_device_ids(&previous).await, vec!["gone".to_owned()]);
    }

    #[tokio::test]
    async fn command_backend_follows_backing() {
        let agg = arena().await;
        let wrap = agg.command_backend(&SourceId::from("wrap")).unwrap();
        let home = agg.command_backend(&SourceId::from("home")).unwrap();
        assert!(Arc::ptr_eq(&wrap, &home));
    }

    #[tokio::test]
    async fn failed_refresh_does_not_overwrite_fresh_values() {
        let dir = tempfile::tempdir().unwrap();
        let plug = |on: bool| json!({ "devices": [{ "id": "d", "status": [{ "code": "switch_1", "value": on }] }] });
        let cloud_file = dir.path().join("cloud.json");
        std::fs::write(&cloud_file, plug(false).to_string()).unwrap();

        let home_backend = Arc::new(SnapshotBackend::from_snapshot(serde_json::from_value(plug(false)).unwrap()));
        let mut agg = Aggregator::new();
        agg.insert(SourceCache::new(
            &SourceConfig::new("home", SourceKind::Sharing),
            Arc::clone(&home_backend) as Arc<dyn DeviceBackend>,
            Arc::new(RuleRegistry::new()),
            Arc::new(NullSink),
        ))
        .unwrap();
        agg.insert(SourceCache::new(
            &SourceConfig::new("cloud", SourceKind::OpenApi),
            Arc::new(SnapshotBackend::from_path(&cloud_file)),
            Arc::new(RuleRegistry::new()),
            Arc::new(NullSink),
        ))
        .unwrap();
        assert!(agg.refresh_all().await.is_complete());

        home_backend.replace(serde_json::from_value(plug(true)).unwrap()).await;
        std::fs::remove_file(&cloud_file).unwrap();
        let report = agg.refresh_all().await;

        assert_eq!(report.failed_sources().collect::<Vec<_>>(), vec![&SourceId::from("cloud")]);
        for id in ["home", "cloud"] {
            let record = agg.cache(&SourceId::from(id)).unwrap().snapshot("d").await.unwrap();
            assert_eq!(record.status["switch_1"], json!(true), "source {id}");
        }
    }
}
