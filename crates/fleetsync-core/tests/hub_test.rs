#![allow(clippy::unwrap_used)]
// Integration tests for `Hub` using in-memory snapshot backends and the
// loopback message source.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::watch;

use fleetsync_api::snapshot::{RecordedWrite, Snapshot};
use fleetsync_api::wire::{CommandPayload, PropertyPayload};
use fleetsync_api::{LoopbackSource, MessageSource, SnapshotBackend};
use fleetsync_core::{
    BatchKind, BroadcastSink, ConnectionState, CoreError, CoreEvent, DeviceCommand, Hub, HubConfig,
    NullSink, RouteOutcome, RuleRegistry, SourceConfig, SourceId, SourceKind, VirtualStateRule,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn snapshot(body: &Value) -> Arc<SnapshotBackend> {
    let parsed: Snapshot = serde_json::from_value(body.clone()).unwrap();
    Arc::new(SnapshotBackend::from_snapshot(parsed))
}

fn plug_caps() -> Value {
    json!({
        "status_range": [{ "code": "add_ele", "type": "Integer", "values": "{\"min\":0}" }],
        "function": [
            { "code": "switch_1", "type": "Boolean", "values": "{}" },
            { "code": "countdown_1", "type": "Integer", "values": "{\"min\":0}" }
        ],
        "local_strategy": {
            "1": { "status_code": "switch_1", "config_item": { "valueType": "Boolean" } },
            "9": { "status_code": "countdown_1", "use_open_api": true },
            "17": { "status_code": "add_ele", "use_open_api": true, "property_update": true }
        }
    })
}

fn home_backend() -> Arc<SnapshotBackend> {
    snapshot(&json!({
        "devices": [{
            "id": "plug-1",
            "name": "Desk plug",
            "category": "cz",
            "online": true,
            "status": [{ "code": "switch_1", "value": true }, { "code": "add_ele", "value": 12 }]
        }],
        "capabilities": { "plug-1": plug_caps() }
    }))
}

fn cloud_backend() -> Arc<SnapshotBackend> {
    snapshot(&json!({
        "devices": [
            {
                "id": "plug-1",
                "category": "cz",
                "status": [{ "code": "cur_power", "value": 5 }]
            },
            { "id": "lamp-2", "category": "dj", "status": [] }
        ]
    }))
}

fn two_source_config() -> HubConfig {
    HubConfig {
        sources: vec![
            SourceConfig::new("home", SourceKind::Sharing).with_topic("home/devices"),
            SourceConfig::new("cloud", SourceKind::OpenApi),
        ],
        ..HubConfig::default()
    }
}

fn report(device_id: &str, status: Value) -> Value {
    json!({ "protocol": 4, "data": { "devId": device_id, "status": status } })
}

async fn wait_for_change(rx: &mut watch::Receiver<u64>) {
    tokio::time::timeout(Duration::from_secs(2), rx.changed())
        .await
        .unwrap()
        .unwrap();
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_merges_shared_devices() {
    let hub = Hub::builder(two_source_config())
        .backend("home", home_backend())
        .backend("cloud", cloud_backend())
        .sink(Arc::new(NullSink))
        .build()
        .unwrap();

    hub.connect().await.unwrap();
    assert_eq!(*hub.connection_state().borrow(), ConnectionState::Connected);

    let devices = hub.devices().await;
    assert_eq!(devices.keys().cloned().collect::<Vec<_>>(), vec!["lamp-2", "plug-1"]);

    let plug = hub.device("plug-1").await.unwrap();
    assert_eq!(plug.name, "Desk plug");
    assert_eq!(plug.status["cur_power"], json!(5));
    assert_eq!(plug.status["switch_1"], json!(true));

    // The merge updates every holder in place.
    let cloud = hub.aggregator().cache(&SourceId::from("cloud")).unwrap();
    let cloud_plug = cloud.snapshot("plug-1").await.unwrap();
    assert_eq!(cloud_plug.status["add_ele"], json!(12));
    assert_eq!(cloud_plug.get_code(17), Some("add_ele"));

    hub.disconnect().await;
    assert_eq!(*hub.connection_state().borrow(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unknown_device_lookup_fails() {
    let hub = Hub::builder(two_source_config())
        .backend("home", home_backend())
        .backend("cloud", cloud_backend())
        .build()
        .unwrap();
    hub.refresh().await.unwrap();

    let err = hub.device("nope").await.unwrap_err();
    assert!(matches!(err, CoreError::DeviceNotFound { ref identifier } if identifier == "nope"));
}

// ── Builder validation ──────────────────────────────────────────────

#[test]
fn test_build_requires_backend_per_source() {
    let result = Hub::builder(two_source_config())
        .backend("home", home_backend())
        .build();
    assert!(matches!(result, Err(CoreError::Config { .. })));
}

#[test]
fn test_build_rejects_message_source_for_unknown_id() {
    let result = Hub::builder(two_source_config())
        .backend("home", home_backend())
        .backend("cloud", cloud_backend())
        .message_source("elsewhere", Arc::new(LoopbackSource::new()))
        .build();
    assert!(matches!(result, Err(CoreError::SourceNotFound { .. })));
}

// ── Message pumps ───────────────────────────────────────────────────

#[tokio::test]
async fn test_pumped_report_updates_tagged_owner() {
    let bus = Arc::new(LoopbackSource::new());
    let hub = Hub::builder(two_source_config())
        .backend("home", home_backend())
        .backend("cloud", cloud_backend())
        .message_source("home", bus.clone())
        .sink(Arc::new(NullSink))
        .build()
        .unwrap();
    hub.connect().await.unwrap();
    assert_eq!(bus.subscriptions().await, vec!["home/devices".to_owned()]);

    let mut changes = hub.subscribe_changes();
    let reached = bus.inject(report("plug-1", json!([
        { "code": "switch_1", "value": false },
        { "dpId": 17, "value": 30 }
    ])));
    assert_eq!(reached, 1);
    wait_for_change(&mut changes).await;

    let plug = hub.device("plug-1").await.unwrap();
    assert_eq!(plug.status["switch_1"], json!(false));
    assert_eq!(plug.status["add_ele"], json!(30));

    // Only the tagged owner received it.
    let cloud = hub.aggregator().cache(&SourceId::from("cloud")).unwrap();
    assert_eq!(cloud.snapshot("plug-1").await.unwrap().status["switch_1"], json!(true));

    hub.disconnect().await;
    assert!(!bus.is_connected());
}

#[tokio::test]
async fn test_report_fans_out_through_copy_rule() {
    let mut rules = RuleRegistry::new();
    rules.register(
        "cz",
        [VirtualStateRule::copy("switch_1", &["switch_1_mirror", "switch_1_shadow"])],
    );

    let hub = Hub::builder(two_source_config())
        .backend("home", home_backend())
        .backend("cloud", cloud_backend())
        .rules(Arc::new(rules))
        .build()
        .unwrap();
    hub.refresh().await.unwrap();

    let outcome = hub
        .route_message(
            &SourceId::from("home"),
            &report("plug-1", json!([{ "code": "switch_1", "value": false }])),
        )
        .await;
    assert!(outcome.changed_state());

    let plug = hub.device("plug-1").await.unwrap();
    assert_eq!(plug.status["switch_1"], json!(false));
    assert_eq!(plug.status["switch_1_mirror"], json!(false));
    assert_eq!(plug.status["switch_1_shadow"], json!(false));
}

#[tokio::test]
async fn test_backed_source_shares_backing_transport() {
    let config = HubConfig {
        sources: vec![
            SourceConfig::new("home", SourceKind::Sharing).with_topic("home/devices"),
            SourceConfig::new("wrap", SourceKind::Sharing)
                .backed_by("home")
                .with_topic("wrap/devices"),
        ],
        ..HubConfig::default()
    };
    let bus = Arc::new(LoopbackSource::new());
    let hub = Hub::builder(config)
        .backend("home", home_backend())
        .backend("wrap", home_backend())
        .message_source("wrap", bus.clone())
        .sink(Arc::new(NullSink))
        .build()
        .unwrap();
    hub.connect().await.unwrap();

    // Registered for the backed source, attached to the backing.
    assert_eq!(
        bus.subscriptions().await,
        vec!["home/devices".to_owned(), "wrap/devices".to_owned()]
    );

    let mut changes = hub.subscribe_changes();
    bus.inject(report("plug-1", json!([{ "code": "switch_1", "value": false }])));
    wait_for_change(&mut changes).await;

    for id in ["home", "wrap"] {
        let cache = hub.aggregator().cache(&SourceId::from(id)).unwrap();
        let plug = cache.snapshot("plug-1").await.unwrap();
        assert_eq!(plug.status["switch_1"], json!(false), "{id}");
    }

    hub.disconnect().await;
}

#[tokio::test]
async fn test_unknown_protocol_reaches_generic_handler() {
    let hub = Hub::builder(two_source_config())
        .backend("home", home_backend())
        .backend("cloud", cloud_backend())
        .build()
        .unwrap();
    hub.refresh().await.unwrap();

    let mut unhandled = hub.unhandled_messages();
    let raw = json!({ "protocol": 51, "data": { "devId": "plug-1" } });
    let outcome = hub.route_message(&SourceId::from("cloud"), &raw).await;
    assert!(matches!(outcome, RouteOutcome::Unhandled { protocol: Some(51), .. }));

    let received = unhandled.try_recv().unwrap();
    assert_eq!(received.source_tag.as_str(), "cloud");
    assert_eq!(received.message, raw);
}

#[tokio::test]
async fn test_device_event_toggles_online_everywhere_owned() {
    let hub = Hub::builder(two_source_config())
        .backend("home", home_backend())
        .backend("cloud", cloud_backend())
        .build()
        .unwrap();
    hub.refresh().await.unwrap();

    let raw = json!({
        "protocol": 20,
        "data": { "bizCode": "offline", "bizData": { "devId": "plug-1", "bizCode": "offline" } }
    });
    // Tagged by a source that does not own it: every owner gets it.
    let outcome = hub.route_message(&SourceId::from("elsewhere"), &raw).await;
    match outcome {
        RouteOutcome::DeviceEvent { targets, .. } => {
            assert_eq!(targets, vec![SourceId::from("home"), SourceId::from("cloud")]);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(!hub.device("plug-1").await.unwrap().online);
}

// ── Refresh ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_refresh_reports_removed_devices() {
    let cloud = cloud_backend();
    let hub = Hub::builder(two_source_config())
        .backend("home", home_backend())
        .backend("cloud", cloud.clone())
        .build()
        .unwrap();
    let first = hub.refresh().await.unwrap();
    assert!(first.is_complete());
    assert!(first.removed.is_empty());

    cloud
        .replace(serde_json::from_value(json!({ "devices": [{ "id": "plug-1", "category": "cz" }] })).unwrap())
        .await;

    let mut changes = hub.subscribe_changes();
    let second = hub.refresh().await.unwrap();
    assert_eq!(second.removed, vec!["lamp-2".to_owned()]);
    assert!(changes.has_changed().unwrap());
}

#[tokio::test]
async fn test_refresh_fails_only_when_every_source_fails() {
    let config = HubConfig {
        sources: vec![SourceConfig::new("gone", SourceKind::Sharing)],
        ..HubConfig::default()
    };
    let hub = Hub::builder(config)
        .backend("gone", Arc::new(SnapshotBackend::from_path("/nonexistent/fleetsync/snapshot.json")))
        .build()
        .unwrap();

    let err = hub.connect().await.unwrap_err();
    assert!(matches!(err, CoreError::RefreshFailed { .. }));
    assert_eq!(*hub.connection_state().borrow(), ConnectionState::Failed);
}

#[tokio::test]
async fn test_total_refresh_failure_surfaces_every_source() {
    let config = HubConfig {
        sources: vec![
            SourceConfig::new("first", SourceKind::Sharing),
            SourceConfig::new("second", SourceKind::OpenApi),
        ],
        ..HubConfig::default()
    };
    let sink = Arc::new(BroadcastSink::new());
    let mut events = sink.subscribe();
    let hub = Hub::builder(config)
        .backend("first", Arc::new(SnapshotBackend::from_path("/nonexistent/fleetsync/first.json")))
        .backend("second", Arc::new(SnapshotBackend::from_path("/nonexistent/fleetsync/second.json")))
        .sink(sink)
        .build()
        .unwrap();

    let err = hub.refresh().await.unwrap_err();
    assert!(matches!(err, CoreError::RefreshFailed { ref source_id, .. } if source_id.as_str() == "first"));

    let mut failed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::RefreshFailed { ref source_id, .. } = *event {
            failed.push(source_id.to_string());
        }
    }
    failed.sort();
    assert_eq!(failed, vec!["first".to_owned(), "second".to_owned()]);
}

#[tokio::test]
async fn test_derived_codes_from_two_sources_keep_their_transport() {
    let device = |code: &str, dp: u32, open_api: bool| {
        snapshot(&json!({
            "devices": [{ "id": "d", "category": "cz", "status": [{ "code": code, "value": 1 }] }],
            "capabilities": {
                "d": {
                    "status_range": [{ "code": code, "type": "Integer", "values": "{}" }],
                    "local_strategy": { dp.to_string(): { "status_code": code, "use_open_api": open_api } }
                }
            }
        }))
    };
    let mut rules = RuleRegistry::new();
    rules.register(
        "cz",
        [VirtualStateRule::copy("k1", &["t1"]), VirtualStateRule::copy("k2", &["t2"])],
    );

    let hub = Hub::builder(two_source_config())
        .backend("home", device("k1", 1, false))
        .backend("cloud", device("k2", 2, true))
        .rules(Arc::new(rules))
        .build()
        .unwrap();
    hub.refresh().await.unwrap();

    let merged = hub.device("d").await.unwrap();
    assert!(merged.get_transport_id("t1").is_some());
    assert!(merged.get_transport_id("t2").is_some());

    let plan = hub
        .plan_commands("d", &[DeviceCommand::new("t1", json!(2)), DeviceCommand::new("t2", json!(3))])
        .await;
    assert_eq!(plan.regular_default, vec![CommandPayload { code: "t1".into(), value: json!(2) }]);
    assert_eq!(plan.regular_alternate, vec![CommandPayload { code: "t2".into(), value: json!(3) }]);
}

// ── Commands ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_send_commands_routes_batches_by_strategy() {
    let home = home_backend();
    let cloud = cloud_backend();
    let hub = Hub::builder(two_source_config())
        .backend("home", home.clone())
        .backend("cloud", cloud.clone())
        .build()
        .unwrap();
    hub.refresh().await.unwrap();

    let report = hub
        .send_commands(
            "plug-1",
            &[
                DeviceCommand::new("switch_1", json!(false)),
                DeviceCommand::new("countdown_1", json!(60)),
                DeviceCommand::new("add_ele", json!(3)),
            ],
        )
        .await
        .unwrap();

    let kinds: Vec<BatchKind> = report.dispatched.iter().map(|b| b.kind).collect();
    assert_eq!(
        kinds,
        vec![BatchKind::RegularDefault, BatchKind::RegularAlternate, BatchKind::PropertyAlternate]
    );

    assert_eq!(
        home.writes().await,
        vec![RecordedWrite::Commands {
            device_id: "plug-1".into(),
            commands: vec![CommandPayload { code: "switch_1".into(), value: json!(false) }],
        }]
    );
    assert_eq!(
        cloud.writes().await,
        vec![
            RecordedWrite::Commands {
                device_id: "plug-1".into(),
                commands: vec![CommandPayload { code: "countdown_1".into(), value: json!(60) }],
            },
            RecordedWrite::Properties {
                device_id: "plug-1".into(),
                properties: vec![PropertyPayload { code: "add_ele".into(), value: "3".into() }],
            },
        ]
    );
}

#[tokio::test]
async fn test_alternate_batch_without_source_sends_nothing() {
    let config = HubConfig {
        sources: vec![SourceConfig::new("home", SourceKind::Sharing)],
        ..HubConfig::default()
    };
    let home = home_backend();
    let hub = Hub::builder(config)
        .backend("home", home.clone())
        .build()
        .unwrap();
    hub.refresh().await.unwrap();

    let err = hub
        .send_commands(
            "plug-1",
            &[
                DeviceCommand::new("switch_1", json!(true)),
                DeviceCommand::new("countdown_1", json!(10)),
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::SourceUnavailable { .. }));
    assert!(home.writes().await.is_empty());
}
