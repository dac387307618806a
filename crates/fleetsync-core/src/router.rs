// ── Message router ──
//
// Entry point for every inbound push payload. The protocol is inspected
// first; recognized messages are normalized, matched to the caches that
// own the device and dispatched there. Routing runs in the caller's task.

use std::sync::Arc;

use serde_json::Value;
use tracing::{trace, warn};

use fleetsync_api::RawMessage;
use fleetsync_api::wire::{PROTOCOL_DEVICE_REPORT, PROTOCOL_OTHER_EVENT, PushMessage};

use crate::model::SourceId;
use crate::observe::{CoreEvent, EventSink};
use crate::store::{Aggregator, DeviceEventOutcome};

/// Why a recognized message was not dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Neither `data.devId` nor `data.bizData.devId` is present.
    MissingDeviceId,
    /// No cache lists the device.
    UnknownDevice { device_id: String },
    /// The payload does not have the push-message shape.
    Malformed { message: String },
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingDeviceId => write!(f, "message carries no device id"),
            Self::UnknownDevice { device_id } => write!(f, "no source lists device {device_id}"),
            Self::Malformed { message } => write!(f, "malformed push message: {message}"),
        }
    }
}

/// What became of one message.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Reported {
        device_id: String,
        targets: Vec<SourceId>,
        /// Total pairs written across targets, derived ones included.
        pairs: usize,
    },
    DeviceEvent {
        device_id: String,
        targets: Vec<SourceId>,
        outcome: DeviceEventOutcome,
    },
    Dropped(DropReason),
    /// Protocol not handled here; the message is returned unmodified for
    /// the generic handler.
    Unhandled {
        protocol: Option<i64>,
        message: RawMessage,
    },
}

impl RouteOutcome {
    /// Whether the message changed any cache.
    pub fn changed_state(&self) -> bool {
        match self {
            Self::Reported { pairs, .. } => *pairs > 0,
            Self::DeviceEvent { outcome, .. } => *outcome == DeviceEventOutcome::Updated,
            Self::Dropped(_) | Self::Unhandled { .. } => false,
        }
    }
}

/// Extract the device id and copy it up to `data.devId`.
///
/// `data.devId` wins over `data.bizData.devId`. Returns `None` when
/// neither is a non-empty string.
pub fn normalize(raw: &Value) -> Option<(String, Value)> {
    let data = raw.get("data")?;
    let device_id = data
        .get("devId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .or_else(|| {
            data.get("bizData")
                .and_then(|b| b.get("devId"))
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
        })?
        .to_owned();

    let mut normalized = raw.clone();
    if let Some(data) = normalized.get_mut("data").and_then(Value::as_object_mut) {
        data.insert("devId".into(), Value::String(device_id.clone()));
    }
    Some((device_id, normalized))
}

pub struct MessageRouter {
    aggregator: Arc<Aggregator>,
    sink: Arc<dyn EventSink>,
}

impl MessageRouter {
    pub fn new(aggregator: Arc<Aggregator>, sink: Arc<dyn EventSink>) -> Self {
        Self { aggregator, sink }
    }

    pub async fn on_message(&self, source_tag: &SourceId, raw: &RawMessage) -> RouteOutcome {
        let protocol = raw.get("protocol").and_then(Value::as_i64);
        if !matches!(protocol, Some(PROTOCOL_DEVICE_REPORT | PROTOCOL_OTHER_EVENT)) {
            self.sink.emit(CoreEvent::UnhandledMessage {
                source_tag: source_tag.clone(),
                protocol,
            });
            return RouteOutcome::Unhandled {
                protocol,
                message: raw.clone(),
            };
        }

        let Some((device_id, normalized)) = normalize(raw) else {
            warn!(source = %source_tag, ?protocol, "push message without device id, dropping");
            return self.dropped(source_tag, DropReason::MissingDeviceId);
        };

        let message: PushMessage = match serde_json::from_value(normalized) {
            Ok(message) => message,
            Err(e) => {
                return self.dropped(
                    source_tag,
                    DropReason::Malformed {
                        message: e.to_string(),
                    },
                );
            }
        };

        let targets = self.aggregator.delivery_targets(source_tag, &device_id).await;
        if targets.is_empty() {
            return self.dropped(source_tag, DropReason::UnknownDevice { device_id });
        }
        trace!(source = %source_tag, device_id = %device_id, ?targets, protocol = message.protocol, "routing message");

        if message.protocol == PROTOCOL_DEVICE_REPORT {
            let reported = message.data.status.unwrap_or_default();
            let mut pairs = 0;
            for target in &targets {
                match self.aggregator.on_report(target, &device_id, &reported).await {
                    Ok(written) => pairs += written.len(),
                    Err(e) => warn!(source = %target, device_id = %device_id, error = %e, "report delivery failed"),
                }
            }
            RouteOutcome::Reported {
                device_id,
                targets,
                pairs,
            }
        } else {
            let biz = message.data.biz_data.unwrap_or_default();
            let mut outcome = DeviceEventOutcome::UnknownDevice;
            for target in &targets {
                match self.aggregator.on_device_event(target, &device_id, &biz).await {
                    Ok(DeviceEventOutcome::UnknownDevice) => {}
                    Ok(o) => outcome = o,
                    Err(e) => warn!(source = %target, device_id = %device_id, error = %e, "event delivery failed"),
                }
            }
            RouteOutcome::DeviceEvent {
                device_id,
                targets,
                outcome,
            }
        }
    }

    fn dropped(&self, source_tag: &SourceId, reason: DropReason) -> RouteOutcome {
        self.sink.emit(CoreEvent::MessageDropped {
            source_tag: source_tag.clone(),
            reason: reason.to_string(),
        });
        RouteOutcome::Dropped(reason)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_lifts_biz_data_id() {
        let raw = json!({
            "protocol": 20,
            "data": { "bizCode": "online", "bizData": { "devId": "d9", "bizCode": "online" } }
        });
        let (id, normalized) = normalize(&raw).unwrap();
        assert_eq!(id, "d9");
        assert_eq!(normalized["data"]["devId"], "d9");
        assert!(raw["data"].get("devId").is_none());
    }

    #[test]
    fn normalize_prefers_top_level_id() {
        let raw = json!({ "protocol": 4, "data": { "devId": "a", "bizData": { "devId": "b" } } });
        assert_eq!(normalize(&raw).unwrap().0, "a");
    }

    #[test]
    fn normalize_rejects_missing_ids() {
        assert!(normalize(&json!({ "protocol": 4, "data": { "status": [] } })).is_none());
        assert!(normalize(&json!({ "protocol": 4, "data": { "devId": "" } })).is_none());
        assert!(normalize(&json!({ "protocol": 4 })).is_none());
    }

    #[test]
    fn changed_state_only_for_effective_outcomes() {
        let dropped = RouteOutcome::Dropped(DropReason::MissingDeviceId);
        assert!(!dropped.changed_state());

        let reported = RouteOutcome::Reported {
            device_id: "d".into(),
            targets: vec![],
            pairs: 2,
        };
        assert!(reported.changed_state());
    }

    #[tokio::test]
    async fn message_without_any_id_touches_nothing() {
        use crate::config::SourceConfig;
        use crate::model::SourceKind;
        use crate::rules::RuleRegistry;
        use crate::store::SourceCache;
        use fleetsync_api::SnapshotBackend;

        let snapshot = serde_json::from_value(json!({
            "devices": [{ "id": "d1", "status": [{ "code": "switch_1", "value": false }] }]
        }))
        .unwrap();
        let config = SourceConfig::new("home", SourceKind::Sharing);
        let mut aggregator = Aggregator::new();
        aggregator
            .insert(SourceCache::new(
                &config,
                Arc::new(SnapshotBackend::from_snapshot(snapshot)),
                Arc::new(RuleRegistry::new()),
                Arc::new(crate::observe::NullSink),
            ))
            .unwrap();
        aggregator.refresh_all().await;
        let aggregator = Arc::new(aggregator);
        let before = aggregator.aggregated_device_map().await;

        let sink = Arc::new(crate::observe::BroadcastSink::new());
        let mut events = sink.subscribe();
        let router = MessageRouter::new(Arc::clone(&aggregator), sink);

        let raw = json!({ "protocol": 4, "data": { "status": [{ "code": "switch_1", "value": true }] } });
        let outcome = router.on_message(&config.id, &raw).await;

        assert!(matches!(outcome, RouteOutcome::Dropped(DropReason::MissingDeviceId)));
        assert_eq!(aggregator.aggregated_device_map().await, before);
        assert!(matches!(
            &*events.recv().await.unwrap(),
            CoreEvent::MessageDropped { source_tag, .. } if source_tag.as_str() == "home"
        ));
    }
}
