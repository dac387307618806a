// ── Command routing ──
//
// Classification is a pure function of the device's local strategy.
// Dispatch resolves every needed source before sending anything, so a
// missing transport fails the call without a partial write.

use std::sync::Arc;

use tracing::debug;

use fleetsync_api::wire::{CommandPayload, PropertyPayload};

use super::{BatchKind, CommandPlan, DeviceCommand, DispatchReport, DispatchedBatch};
use crate::config::CommandRouting;
use crate::error::CoreError;
use crate::model::{DeviceRecord, SourceId, SourceKind, value};
use crate::observe::{CoreEvent, EventSink};
use crate::store::Aggregator;

/// Which batch a write to `code` belongs to.
///
/// `use_open_api && property_update` selects a property update on the
/// alternate transport, `use_open_api` alone a regular command there, and
/// anything else (no strategy entry included) the default transport.
pub fn classify(device: &DeviceRecord, code: &str) -> BatchKind {
    match device.local_strategy.entry_for_code(code) {
        Some((_, entry)) if entry.use_open_api && entry.property_update => {
            BatchKind::PropertyAlternate
        }
        Some((_, entry)) if entry.use_open_api => BatchKind::RegularAlternate,
        _ => BatchKind::RegularDefault,
    }
}

/// Split `commands` into batches against a snapshot of the device.
pub fn plan(device_id: &str, device: Option<&DeviceRecord>, commands: &[DeviceCommand]) -> CommandPlan {
    let mut plan = CommandPlan {
        device_id: device_id.to_owned(),
        known_device: device.is_some(),
        ..CommandPlan::default()
    };

    let Some(device) = device else {
        plan.regular_default = commands.iter().map(CommandPayload::from).collect();
        return plan;
    };

    for command in commands {
        match classify(device, &command.code) {
            BatchKind::RegularDefault => plan.regular_default.push(command.into()),
            BatchKind::RegularAlternate => plan.regular_alternate.push(command.into()),
            BatchKind::PropertyAlternate => plan.property_alternate.push(PropertyPayload {
                code: command.code.clone(),
                value: value::property_string(&command.value, device.value_type_of(&command.code)),
            }),
        }
    }
    plan
}

pub struct CommandRouter {
    aggregator: Arc<Aggregator>,
    routing: CommandRouting,
    sink: Arc<dyn EventSink>,
}

impl CommandRouter {
    pub fn new(aggregator: Arc<Aggregator>, routing: CommandRouting, sink: Arc<dyn EventSink>) -> Self {
        Self {
            aggregator,
            routing,
            sink,
        }
    }

    /// Plan without sending. The device snapshot is the canonical record.
    pub async fn plan(&self, device_id: &str, commands: &[DeviceCommand]) -> CommandPlan {
        let device = self.aggregator.device(device_id).await;
        plan(device_id, device.as_ref(), commands)
    }

    async fn resolve_source(
        &self,
        device_id: &str,
        kind: SourceKind,
        operation: &str,
    ) -> Result<SourceId, CoreError> {
        self.aggregator
            .source_for(device_id, kind)
            .await
            .map(|cache| cache.id().clone())
            .ok_or_else(|| CoreError::SourceUnavailable {
                kind: kind.to_string(),
                operation: operation.to_owned(),
            })
    }

    /// Plan and dispatch. Empty batches are not sent.
    pub async fn send_commands(
        &self,
        device_id: &str,
        commands: &[DeviceCommand],
    ) -> Result<DispatchReport, CoreError> {
        let plan = self.plan(device_id, commands).await;

        let default = if plan.regular_default.is_empty() {
            None
        } else {
            Some(
                self.resolve_source(device_id, self.routing.default_kind, "send regular commands")
                    .await?,
            )
        };
        let alternate = if plan.regular_alternate.is_empty() && plan.property_alternate.is_empty() {
            None
        } else {
            Some(
                self.resolve_source(
                    device_id,
                    self.routing.alternate_kind,
                    "send strategy-routed commands",
                )
                .await?,
            )
        };

        let mut dispatched = Vec::new();

        if let Some(source) = default {
            let backend = self.aggregator.command_backend(&source)?;
            backend.send_commands(device_id, &plan.regular_default).await?;
            dispatched.push(self.dispatched(BatchKind::RegularDefault, source, device_id, plan.regular_default.len()));
        }

        if let Some(source) = alternate {
            let backend = self.aggregator.command_backend(&source)?;
            if !plan.regular_alternate.is_empty() {
                backend.send_commands(device_id, &plan.regular_alternate).await?;
                dispatched.push(self.dispatched(
                    BatchKind::RegularAlternate,
                    source.clone(),
                    device_id,
                    plan.regular_alternate.len(),
                ));
            }
            if !plan.property_alternate.is_empty() {
                backend.send_properties(device_id, &plan.property_alternate).await?;
                dispatched.push(self.dispatched(
                    BatchKind::PropertyAlternate,
                    source,
                    device_id,
                    plan.property_alternate.len(),
                ));
            }
        }

        debug!(device_id, batches = dispatched.len(), known = plan.known_device, "commands dispatched");
        Ok(DispatchReport { plan, dispatched })
    }

    fn dispatched(&self, kind: BatchKind, source_id: SourceId, device_id: &str, count: usize) -> DispatchedBatch {
        self.sink.emit(CoreEvent::CommandBatchDispatched {
            source_id: source_id.clone(),
            device_id: device_id.to_owned(),
            batch: kind,
            count,
        });
        DispatchedBatch {
            kind,
            source_id,
            count,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{CapabilitySpec, CodecHints, StrategyEntry, ValueType};
    use serde_json::json;

    fn entry(code: &str, use_open_api: bool, property_update: bool) -> StrategyEntry {
        StrategyEntry {
            status_code: code.into(),
            config_item: CodecHints::default(),
            property_update,
            use_open_api,
        }
    }

    fn light() -> DeviceRecord {
        let mut dev = DeviceRecord::new("light");
        dev.local_strategy.insert(20, entry("switch_led", true, true));
        dev.local_strategy.insert(21, entry("work_mode", true, false));
        dev.local_strategy.insert(22, entry("bright_value", false, false));
        dev.function.insert(
            "switch_led".into(),
            CapabilitySpec {
                code: "switch_led".into(),
                value_type: ValueType::Boolean,
                values: "{}".into(),
            },
        );
        dev
    }

    #[test]
    fn classification_follows_strategy_flags() {
        let dev = light();
        assert_eq!(classify(&dev, "switch_led"), BatchKind::PropertyAlternate);
        assert_eq!(classify(&dev, "work_mode"), BatchKind::RegularAlternate);
        assert_eq!(classify(&dev, "bright_value"), BatchKind::RegularDefault);
        assert_eq!(classify(&dev, "unmapped"), BatchKind::RegularDefault);
    }

    #[test]
    fn property_batch_carries_boolean_literal() {
        let dev = light();
        let plan = plan(
            "light",
            Some(&dev),
            &[
                DeviceCommand::new("switch_led", json!(true)),
                DeviceCommand::new("work_mode", json!("colour")),
                DeviceCommand::new("bright_value", json!(500)),
            ],
        );

        assert!(plan.known_device);
        assert_eq!(
            plan.property_alternate,
            vec![PropertyPayload {
                code: "switch_led".into(),
                value: "true".into()
            }]
        );
        assert_eq!(plan.regular_alternate[0].value, json!("colour"));
        assert_eq!(plan.regular_default[0].code, "bright_value");
        assert_eq!(plan.batches().len(), 3);
    }

    #[test]
    fn unknown_device_sends_raw_list_to_default() {
        let commands = [
            DeviceCommand::new("switch_led", json!(true)),
            DeviceCommand::new("anything", json!({"x": 1})),
        ];
        let plan = plan("ghost", None, &commands);

        assert!(!plan.known_device);
        assert_eq!(plan.regular_default.len(), 2);
        assert_eq!(plan.regular_default[1].value, json!({"x": 1}));
        assert_eq!(plan.batches(), vec![(BatchKind::RegularDefault, 2)]);
    }

    #[test]
    fn empty_command_list_plans_nothing() {
        let plan = plan("light", Some(&light()), &[]);
        assert!(plan.is_empty());
        assert!(plan.batches().is_empty());
    }
}
