// ── Observability ──
//
// Structured events emitted by the caches, the router and the command
// router. Components receive an `Arc<dyn EventSink>` at construction;
// nothing in the core reaches for a global hook.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::command::BatchKind;
use crate::model::SourceId;
use crate::rules::Derivation;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Something the core did or declined to do.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    RefreshFinished {
        source_id: SourceId,
        devices: usize,
    },
    RefreshFailed {
        source_id: SourceId,
        message: String,
    },
    DerivationApplied {
        source_id: SourceId,
        device_id: String,
        derivation: Derivation,
    },
    ReportApplied {
        source_id: SourceId,
        device_id: String,
        pairs: usize,
    },
    /// A reported pair could not be resolved to a capability code.
    PairDropped {
        source_id: SourceId,
        device_id: String,
        dp_id: Option<u32>,
        reason: String,
    },
    MessageDropped {
        source_tag: SourceId,
        reason: String,
    },
    /// The message carried a protocol the router does not handle.
    UnhandledMessage {
        source_tag: SourceId,
        protocol: Option<i64>,
    },
    DeviceUpdated {
        source_id: SourceId,
        device_id: String,
        biz_code: String,
    },
    /// The backend announced a change only a full refresh can apply.
    RefreshRequested {
        source_id: SourceId,
        device_id: String,
        biz_code: String,
    },
    DevicesRemoved {
        device_ids: Vec<String>,
    },
    CommandBatchDispatched {
        source_id: SourceId,
        device_id: String,
        batch: BatchKind,
        count: usize,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: CoreEvent);
}

// ── TracingSink ──────────────────────────────────────────────────────

/// Forwards every event to `tracing` at a level matching its weight.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: CoreEvent) {
        match event {
            CoreEvent::RefreshFinished { source_id, devices } => {
                info!(source = %source_id, devices, "refresh finished");
            }
            CoreEvent::RefreshFailed { source_id, message } => {
                warn!(source = %source_id, error = %message, "refresh failed");
            }
            CoreEvent::DerivationApplied {
                source_id,
                device_id,
                derivation,
            } => {
                debug!(source = %source_id, device_id = %device_id, ?derivation, "virtual states derived");
            }
            CoreEvent::ReportApplied {
                source_id,
                device_id,
                pairs,
            } => {
                trace!(source = %source_id, device_id = %device_id, pairs, "report applied");
            }
            CoreEvent::PairDropped {
                source_id,
                device_id,
                dp_id,
                reason,
            } => {
                debug!(source = %source_id, device_id = %device_id, ?dp_id, reason = %reason, "reported pair dropped");
            }
            CoreEvent::MessageDropped { source_tag, reason } => {
                warn!(source = %source_tag, reason = %reason, "message dropped");
            }
            CoreEvent::UnhandledMessage {
                source_tag,
                protocol,
            } => {
                debug!(source = %source_tag, ?protocol, "message passed to generic handler");
            }
            CoreEvent::DeviceUpdated {
                source_id,
                device_id,
                biz_code,
            } => {
                debug!(source = %source_id, device_id = %device_id, biz_code = %biz_code, "device updated");
            }
            CoreEvent::RefreshRequested {
                source_id,
                device_id,
                biz_code,
            } => {
                info!(source = %source_id, device_id = %device_id, biz_code = %biz_code, "device change needs a full refresh");
            }
            CoreEvent::DevicesRemoved { device_ids } => {
                info!(count = device_ids.len(), ?device_ids, "devices removed from directory");
            }
            CoreEvent::CommandBatchDispatched {
                source_id,
                device_id,
                batch,
                count,
            } => {
                debug!(source = %source_id, device_id = %device_id, %batch, count, "command batch dispatched");
            }
        }
    }
}

// ── BroadcastSink ────────────────────────────────────────────────────

/// Fans events out to any number of subscribers.
///
/// Events emitted while nobody is subscribed are discarded.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Arc<CoreEvent>>,
}

impl BroadcastSink {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CoreEvent>> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(Arc::new(event));
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: CoreEvent) {}
}
