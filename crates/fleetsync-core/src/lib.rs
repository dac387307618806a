//! Multi-source device reconciliation between `fleetsync-api` backends and hosts.
//!
//! This crate owns the domain model, the per-source caches and the routing
//! logic that keeps several backend accounts' views of the same devices
//! consistent:
//!
//! - **[`Hub`]**: Central facade managing the full lifecycle.
//!   [`connect()`](Hub::connect) performs the initial refresh, attaches one
//!   message pump per transport and spawns the periodic refresh task.
//!   [`send_commands()`](Hub::send_commands) splits writes by local
//!   strategy and dispatches each batch through the right transport.
//!
//! - **[`SourceCache`] / [`Aggregator`]**: One cache per backend account,
//!   held in an arena keyed by [`SourceId`]. Devices listed by several
//!   sources are merged into a shared view; a cache may be *backed* by
//!   another and then shares its transport.
//!
//! - **Virtual states** ([`rules`]): Per-category rules that derive extra
//!   capability values at load time and on every report (copy fan-out,
//!   summed accumulators, delta propagation) with synthetic dp ids from
//!   [`VIRTUAL_ID_BASE`] upward.
//!
//! - **[`MessageRouter`]**: Normalizes inbound push payloads and dispatches
//!   status reports and device events to the caches that own the device.
//!
//! - **Observability** ([`observe`]): Every non-obvious decision is emitted
//!   as a [`CoreEvent`] through an [`EventSink`].

pub mod command;
pub mod config;
pub mod convert;
pub mod error;
pub mod hub;
pub mod model;
pub mod observe;
pub mod router;
pub mod rules;
pub mod store;

// ── Primary re-exports ──────────────────────────────────────────────
pub use command::{
    BatchKind, CommandPlan, CommandRouter, DeviceCommand, DispatchReport, DispatchedBatch,
};
pub use config::{CommandRouting, HubConfig, SourceConfig};
pub use error::CoreError;
pub use hub::{ConnectionState, Hub, HubBuilder, UnhandledMessage};
pub use observe::{BroadcastSink, CoreEvent, EventSink, NullSink, TracingSink};
pub use router::{DropReason, MessageRouter, RouteOutcome};
pub use rules::{RuleDeclaration, RuleRegistry, VirtualStateKind, VirtualStateRule};
pub use store::{Aggregator, DeviceEventOutcome, DeviceMap, RefreshReport, SourceCache};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    CapabilitySpec, CodecHints, DeviceRecord, LocalStrategy, SourceId, SourceKind, StatusPair,
    StrategyEntry, VIRTUAL_ID_BASE, ValueType,
};
