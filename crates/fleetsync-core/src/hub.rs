// ── Hub ──
//
// Lifecycle facade over the aggregator. Builds the cache arena from a
// `HubConfig`, wires message sources into the router through per-source
// pump tasks, runs the periodic refresh and routes writes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleetsync_api::{DeviceBackend, MessageSource, RawMessage};

use crate::command::{CommandPlan, CommandRouter, DeviceCommand, DispatchReport};
use crate::config::HubConfig;
use crate::error::CoreError;
use crate::model::{DeviceRecord, SourceId};
use crate::observe::{CoreEvent, EventSink, TracingSink};
use crate::router::{MessageRouter, RouteOutcome};
use crate::rules::RuleRegistry;
use crate::store::{Aggregator, DeviceMap, RefreshReport, SourceCache};

const UNHANDLED_CHANNEL_SIZE: usize = 256;

// ── ConnectionState ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// A message whose protocol the router does not handle.
#[derive(Debug, Clone, PartialEq)]
pub struct UnhandledMessage {
    pub source_tag: SourceId,
    pub protocol: Option<i64>,
    pub message: RawMessage,
}

struct Attachment {
    source: Arc<dyn MessageSource>,
    topics: Vec<String>,
}

// ── Builder ──────────────────────────────────────────────────────────

/// Registers a backend for every configured source and any number of
/// message sources, then validates the whole set.
pub struct HubBuilder {
    config: HubConfig,
    rules: Arc<RuleRegistry>,
    sink: Arc<dyn EventSink>,
    backends: HashMap<SourceId, Arc<dyn DeviceBackend>>,
    message_sources: Vec<(SourceId, Arc<dyn MessageSource>)>,
}

impl HubBuilder {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            rules: Arc::new(RuleRegistry::new()),
            sink: Arc::new(TracingSink),
            backends: HashMap::new(),
            message_sources: Vec::new(),
        }
    }

    pub fn rules(mut self, rules: Arc<RuleRegistry>) -> Self {
        self.rules = rules;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn backend(mut self, id: impl Into<SourceId>, backend: Arc<dyn DeviceBackend>) -> Self {
        self.backends.insert(id.into(), backend);
        self
    }

    /// Attach a message bus connection. A backed source's registration is
    /// moved onto its backing; when the backing already has one, the
    /// registration is discarded.
    pub fn message_source(mut self, id: impl Into<SourceId>, source: Arc<dyn MessageSource>) -> Self {
        self.message_sources.push((id.into(), source));
        self
    }

    pub fn build(mut self) -> Result<Hub, CoreError> {
        self.config.validate()?;

        let mut aggregator = Aggregator::new();
        for source in &self.config.sources {
            let backend = self.backends.remove(&source.id).ok_or_else(|| CoreError::Config {
                message: format!("no backend registered for source '{}'", source.id),
            })?;
            aggregator.insert(SourceCache::new(
                source,
                backend,
                Arc::clone(&self.rules),
                Arc::clone(&self.sink),
            ))?;
        }
        if let Some(stray) = self.backends.keys().next() {
            return Err(CoreError::Config {
                message: format!("backend registered for unconfigured source '{stray}'"),
            });
        }

        let mut attachments: IndexMap<SourceId, Attachment> = IndexMap::new();
        for (id, source) in self.message_sources {
            let Some(transport) = aggregator.transport_source(&id).cloned() else {
                return Err(CoreError::SourceNotFound { source_id: id });
            };
            if transport != id {
                debug!(source = %id, backing = %transport, "message source redirected to backing");
            }
            if attachments.contains_key(&transport) {
                warn!(source = %id, transport = %transport, "transport already has a message source, ignoring");
                continue;
            }
            let topics = self
                .config
                .sources
                .iter()
                .filter(|s| s.id == transport || s.backing.as_ref() == Some(&transport))
                .flat_map(|s| s.topics.iter().cloned())
                .collect();
            attachments.insert(transport, Attachment { source, topics });
        }

        let aggregator = Arc::new(aggregator);
        let router = MessageRouter::new(Arc::clone(&aggregator), Arc::clone(&self.sink));
        let commands = CommandRouter::new(
            Arc::clone(&aggregator),
            self.config.command_routing,
            Arc::clone(&self.sink),
        );

        let (connection_state, _) = watch::channel(ConnectionState::Disconnected);
        let (changes, _) = watch::channel(0u64);
        let (unhandled_tx, _) = broadcast::channel(UNHANDLED_CHANNEL_SIZE);
        let cancel = CancellationToken::new();
        let cancel_child = cancel.child_token();

        Ok(Hub {
            inner: Arc::new(HubInner {
                config: self.config,
                aggregator,
                router,
                commands,
                attachments,
                sink: self.sink,
                connection_state,
                changes,
                unhandled_tx,
                known_ids: Mutex::new(BTreeSet::new()),
                cancel,
                cancel_child: Mutex::new(cancel_child),
                task_handles: Mutex::new(Vec::new()),
            }),
        })
    }
}

// ── Hub ──────────────────────────────────────────────────────────────

/// The main entry point for hosts.
///
/// Cheaply cloneable via `Arc<HubInner>`.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: HubConfig,
    aggregator: Arc<Aggregator>,
    router: MessageRouter,
    commands: CommandRouter,
    /// Message sources keyed by the transport source they feed.
    attachments: IndexMap<SourceId, Attachment>,
    sink: Arc<dyn EventSink>,
    connection_state: watch::Sender<ConnectionState>,
    /// Bumped whenever the directory may have changed.
    changes: watch::Sender<u64>,
    unhandled_tx: broadcast::Sender<Arc<UnhandledMessage>>,
    /// Directory ids as of the last refresh.
    known_ids: Mutex<BTreeSet<String>>,
    cancel: CancellationToken,
    /// Child token for the current connection, replaced on reconnect.
    cancel_child: Mutex<CancellationToken>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    pub fn builder(config: HubConfig) -> HubBuilder {
        HubBuilder::new(config)
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.inner.aggregator
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Initial refresh, then message pumps and the periodic refresh task.
    ///
    /// Fails only when every source fails its initial refresh. A message
    /// source that cannot connect is logged and skipped; its devices are
    /// still kept current by periodic refreshes.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let _ = self
            .inner
            .connection_state
            .send(ConnectionState::Connecting);

        let child = self.inner.cancel.child_token();
        *self.inner.cancel_child.lock().await = child.clone();

        if let Err(e) = self.refresh().await {
            let _ = self.inner.connection_state.send(ConnectionState::Failed);
            return Err(e);
        }

        let mut handles = self.inner.task_handles.lock().await;

        for (tag, attachment) in &self.inner.attachments {
            let rx = attachment.source.listen();
            if let Err(e) = attachment.source.connect().await {
                warn!(source = %tag, error = %e, "message source failed to connect (non-fatal)");
                continue;
            }
            for topic in &attachment.topics {
                if let Err(e) = attachment.source.subscribe(topic).await {
                    warn!(source = %tag, topic = %topic, error = %e, "subscribe failed");
                }
            }
            handles.push(tokio::spawn(pump_task(
                self.clone(),
                tag.clone(),
                rx,
                child.clone(),
            )));
        }

        let interval_secs = self.inner.config.refresh_interval_secs;
        if interval_secs > 0 {
            handles.push(tokio::spawn(refresh_task(
                self.clone(),
                interval_secs,
                child.clone(),
            )));
        }

        let _ = self.inner.connection_state.send(ConnectionState::Connected);
        info!(
            sources = self.inner.aggregator.len(),
            pumps = self.inner.attachments.len(),
            "hub connected"
        );
        Ok(())
    }

    /// Cancel background tasks and disconnect every message source.
    pub async fn disconnect(&self) {
        self.inner.cancel_child.lock().await.cancel();

        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        drop(handles);

        for attachment in self.inner.attachments.values() {
            attachment.source.disconnect().await;
        }

        let _ = self
            .inner
            .connection_state
            .send(ConnectionState::Disconnected);
        debug!("hub disconnected");
    }

    /// Refresh every source and merge.
    ///
    /// Partial failures are reported in the returned [`RefreshReport`];
    /// the call fails only when every source failed.
    pub async fn refresh(&self) -> Result<RefreshReport, CoreError> {
        let mut report = self.inner.aggregator.refresh_all().await;
        if report.refreshed.is_empty() && !report.failed.is_empty() {
            let (_, err) = report.failed.remove(0);
            for (source, other) in &report.failed {
                warn!(source = %source, error = %other, "source refresh failed");
            }
            return Err(err);
        }

        let mut known = self.inner.known_ids.lock().await;
        report.removed = self.inner.aggregator.stale_device_ids(&known).await;
        if !report.removed.is_empty() {
            self.inner.sink.emit(CoreEvent::DevicesRemoved {
                device_ids: report.removed.clone(),
            });
        }
        *known = self
            .inner
            .aggregator
            .aggregated_device_map()
            .await
            .into_keys()
            .collect();
        drop(known);

        self.bump();
        Ok(report)
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// The canonical directory.
    pub async fn devices(&self) -> DeviceMap {
        self.inner.aggregator.aggregated_device_map().await
    }

    pub async fn device(&self, device_id: &str) -> Result<DeviceRecord, CoreError> {
        self.inner
            .aggregator
            .device(device_id)
            .await
            .ok_or_else(|| CoreError::DeviceNotFound {
                identifier: device_id.to_owned(),
            })
    }

    // ── Writes ───────────────────────────────────────────────────────

    pub async fn plan_commands(&self, device_id: &str, commands: &[DeviceCommand]) -> CommandPlan {
        self.inner.commands.plan(device_id, commands).await
    }

    pub async fn send_commands(
        &self,
        device_id: &str,
        commands: &[DeviceCommand],
    ) -> Result<DispatchReport, CoreError> {
        self.inner.commands.send_commands(device_id, commands).await
    }

    // ── Messages ─────────────────────────────────────────────────────

    /// Route one inbound payload as if it arrived on `source_tag`'s bus.
    pub async fn route_message(&self, source_tag: &SourceId, raw: &RawMessage) -> RouteOutcome {
        let outcome = self.inner.router.on_message(source_tag, raw).await;
        if outcome.changed_state() {
            self.bump();
        }
        if let RouteOutcome::Unhandled {
            protocol,
            ref message,
        } = outcome
        {
            let _ = self.inner.unhandled_tx.send(Arc::new(UnhandledMessage {
                source_tag: source_tag.clone(),
                protocol,
                message: message.clone(),
            }));
        }
        outcome
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Directory version; bumped after refreshes and effective messages.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    pub fn unhandled_messages(&self) -> broadcast::Receiver<Arc<UnhandledMessage>> {
        self.inner.unhandled_tx.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection_state.subscribe()
    }

    fn bump(&self) {
        self.inner.changes.send_modify(|v| *v = v.wrapping_add(1));
    }
}

// ── Background tasks ─────────────────────────────────────────────────

async fn pump_task(
    hub: Hub,
    tag: SourceId,
    mut rx: broadcast::Receiver<Arc<RawMessage>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = rx.recv() => {
                match result {
                    Ok(raw) => {
                        hub.route_message(&tag, &raw).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(source = %tag, skipped = n, "message pump lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    debug!(source = %tag, "message pump stopped");
}

async fn refresh_task(hub: Hub, interval_secs: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                match hub.refresh().await {
                    Ok(report) if !report.is_complete() => {
                        let failed: Vec<String> = report.failed_sources().map(ToString::to_string).collect();
                        warn!(?failed, "periodic refresh incomplete");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "periodic refresh failed"),
                }
            }
        }
    }
}
