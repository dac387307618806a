//! Push-channel seam.
//!
//! A [`MessageSource`] is one backend account's message bus connection. The
//! connection and reconnect machinery belongs to the implementation; the
//! core only needs connect/disconnect/publish/subscribe and a stream of raw
//! payloads delivered through a [`tokio::sync::broadcast`] channel.
//!
//! [`LoopbackSource`] is an in-memory implementation used by tests and by
//! the CLI's replay mode.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};

use crate::error::Error;

// ── Broadcast channel capacity ───────────────────────────────────────

const MESSAGE_CHANNEL_CAPACITY: usize = 1024;

/// A raw push payload exactly as the broker delivered it.
pub type RawMessage = Value;

// ── MessageSource ────────────────────────────────────────────────────

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Open the connection. Idempotent.
    async fn connect(&self) -> Result<(), Error>;

    /// Close the connection. Never fails; errors are logged by the implementation.
    async fn disconnect(&self);

    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), Error>;

    async fn subscribe(&self, topic: &str) -> Result<(), Error>;

    /// New receiver for inbound payloads (the `onMessage` callback contract).
    ///
    /// If a consumer falls behind it receives
    /// [`broadcast::error::RecvError::Lagged`].
    fn listen(&self) -> broadcast::Receiver<Arc<RawMessage>>;

    fn is_connected(&self) -> bool;
}

// ── LoopbackSource ───────────────────────────────────────────────────

/// In-memory message source.
///
/// [`inject`](Self::inject) plays the role of the broker: payloads reach
/// listeners only while the source is connected. Published payloads are
/// recorded and looped back to listeners when the topic is subscribed.
pub struct LoopbackSource {
    connected: AtomicBool,
    message_tx: broadcast::Sender<Arc<RawMessage>>,
    topics: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, Value)>>,
}

impl LoopbackSource {
    pub fn new() -> Self {
        let (message_tx, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        Self {
            connected: AtomicBool::new(false),
            message_tx,
            topics: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Deliver a payload to every listener. Returns the number of listeners
    /// reached (zero when disconnected).
    pub fn inject(&self, payload: RawMessage) -> usize {
        if !self.is_connected() {
            tracing::debug!("loopback source disconnected, dropping injected payload");
            return 0;
        }
        self.message_tx.send(Arc::new(payload)).unwrap_or(0)
    }

    /// Every `(topic, payload)` published so far.
    pub async fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().await.clone()
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.topics.lock().await.clone()
    }
}

impl Default for LoopbackSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSource for LoopbackSource {
    async fn connect(&self) -> Result<(), Error> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            tracing::debug!("loopback source connected");
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::debug!("loopback source disconnected");
        }
    }

    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.published
            .lock()
            .await
            .push((topic.to_owned(), payload.clone()));

        let subscribed = self.topics.lock().await.iter().any(|t| t == topic);
        if subscribed {
            let _ = self.message_tx.send(Arc::new(payload.clone()));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let mut topics = self.topics.lock().await;
        if !topics.iter().any(|t| t == topic) {
            topics.push(topic.to_owned());
        }
        Ok(())
    }

    fn listen(&self) -> broadcast::Receiver<Arc<RawMessage>> {
        self.message_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
