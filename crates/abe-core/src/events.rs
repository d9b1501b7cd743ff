//! In-process event bus with typed publish/subscribe helpers.
//!
//! ```rust,ignore
//! #[derive(Serialize, Deserialize)]
//! struct UserCreated { id: i64 }
//!
//! let sub = subscribe_event(bus.as_ref(), "user.created", SubscribeOptions::default(),
//!     |event: UserCreated| async move {
//!         tracing::info!(id = event.id, "welcome mail queued");
//!         Ok(())
//!     }).await?;
//!
//! publish_event(bus.as_ref(), "user.created", &UserCreated { id: 7 }).await?;
//! sub.unsubscribe().await;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::AbeError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("event bus is closed")]
    Closed,

    #[error("event topic must not be empty")]
    EmptyTopic,

    #[error("event codec error: {0}")]
    Codec(String),
}

/// A published message. The payload is opaque to the bus.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub payload: Bytes,
    pub metadata: HashMap<String, String>,
    pub published_at: DateTime<Utc>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload: payload.into(),
            metadata: HashMap::new(),
            published_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub type MessageHandler =
    Arc<dyn Fn(Message) -> BoxFuture<'static, Result<(), AbeError>> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AbeError>> + Send + 'static,
{
    Arc::new(move |msg: Message| -> BoxFuture<'static, Result<(), AbeError>> { Box::pin(f(msg)) })
}

#[derive(Debug, Clone, Copy)]
pub struct SubscribeOptions {
    /// Messages handled at once by this subscription. Values below one
    /// are treated as one.
    pub concurrency: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        SubscribeOptions { concurrency: 1 }
    }
}

impl SubscribeOptions {
    pub fn concurrency(n: usize) -> Self {
        SubscribeOptions { concurrency: n.max(1) }
    }
}

/// Message-level bus abstraction. Typed access goes through
/// [`publish_event`] and [`subscribe_event`].
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    async fn publish(&self, message: Message) -> Result<(), EventError>;

    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        options: SubscribeOptions,
    ) -> Result<Subscription, EventError>;

    /// Stop delivery and wait for running handlers.
    async fn close(&self) -> Result<(), EventError>;
}

/// Handle for one subscription.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, token: CancellationToken, tracker: TaskTracker) -> Self {
        Subscription {
            topic: topic.into(),
            token,
            tracker,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Stop receiving and wait until in-flight handlers return.
    pub async fn unsubscribe(self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Broadcast-channel bus; every subscription sees every message published
/// to its topic after it subscribed.
pub struct InMemoryEventBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Message>>>,
    trackers: Mutex<Vec<TaskTracker>>,
    capacity: usize,
    closed: AtomicBool,
    root: CancellationToken,
}

impl std::fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("topics", &self.topics.lock().len())
            .field("capacity", &self.capacity)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl InMemoryEventBus {
    pub fn new(capacity: usize) -> Self {
        InMemoryEventBus {
            topics: Mutex::new(HashMap::new()),
            trackers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            root: CancellationToken::new(),
        }
    }

    /// Subscriptions whose workers are still running.
    pub fn subscription_count(&self) -> usize {
        self.prune();
        self.trackers.lock().len()
    }

    /// Topics with at least one live receiver.
    pub fn topic_count(&self) -> usize {
        self.prune();
        self.topics.lock().len()
    }

    // Drops finished subscriptions and topics nobody listens to.
    fn prune(&self) {
        self.trackers.lock().retain(|t| !(t.is_closed() && t.is_empty()));
        self.topics.lock().retain(|_, sender| sender.receiver_count() > 0);
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Message> {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, message: Message) -> Result<(), EventError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventError::Closed);
        }
        if message.topic.is_empty() {
            return Err(EventError::EmptyTopic);
        }
        let topic = message.topic.clone();
        let sender = self.topics.lock().get(&topic).cloned();
        match sender {
            Some(sender) => {
                if sender.send(message).is_err() {
                    tracing::debug!(%topic, "event published without subscribers");
                    self.prune();
                }
            }
            None => tracing::debug!(%topic, "event published without subscribers"),
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        options: SubscribeOptions,
    ) -> Result<Subscription, EventError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventError::Closed);
        }
        if topic.is_empty() {
            return Err(EventError::EmptyTopic);
        }
        self.prune();
        let mut receiver = self.sender(topic).subscribe();
        let token = self.root.child_token();
        let tracker = TaskTracker::new();
        let permits = Arc::new(Semaphore::new(options.concurrency.max(1)));

        let loop_token = token.clone();
        let loop_tracker = tracker.clone();
        let loop_topic = topic.to_string();
        tracker.spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = loop_token.cancelled() => break,
                    received = receiver.recv() => received,
                };
                let message = match received {
                    Ok(message) => message,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(topic = %loop_topic, skipped, "event subscriber lagging, messages dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let permit = tokio::select! {
                    _ = loop_token.cancelled() => None,
                    permit = permits.clone().acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else { break };
                let handler = handler.clone();
                loop_tracker.spawn(async move {
                    let _permit = permit;
                    deliver(handler, message).await;
                });
            }
            loop_tracker.close();
        });

        self.trackers.lock().push(tracker.clone());
        tracing::debug!(%topic, concurrency = options.concurrency, "event subscription started");
        Ok(Subscription::new(topic, token, tracker))
    }

    async fn close(&self) -> Result<(), EventError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.root.cancel();
        self.topics.lock().clear();
        let trackers = std::mem::take(&mut *self.trackers.lock());
        for tracker in trackers {
            tracker.close();
            tracker.wait().await;
        }
        tracing::debug!("event bus closed");
        Ok(())
    }
}

async fn deliver(handler: MessageHandler, message: Message) {
    let topic = message.topic.clone();
    let id = message.id.clone();
    match AssertUnwindSafe(handler(message)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::error!(%topic, message_id = %id, error = %err, "event handler failed");
        }
        Err(_) => {
            tracing::error!(%topic, message_id = %id, "event handler panicked");
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Typed helpers
// ═══════════════════════════════════════════════════════════════

/// Event (de)serialization.
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> Result<Bytes, EventError>;
    fn decode(&self, payload: &[u8]) -> Result<T, EventError>;
}

/// Default codec: JSON via serde_json.
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        JsonCodec(PhantomData)
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, value: &T) -> Result<Bytes, EventError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| EventError::Codec(e.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> Result<T, EventError> {
        serde_json::from_slice(payload).map_err(|e| EventError::Codec(e.to_string()))
    }
}

pub async fn publish_with<T, C>(bus: &dyn EventBus, topic: &str, event: &T, codec: &C) -> Result<(), EventError>
where
    C: Codec<T>,
{
    let payload = codec.encode(event)?;
    bus.publish(Message::new(topic, payload)).await
}

pub async fn subscribe_with<T, C, F, Fut>(
    bus: &dyn EventBus,
    topic: &str,
    options: SubscribeOptions,
    codec: C,
    f: F,
) -> Result<Subscription, EventError>
where
    T: Send + 'static,
    C: Codec<T>,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AbeError>> + Send + 'static,
{
    let codec = Arc::new(codec);
    let f = Arc::new(f);
    let wrapped = handler(move |message: Message| {
        let decoded = codec.decode(&message.payload);
        let f = f.clone();
        async move {
            let event = decoded?;
            f(event).await
        }
    });
    bus.subscribe(topic, wrapped, options).await
}

/// Publish `event` as JSON.
pub async fn publish_event<T>(bus: &dyn EventBus, topic: &str, event: &T) -> Result<(), EventError>
where
    T: Serialize + DeserializeOwned + 'static,
{
    publish_with(bus, topic, event, &JsonCodec::<T>::default()).await
}

/// Subscribe with JSON decoding. Payloads that fail to decode are logged
/// and skipped.
pub async fn subscribe_event<T, F, Fut>(
    bus: &dyn EventBus,
    topic: &str,
    options: SubscribeOptions,
    f: F,
) -> Result<Subscription, EventError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AbeError>> + Send + 'static,
{
    subscribe_with(bus, topic, options, JsonCodec::<T>::default(), f).await
}
