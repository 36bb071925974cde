//! Log fan-out hub.
//!
//! All producers push [`LogEvent`]s into one bounded intake queue through a
//! cloneable [`LogSink`]. A single distribution task drains the intake and
//! copies each event into every registered subscriber's own bounded queue.
//!
//! Nothing in here ever waits for room in a queue: a full intake drops the
//! event at the producer, a full subscriber queue drops the event for that
//! subscriber only. Events are not stored; a subscriber only sees what is
//! published while it is registered.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::wall_now;
use crate::metrics::{LOG_EVENTS_DROPPED, LOG_SUBSCRIBERS};

/// Default intake queue size.
pub const DEFAULT_INTAKE_CAPACITY: usize = 100;

/// Default per-subscriber queue size.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timestamped diagnostic line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub time: DateTime<Utc>,
    pub level: Severity,
    pub message: String,
}

impl LogEvent {
    pub fn new(level: Severity, message: impl Into<String>) -> Self {
        Self {
            time: wall_now(),
            level,
            message: message.into(),
        }
    }
}

/// Producer handle onto the hub's intake queue.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: mpsc::Sender<LogEvent>,
}

impl LogSink {
    /// A sink feeding a plain bounded channel, without a hub behind it.
    pub fn channel(capacity: usize) -> (LogSink, mpsc::Receiver<LogEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (LogSink { tx }, rx)
    }

    /// Publishes without waiting. Returns `false` if the event was dropped.
    pub fn publish(&self, event: LogEvent) -> bool {
        debug!(
            target: "tg_wireprobe::events",
            level = event.level.as_str(),
            "{}",
            event.message
        );
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                LOG_EVENTS_DROPPED.with_label_values(&["intake"]).inc();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn emit(&self, level: Severity, message: impl Into<String>) -> bool {
        self.publish(LogEvent::new(level, message))
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(Severity::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(Severity::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(Severity::Error, message);
    }
}

/// Opaque subscriber handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct SubscriberRegistry {
    next_id: AtomicU64,
    queues: RwLock<HashMap<SubscriberId, mpsc::Sender<LogEvent>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SubscriberRegistry {
    fn register(&self, capacity: usize) -> (SubscriberId, mpsc::Receiver<LogEvent>) {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        queues.insert(id, tx);
        LOG_SUBSCRIBERS.set(queues.len() as f64);
        (id, rx)
    }

    fn remove(&self, id: SubscriberId) -> bool {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let removed = queues.remove(&id).is_some();
        LOG_SUBSCRIBERS.set(queues.len() as f64);
        removed
    }

    fn len(&self) -> usize {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn fan_out(&self, event: &LogEvent) {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        for tx in queues.values() {
            match tx.try_send(event.clone()) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    LOG_EVENTS_DROPPED.with_label_values(&["subscriber"]).inc();
                }
                // Receiver is being torn down; its entry goes away on unsubscribe.
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }
}

/// A registered observer: its handle plus its private event queue.
///
/// Dropping the subscription unregisters it.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<LogEvent>,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LogEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

/// Counters describing what the hub did with published events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HubStats {
    pub subscribers: usize,
    pub delivered: u64,
    pub dropped_for_subscribers: u64,
}

/// The fan-out hub itself.
#[derive(Debug)]
pub struct LogHub {
    sink: LogSink,
    intake: Mutex<Option<mpsc::Receiver<LogEvent>>>,
    registry: Arc<SubscriberRegistry>,
    subscriber_capacity: usize,
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new(DEFAULT_INTAKE_CAPACITY, DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl LogHub {
    pub fn new(intake_capacity: usize, subscriber_capacity: usize) -> Self {
        let (sink, rx) = LogSink::channel(intake_capacity);
        Self {
            sink,
            intake: Mutex::new(Some(rx)),
            registry: Arc::new(SubscriberRegistry::default()),
            subscriber_capacity,
        }
    }

    /// A producer handle for components that log through the hub.
    pub fn sink(&self) -> LogSink {
        self.sink.clone()
    }

    /// Non-blocking publish; returns `false` if the intake was full.
    pub fn publish(&self, event: LogEvent) -> bool {
        self.sink.publish(event)
    }

    pub fn subscribe(&self) -> Subscription {
        let (id, rx) = self.registry.register(self.subscriber_capacity);
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Removes a subscriber. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.registry.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            subscribers: self.registry.len(),
            delivered: self.registry.delivered.load(Ordering::Relaxed),
            dropped_for_subscribers: self.registry.dropped.load(Ordering::Relaxed),
        }
    }

    /// Spawns the distribution task. Only the first call starts one;
    /// later calls return `None`.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let mut rx = self
            .intake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let registry = self.registry.clone();
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                registry.fan_out(&event);
            }
            debug!("log hub intake closed, distribution task exiting");
        }))
    }
}
