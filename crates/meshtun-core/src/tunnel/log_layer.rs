//! Forwarding of `tracing` events to tunnel managers.
//!
//! [`TunnelLogLayer`] is installed in the process subscriber. It renders each
//! event into a [`LogRecord`] and pushes it onto the queue of every live
//! session registered with its [`LogHub`]. Sessions drain their queue into
//! `Log` messages.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::Notify;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use super::message::{LogField, LogRecord};

/// Events from these targets are never forwarded; they describe the
/// forwarding path itself.
const SELF_TARGET: &str = "meshtun_core::tunnel";

/// Bounded per-session queue of forwarded records
pub struct LogQueue {
    records: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl LogQueue {
    /// Queue holding at most `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Append a record, evicting the oldest when full
    pub fn push(&self, record: LogRecord) {
        {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            if records.len() >= self.capacity {
                records.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            records.push_back(record);
        }
        self.notify.notify_one();
    }

    /// Take everything queued
    pub fn drain(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    /// Records evicted because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queued record count
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until a record has been pushed since the last wakeup
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

impl fmt::Debug for LogQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Registry of session log queues shared with [`TunnelLogLayer`]
#[derive(Clone, Default)]
pub struct LogHub {
    queues: Arc<Mutex<Vec<Weak<LogQueue>>>>,
}

impl LogHub {
    /// Empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new queue; it stops receiving records once dropped
    pub fn register(&self, capacity: usize) -> Arc<LogQueue> {
        let queue = Arc::new(LogQueue::new(capacity));
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&queue));
        queue
    }

    /// Number of live queues
    pub fn listeners(&self) -> usize {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.retain(|q| q.strong_count() > 0);
        queues.len()
    }

    fn publish(&self, record: LogRecord) {
        let live: Vec<Arc<LogQueue>> = {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            queues.retain(|q| q.strong_count() > 0);
            queues.iter().filter_map(Weak::upgrade).collect()
        };

        if let Some((last, rest)) = live.split_last() {
            for queue in rest {
                queue.push(record.clone());
            }
            last.push(record);
        }
    }

    fn has_listeners(&self) -> bool {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|q| q.strong_count() > 0)
    }
}

impl fmt::Debug for LogHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHub")
            .field("listeners", &self.listeners())
            .finish()
    }
}

/// `tracing` layer feeding a [`LogHub`]
#[derive(Debug, Clone)]
pub struct TunnelLogLayer {
    hub: LogHub,
}

impl TunnelLogLayer {
    /// Layer publishing into `hub`
    pub fn new(hub: LogHub) -> Self {
        Self { hub }
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: Option<String>,
    fields: Vec<LogField>,
}

impl RecordVisitor {
    fn push(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.push(LogField {
                name: field.name().to_string(),
                value,
            });
        }
    }
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.push(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, format!("{value:?}"));
    }
}

impl<S> Layer<S> for TunnelLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with(SELF_TARGET) || !self.hub.has_listeners() {
            return;
        }

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let mut logger_names = vec![metadata.target().to_string()];
        if let Some(scope) = ctx.event_scope(event) {
            logger_names.extend(scope.from_root().map(|span| span.name().to_string()));
        }

        self.hub.publish(LogRecord {
            level: (*metadata.level()).into(),
            message: visitor.message.unwrap_or_default(),
            logger_names,
            fields: visitor.fields,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::message::LogLevel;
    use tracing_subscriber::layer::SubscriberExt;

    fn record(message: &str) -> LogRecord {
        LogRecord {
            level: LogLevel::Info,
            message: message.into(),
            logger_names: vec![],
            fields: vec![],
        }
    }

    #[test]
    fn test_queue_drops_oldest() {
        let queue = LogQueue::new(2);
        queue.push(record("a"));
        queue.push(record("b"));
        queue.push(record("c"));

        assert_eq!(queue.dropped(), 1);
        let messages: Vec<String> = queue.drain().into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_hub_forgets_dropped_queues() {
        let hub = LogHub::new();
        let first = hub.register(8);
        let second = hub.register(8);
        assert_eq!(hub.listeners(), 2);

        drop(first);
        assert_eq!(hub.listeners(), 1);

        hub.publish(record("x"));
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_layer_renders_events() {
        let hub = LogHub::new();
        let queue = hub.register(16);
        let subscriber = tracing_subscriber::registry().with(TunnelLogLayer::new(hub));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("relay_link");
            let _guard = span.enter();
            tracing::warn!(target: "meshtun_relay::link", address = "a.example:443", attempt = 3, "connect failed");
        });

        let records = queue.drain();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.level, LogLevel::Warn);
        assert_eq!(rec.message, "connect failed");
        assert_eq!(rec.logger_names, vec!["meshtun_relay::link", "relay_link"]);
        assert_eq!(
            rec.fields,
            vec![
                LogField {
                    name: "address".into(),
                    value: "a.example:443".into()
                },
                LogField {
                    name: "attempt".into(),
                    value: "3".into()
                },
            ]
        );
    }

    #[test]
    fn test_layer_skips_own_events() {
        let hub = LogHub::new();
        let queue = hub.register(16);
        let subscriber = tracing_subscriber::registry().with(TunnelLogLayer::new(hub));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "meshtun_core::tunnel::speaker", "sent message");
            tracing::info!(target: "meshtun_relay::mesh", "links updated");
        });

        let records = queue.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "links updated");
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let queue = Arc::new(LogQueue::new(4));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.notified().await;
                queue.drain()
            })
        };
        queue.push(record("wake"));
        let drained = waiter.await.unwrap();
        assert_eq!(drained.len(), 1);
    }
}
