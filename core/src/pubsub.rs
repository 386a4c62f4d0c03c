//! Topic-typed publish/subscribe broker.
//!
//! One broker per topic. Subscribers attach dynamically and are removed
//! automatically when their cancellation token fires. Publishing fans out to
//! every live subscriber with a bounded per-subscriber wait: a subscriber
//! that cannot receive within the bound loses that event (with a warning
//! naming the topic) while the others are unaffected. The UI is the critical
//! consumer; unbounded buffering or synchronous sends would let a slow UI
//! stall fast producers such as an LSP diagnostics storm.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Maximum time `publish` waits on any single subscriber.
pub const SUBSCRIBER_SEND_TIMEOUT: Duration = Duration::from_secs(2);

const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event<T> {
    pub kind: EventKind,
    pub payload: T,
}

type Subscribers<T> = Arc<std::sync::Mutex<HashMap<u64, mpsc::Sender<Event<T>>>>>;

pub struct Broker<T> {
    topic: &'static str,
    subscribers: Subscribers<T>,
    next_id: AtomicU64,
    /// Fired once on shutdown; also releases the per-subscriber watchers.
    shutdown_token: CancellationToken,
}

impl<T: Clone + Send + 'static> Broker<T> {
    pub fn new(topic: &'static str) -> Self {
        Self {
            topic,
            subscribers: Arc::new(std::sync::Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Register a new subscriber. The subscriber is removed and its channel
    /// closed when `cancel` fires (or when the receiver is dropped).
    pub fn subscribe(&self, cancel: &CancellationToken) -> mpsc::Receiver<Event<T>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx.clone());

        let subscribers = self.subscribers.clone();
        let cancel = cancel.clone();
        let shutdown = self.shutdown_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = shutdown.cancelled() => {}
                _ = tx.closed() => {}
            }
            subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        });

        rx
    }

    /// Fan out to every live subscriber, waiting at most
    /// [`SUBSCRIBER_SEND_TIMEOUT`] per subscriber.
    pub async fn publish(&self, kind: EventKind, payload: T) {
        if self.shutdown_token.is_cancelled() {
            return;
        }

        let targets: Vec<(u64, mpsc::Sender<Event<T>>)> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        for (id, tx) in targets {
            let event = Event {
                kind,
                payload: payload.clone(),
            };
            match tx.send_timeout(event, SUBSCRIBER_SEND_TIMEOUT).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(topic = self.topic, "event dropped due to slow subscriber");
                }
                Err(SendTimeoutError::Closed(_)) => {
                    self.subscribers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&id);
                }
            }
        }
    }

    /// Close every subscriber channel and reject subsequent publishes.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn topic(&self) -> &'static str {
        self.topic
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
