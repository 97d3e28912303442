//! Event bus with topic based pub/sub for the hub
//!
//! Topics are `/` separated strings, subscription patterns may use `+` for
//! exactly one level. Two kinds of subscribers exist:
//! - handlers, invoked in publish order on a worker task per subscription,
//!   each invocation isolated so a panic only loses that one message
//! - mailboxes, bounded channels drained by the subscriber itself; a full
//!   mailbox makes `publish` wait for room

mod topic;

use dashmap::DashMap;
use futures::future::BoxFuture;
use hub_core::Event;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

pub use topic::{validate_topic, TopicPattern};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("invalid topic pattern: {0}")]
    InvalidPattern(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("no subscription {id} on {pattern}")]
    NotSubscribed { pattern: String, id: u64 },
}

pub type BusResult<T> = Result<T, BusError>;

/// A unique identifier for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Message handler: receives the concrete topic and the event
pub type Handler = Arc<dyn Fn(String, Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Decides which events enter a mailbox
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Wrap an async closure as a [`Handler`]
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(String, Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |topic, event| Box::pin(f(topic, event)))
}

#[derive(Clone)]
enum Sink {
    Handler(mpsc::UnboundedSender<(String, Event)>),
    Mailbox {
        tx: mpsc::Sender<(String, Event)>,
        filter: Option<EventFilter>,
    },
}

struct Subscription {
    pattern: TopicPattern,
    sink: Sink,
}

/// Receiving side of a bounded subscription
pub struct Mailbox {
    id: SubscriptionId,
    rx: mpsc::Receiver<(String, Event)>,
}

impl Mailbox {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<(String, Event)> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<(String, Event)> {
        self.rx.try_recv().ok()
    }
}

/// The event bus shared by every component
pub struct EventBus {
    subscriptions: DashMap<SubscriptionId, Subscription>,
    /// Last event seen per concrete topic, replayed to persistent subscribers
    retained: DashMap<String, Event>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            retained: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Subscribe a handler to every topic matching `pattern`
    ///
    /// With `persistent` set, the retained last event of each matching topic
    /// is delivered right away. Must be called inside a tokio runtime.
    pub fn subscribe(&self, pattern: &str, handler: Handler, persistent: bool) -> BusResult<SubscriptionId> {
        let pattern = TopicPattern::parse(pattern)?;
        let id = self.next_id();
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Event)>();

        if persistent {
            for entry in self.retained.iter() {
                if pattern.matches(entry.key()) {
                    let _ = tx.send((entry.key().clone(), entry.value().clone()));
                }
            }
        }

        let label = pattern.as_str().to_string();
        tokio::spawn(async move {
            while let Some((topic, event)) = rx.recv().await {
                let kind = event.kind();
                let call = handler(topic.clone(), event);
                if let Err(err) = tokio::spawn(call).await {
                    if err.is_panic() {
                        error!(pattern = %label, topic = %topic, event = kind, "Bus handler panicked");
                    }
                }
            }
            trace!(pattern = %label, "Bus handler worker stopped");
        });

        trace!(pattern = %pattern.as_str(), id = id.0, "Subscribed handler");
        self.subscriptions.insert(
            id,
            Subscription {
                pattern,
                sink: Sink::Handler(tx),
            },
        );
        Ok(id)
    }

    /// Subscribe a bounded mailbox; publishers wait while it is full
    pub fn subscribe_mailbox(
        &self,
        pattern: &str,
        capacity: usize,
        filter: Option<EventFilter>,
    ) -> BusResult<Mailbox> {
        let pattern = TopicPattern::parse(pattern)?;
        let id = self.next_id();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        trace!(pattern = %pattern.as_str(), id = id.0, capacity, "Subscribed mailbox");
        self.subscriptions.insert(
            id,
            Subscription {
                pattern,
                sink: Sink::Mailbox { tx, filter },
            },
        );
        Ok(Mailbox { id, rx })
    }

    /// Drop a subscription created for `pattern`
    pub fn unsubscribe(&self, pattern: &str, id: SubscriptionId) -> BusResult<()> {
        let removed = self
            .subscriptions
            .remove_if(&id, |_, sub| sub.pattern.as_str() == pattern);
        match removed {
            Some(_) => {
                trace!(pattern, id = id.0, "Unsubscribed");
                Ok(())
            }
            None => Err(BusError::NotSubscribed {
                pattern: pattern.to_string(),
                id: id.0,
            }),
        }
    }

    /// Deliver `event` to every subscriber whose pattern matches `topic`
    ///
    /// Handlers are queued without waiting. Mailboxes are awaited, so a full
    /// mailbox holds the publisher until its consumer frees a slot.
    pub async fn publish(&self, topic: impl Into<String>, event: Event) {
        let topic = topic.into();
        if let Err(err) = validate_topic(&topic) {
            warn!(error = %err, event = event.kind(), "Dropping publish");
            return;
        }
        debug!(topic = %topic, event = event.kind(), "Publishing event");

        self.retained.insert(topic.clone(), event.clone());

        let targets: Vec<(SubscriptionId, Sink)> = self
            .subscriptions
            .iter()
            .filter(|sub| sub.pattern.matches(&topic))
            .map(|sub| (*sub.key(), sub.sink.clone()))
            .collect();

        let mut closed = Vec::new();
        for (id, sink) in targets {
            let delivered = match sink {
                Sink::Handler(tx) => tx.send((topic.clone(), event.clone())).is_ok(),
                Sink::Mailbox { tx, filter } => {
                    if filter.as_ref().map_or(true, |f| f(&event)) {
                        tx.send((topic.clone(), event.clone())).await.is_ok()
                    } else {
                        true
                    }
                }
            };
            if !delivered {
                closed.push(id);
            }
        }
        for id in closed {
            trace!(id = id.0, "Removing closed subscription");
            self.subscriptions.remove(&id);
        }
    }

    /// Retained event of a concrete topic
    pub fn last_event(&self, topic: &str) -> Option<Event> {
        self.retained.get(topic).map(|e| e.value().clone())
    }

    /// Number of subscriptions per pattern
    pub fn stats(&self) -> Vec<(String, usize)> {
        let mut counts: std::collections::BTreeMap<String, usize> = Default::default();
        for sub in self.subscriptions.iter() {
            *counts.entry(sub.pattern.as_str().to_string()).or_default() += 1;
        }
        counts.into_iter().collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for EventBus
pub type SharedEventBus = Arc<EventBus>;
