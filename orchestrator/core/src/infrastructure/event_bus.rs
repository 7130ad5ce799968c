// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Domain Events
//
// Every subscription owns an unbounded queue drained by its own worker task,
// so `publish` never waits on a handler and each handler sees events in
// publish order. A panicking handler is logged and counted; its worker keeps
// draining. Passive observers (CLI tails, tests) use `watch()`, a broadcast
// channel that drops the oldest events when an observer falls behind.
//
// Delivery is at-most-once and in-memory only: events still queued when the
// process dies are lost.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::domain::events::{Event, EventFilter};

/// Receives events delivered by the bus.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<Event>);
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, event: Arc<Event>) {
        (self.0)(event).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

struct Subscriber {
    filter: EventFilter,
    queue: mpsc::UnboundedSender<Arc<Event>>,
}

struct Inner {
    // Read-mostly: subscriptions happen at startup, every publish reads.
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    observers: broadcast::Sender<Arc<Event>>,
    next_id: AtomicU64,
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Create a new event bus. `observer_capacity` bounds the broadcast
    /// buffer used by [`EventBus::watch`]; handler queues are unbounded.
    pub fn new(observer_capacity: usize) -> Self {
        let (observers, _) = broadcast::channel(observer_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                observers,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Create event bus with default observer capacity (1024)
    pub fn with_default_capacity() -> Self {
        Self::new(1024)
    }

    /// Registers `handler` for events matching `filter` and starts its
    /// worker on the current Tokio runtime.
    pub fn subscribe(
        &self,
        filter: impl Into<EventFilter>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId, EventBusError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| EventBusError::NoRuntime)?;
        let filter = filter.into();
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (queue, mut rx) = mpsc::unbounded_channel::<Arc<Event>>();

        runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                let event_type = event.event_type;
                let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
                if outcome.is_err() {
                    error!(
                        subscription = id.0,
                        event_type = %event_type,
                        "Event handler panicked; continuing with next event"
                    );
                    metrics::counter!("covenant_event_handler_panics_total").increment(1);
                }
            }
            debug!(subscription = id.0, "Subscription worker stopped");
        });

        self.inner
            .subscribers
            .write()
            .insert(id, Subscriber { filter, queue });
        debug!(subscription = id.0, ?filter, "Handler subscribed");
        Ok(id)
    }

    /// Removes a subscription. Events already queued for it are still
    /// delivered before its worker stops.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.write().remove(&id).is_some()
    }

    /// Publish a domain event to all matching subscribers. Never blocks and
    /// never fails; handler outcomes are not observed.
    pub fn publish(&self, event: Event) {
        let event = Arc::new(event);
        let event_type = event.event_type;
        debug!(event_type = %event_type, target = ?event.target, "Publishing event");

        let mut delivered = 0usize;
        {
            let subscribers = self.inner.subscribers.read();
            for (id, subscriber) in subscribers.iter() {
                if !subscriber.filter.matches(event_type) {
                    continue;
                }
                if subscriber.queue.send(Arc::clone(&event)).is_err() {
                    warn!(subscription = id.0, "Subscription worker is gone; dropping event");
                } else {
                    delivered += 1;
                }
            }
        }

        // send() only fails when no observer is listening
        let _ = self.inner.observers.send(event);

        metrics::counter!("covenant_events_published_total", "type" => event_type.as_str())
            .increment(1);
        if delivered == 0 {
            debug!(event_type = %event_type, "No handlers subscribed to event");
        }
    }

    /// Passive observer stream of every published event.
    pub fn watch(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.inner.observers.subscribe(),
        }
    }

    /// Get the number of registered handlers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Receiver for all domain events
pub struct EventReceiver {
    receiver: broadcast::Receiver<Arc<Event>>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<Arc<Event>, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<Arc<Event>, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),

    #[error("No Tokio runtime available to run the subscription worker")]
    NoRuntime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::EventType;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn event(event_type: EventType, seq: u64) -> Event {
        Event::new(event_type, "test", Some(format!("t-{seq}")), json!({ "seq": seq }))
    }

    fn forwarding(tx: mpsc::UnboundedSender<Arc<Event>>) -> Arc<dyn EventHandler> {
        handler_fn(move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
            }
        })
    }

    #[tokio::test]
    async fn test_handler_receives_events_in_publish_order() {
        let bus = EventBus::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(EventType::MemoryInserted, forwarding(tx)).unwrap();

        for seq in 0..20 {
            bus.publish(event(EventType::MemoryInserted, seq));
        }
        for seq in 0..20 {
            let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            assert_eq!(got.payload["seq"], json!(seq));
        }
    }

    #[tokio::test]
    async fn test_filter_excludes_other_types() {
        let bus = EventBus::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(EventType::AgentSpawned, forwarding(tx)).unwrap();

        bus.publish(event(EventType::AgentExecuted, 1));
        bus.publish(event(EventType::AgentSpawned, 2));

        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.event_type, EventType::AgentSpawned);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_the_bus() {
        let bus = EventBus::new(16);
        let panicker = handler_fn(|event: Arc<Event>| async move {
            if event.payload["seq"] == json!(0) {
                panic!("handler failure");
            }
        });
        bus.subscribe(EventFilter::All, panicker).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(EventFilter::All, forwarding(tx.clone())).unwrap();

        bus.publish(event(EventType::ConsensusVoted, 0));
        bus.publish(event(EventType::ConsensusVoted, 1));

        for seq in 0..2 {
            let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            assert_eq!(got.payload["seq"], json!(seq));
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = bus.subscribe(EventFilter::All, forwarding(tx)).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.publish(event(EventType::AgentSpawned, 1));
        // Worker exits once its queue sender is dropped
        assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_observes_published_events() {
        let bus = EventBus::new(4);
        let mut observer = bus.watch();
        bus.publish(event(EventType::AgentTerminated, 7));
        let got = observer.recv().await.unwrap();
        assert_eq!(got.event_type, EventType::AgentTerminated);
        assert!(matches!(observer.try_recv(), Err(EventBusError::Empty)));
    }

    #[tokio::test]
    async fn test_slow_observer_reports_lag() {
        let bus = EventBus::new(2);
        let mut observer = bus.watch();
        for seq in 0..5 {
            bus.publish(event(EventType::MemoryInserted, seq));
        }
        assert!(matches!(observer.recv().await, Err(EventBusError::Lagged(3))));
    }

    #[test]
    fn test_subscribe_without_runtime_fails() {
        let bus = EventBus::new(4);
        let handler = handler_fn(|_event| async {});
        assert!(matches!(
            bus.subscribe(EventFilter::All, handler),
            Err(EventBusError::NoRuntime)
        ));
    }
}
