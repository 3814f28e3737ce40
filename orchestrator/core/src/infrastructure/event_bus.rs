// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Container Events
//
// Two delivery paths share one publish call:
// - Listeners registered per event kind run synchronously, in registration
//   order, before publish() returns. A failing or panicking listener is logged
//   and skipped.
// - Watchers get a tokio broadcast receiver for consumption from other tasks.
//
// In-memory only. Nothing is persisted or delivered across processes.

use crate::domain::container::AgentId;
use crate::domain::events::{ContainerEvent, ContainerEventKind};
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

type Handler = Arc<dyn Fn(&ContainerEvent) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Listener {
    id: SubscriptionId,
    /// None = every kind
    kind: Option<ContainerEventKind>,
    handler: Handler,
}

struct Inner {
    listeners: RwLock<Vec<Listener>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<ContainerEvent>,
}

/// Event bus for publishing and subscribing to container events
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Create a new event bus. `capacity` bounds how many events a lagging
    /// watcher may fall behind before old ones are dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                sender,
            }),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Register a synchronous listener for one event kind
    pub fn subscribe<F>(&self, kind: ContainerEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ContainerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Register a synchronous listener for every event kind
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ContainerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    fn register(&self, kind: Option<ContainerEventKind>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push(Listener { id, kind, handler });
        debug!(subscription = id.0, kind = ?kind, "Listener registered");
        id
    }

    /// Remove a listener. Returns false if the id was unknown.
    ///
    /// An emission already in progress still reaches the removed listener.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        before != listeners.len()
    }

    /// Publish an event to all listeners of its kind, then to watchers
    pub fn publish(&self, event: ContainerEvent) {
        let kind = event.kind();
        debug!(kind = %kind, agent_id = %event.agent_id(), "Publishing event");

        // Snapshot under the read lock so listeners may (un)subscribe while
        // being invoked.
        let targets: Vec<(SubscriptionId, Handler)> = self
            .inner
            .listeners
            .read()
            .iter()
            .filter(|l| l.kind.map_or(true, |k| k == kind))
            .map(|l| (l.id, Arc::clone(&l.handler)))
            .collect();

        for (id, handler) in targets {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(subscription = id.0, kind = %kind, "Event listener failed: {:#}", e);
                }
                Err(_) => {
                    error!(subscription = id.0, kind = %kind, "Event listener panicked");
                }
            }
        }

        if self.inner.sender.send(event).is_err() {
            debug!("No watchers listening to event");
        }
    }

    /// Subscribe to the asynchronous stream of all events
    pub fn watch(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.inner.sender.subscribe(),
        }
    }

    /// Asynchronous stream filtered to a single agent
    pub fn watch_agent(&self, agent_id: AgentId) -> AgentEventReceiver {
        AgentEventReceiver {
            receiver: self.inner.sender.subscribe(),
            agent_id,
        }
    }

    /// Number of registered synchronous listeners
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Number of active watchers
    pub fn watcher_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all container events
pub struct EventReceiver {
    receiver: broadcast::Receiver<ContainerEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<ContainerEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<ContainerEvent, EventBusError> {
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

/// Receiver for one agent's events (filtered)
pub struct AgentEventReceiver {
    receiver: broadcast::Receiver<ContainerEvent>,
    agent_id: AgentId,
}

impl AgentEventReceiver {
    /// Receive the next event for the watched agent, skipping others
    pub async fn recv(&mut self) -> Result<ContainerEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.agent_id() == &self.agent_id {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
