// Copyright 2025 Cowboy AI, LLC.

//! In-process typed publish/subscribe
//!
//! Handlers subscribe per [`EventType`] with a priority. For one event,
//! handlers run one after another in descending priority; equal priorities
//! run in subscription order.
//!
//! `publish(.., wait = true)` dispatches inline and returns once every handler
//! finished. `publish(.., wait = false)` hands the event to a single
//! background dispatcher, so fire-and-forget events are delivered in FIFO
//! order across the whole bus. Handler errors and panics are logged and never
//! reach the publisher.

use crate::errors::{LifecycleError, LifecycleResult};
use crate::events::{EventEnvelope, EventType, LifecycleEvent};
use crate::tasks::{TaskRegistry, DEFAULT_GRACE};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, error, trace, warn};

const DISPATCHER_TASK: &str = "event-bus-dispatcher";

/// Something that reacts to published events
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Handle one event
    async fn handle(&self, envelope: &EventEnvelope) -> LifecycleResult<()>;
}

struct Subscription {
    handler: Arc<dyn EventHandler>,
    priority: i32,
}

#[derive(Default)]
struct Dispatcher {
    subscribers: RwLock<HashMap<EventType, Vec<Subscription>>>,
    pending: AtomicUsize,
    idle: Notify,
}

impl Dispatcher {
    async fn dispatch(&self, envelope: &EventEnvelope) {
        let event_type = envelope.event_type();
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .get(&event_type)
                .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
                .unwrap_or_default()
        };

        trace!(%event_type, event_id = %envelope.event_id, handlers = handlers.len(), "Dispatching event");

        for handler in handlers {
            match AssertUnwindSafe(handler.handle(envelope)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    handler = handler.name(),
                    %event_type,
                    identity = %envelope.event.identity(),
                    error = %e,
                    "Event handler failed"
                ),
                Err(panic) => error!(
                    handler = handler.name(),
                    %event_type,
                    identity = %envelope.event.identity(),
                    panic = panic_message(panic.as_ref()),
                    "Event handler panicked"
                ),
            }
        }
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Typed in-process event bus
pub struct EventBus {
    inner: Arc<Dispatcher>,
    sender: mpsc::UnboundedSender<EventEnvelope>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<EventEnvelope>>>,
    tasks: TaskRegistry,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("pending", &self.inner.pending.load(Ordering::Acquire))
            .field("running", &self.is_running())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus; fire-and-forget events queue until [`EventBus::start`]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Dispatcher::default()),
            sender,
            receiver: Mutex::new(Some(receiver)),
            tasks: TaskRegistry::new(),
        }
    }

    /// Register `handler` for `event_type`
    pub async fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>, priority: i32) {
        debug!(%event_type, handler = handler.name(), priority, "Subscribing handler");
        let mut subscribers = self.inner.subscribers.write().await;
        let subs = subscribers.entry(event_type).or_default();
        subs.push(Subscription { handler, priority });
        // Stable sort keeps subscription order among equal priorities.
        subs.sort_by_key(|s| std::cmp::Reverse(s.priority));
    }

    /// Register `handler` for several event types at one priority
    pub async fn subscribe_all(
        &self,
        event_types: &[EventType],
        handler: Arc<dyn EventHandler>,
        priority: i32,
    ) {
        for event_type in event_types {
            self.subscribe(*event_type, handler.clone(), priority).await;
        }
    }

    /// Number of handlers registered for `event_type`
    pub async fn subscriber_count(&self, event_type: EventType) -> usize {
        let subscribers = self.inner.subscribers.read().await;
        subscribers.get(&event_type).map_or(0, Vec::len)
    }

    /// Publish an envelope
    pub async fn publish(&self, envelope: EventEnvelope, wait: bool) -> LifecycleResult<()> {
        if wait {
            self.inner.dispatch(&envelope).await;
            return Ok(());
        }

        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(rejected) = self.sender.send(envelope) {
            self.inner.finish_one();
            debug!(event_type = %rejected.0.event_type(), "Dropping event published after shutdown");
            return Err(LifecycleError::Shutdown);
        }
        Ok(())
    }

    /// Wrap `event` in a fresh envelope and publish it
    pub async fn emit(
        &self,
        event: LifecycleEvent,
        source: &str,
        wait: bool,
    ) -> LifecycleResult<()> {
        self.publish(EventEnvelope::new(event, source), wait).await
    }

    /// Start the background dispatcher; repeated calls are no-ops
    pub fn start(&self) {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut rx) = receiver else {
            return;
        };

        let inner = self.inner.clone();
        self.tasks.spawn_cancellable(DISPATCHER_TASK, move |mut signal| async move {
            loop {
                tokio::select! {
                    biased;
                    next = rx.recv() => match next {
                        Some(envelope) => {
                            inner.dispatch(&envelope).await;
                            inner.finish_one();
                        }
                        None => break,
                    },
                    _ = signal.cancelled() => {
                        while let Ok(envelope) = rx.try_recv() {
                            inner.dispatch(&envelope).await;
                            inner.finish_one();
                        }
                        break;
                    }
                }
            }
            debug!("Event bus dispatcher stopped");
        });
    }

    /// Whether the background dispatcher is running
    pub fn is_running(&self) -> bool {
        self.tasks.is_running(DISPATCHER_TASK)
    }

    /// Number of queued or in-flight fire-and-forget events
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Resolve once every queued event has been dispatched
    ///
    /// Never resolves while events are queued and the dispatcher is not
    /// started.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Drain the queue and stop the dispatcher
    pub async fn shutdown(&self) {
        self.tasks.shutdown(DEFAULT_GRACE).await;
    }
}
