//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is the control plane of the pipeline: the orchestrator, the
//! recovery engine and stage workers never call each other directly, they
//! publish facts and react to the facts they subscribed to.
//!
//! ## Delivery contract
//!
//! - `publish` delivers an event to every handler subscribed to its kind, then
//!   to every catch-all handler, each group in subscription order.
//! - Handlers run one after another inside the `publish` call. Independent
//!   `publish` calls (e.g. from concurrent workers) may interleave.
//! - A failing handler is logged and skipped; it never prevents delivery to the
//!   remaining handlers and never surfaces to the publisher.
//! - `publish_many` is exactly a sequence of `publish` calls.
//!
//! The bus is in-process and keeps no history: an event published with no
//! subscribers is dropped.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{Event, EventHandler};

/// Capability to remove a handler from the bus.
///
/// Dropping the handle keeps the handler registered; call
/// [`Subscription::unsubscribe`] to remove it. Unsubscribing twice is a no-op.
pub struct Subscription {
    id: u64,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(id: u64, cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Bus-local subscription identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// In-process publish/subscribe dispatcher for typed events.
///
/// Components receive the bus by reference (`Arc<dyn EventBus<_>>`) at
/// construction time; there is no process-global instance, so tests build an
/// isolated bus per case.
#[async_trait]
pub trait EventBus<M: Event>: Send + Sync {
    /// Deliver `event` to its kind's handlers and to catch-all handlers.
    async fn publish(&self, event: M);

    /// Publish each event in order, awaiting every delivery before the next.
    async fn publish_many(&self, events: Vec<M>) {
        for event in events {
            self.publish(event).await;
        }
    }

    /// Register `handler` for events of `kind`.
    fn subscribe(&self, kind: M::Kind, handler: Arc<dyn EventHandler<M>>) -> Subscription;

    /// Register `handler` for every event.
    fn subscribe_all(&self, handler: Arc<dyn EventHandler<M>>) -> Subscription;
}

#[async_trait]
impl<M, B> EventBus<M> for Arc<B>
where
    M: Event,
    B: EventBus<M> + ?Sized,
{
    async fn publish(&self, event: M) {
        (**self).publish(event).await
    }

    async fn publish_many(&self, events: Vec<M>) {
        (**self).publish_many(events).await
    }

    fn subscribe(&self, kind: M::Kind, handler: Arc<dyn EventHandler<M>>) -> Subscription {
        (**self).subscribe(kind, handler)
    }

    fn subscribe_all(&self, handler: Arc<dyn EventHandler<M>>) -> Subscription {
        (**self).subscribe_all(handler)
    }
}
