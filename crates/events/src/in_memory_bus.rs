//! In-memory event bus.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use tracing::{debug, error};

use crate::bus::{EventBus, Subscription};
use crate::{Event, EventHandler};

type HandlerEntry<M> = (u64, Arc<dyn EventHandler<M>>);

struct Registry<M: Event> {
    next_id: u64,
    by_kind: HashMap<M::Kind, Vec<HandlerEntry<M>>>,
    catch_all: Vec<HandlerEntry<M>>,
}

impl<M: Event> Registry<M> {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove(&mut self, id: u64) {
        for handlers in self.by_kind.values_mut() {
            handlers.retain(|(hid, _)| *hid != id);
        }
        self.by_kind.retain(|_, handlers| !handlers.is_empty());
        self.catch_all.retain(|(hid, _)| *hid != id);
    }

    fn snapshot(&self, kind: &M::Kind) -> Vec<Arc<dyn EventHandler<M>>> {
        self.by_kind
            .get(kind)
            .into_iter()
            .flatten()
            .chain(self.catch_all.iter())
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }
}

/// In-process pub/sub bus.
///
/// - No IO, no background tasks: handlers run inside `publish`
/// - Registry lock is released before any handler runs (nested publish is fine)
/// - Handler failures are isolated and logged
pub struct InMemoryEventBus<M: Event> {
    registry: Arc<RwLock<Registry<M>>>,
}

impl<M: Event> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of handlers that would receive an event of `kind`.
    pub fn handler_count(&self, kind: M::Kind) -> usize {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.snapshot(&kind).len()
    }

    fn register(&self, kind: Option<M::Kind>, handler: Arc<dyn EventHandler<M>>) -> Subscription {
        let id = {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            let id = registry.allocate_id();
            match kind {
                Some(kind) => registry.by_kind.entry(kind).or_default().push((id, handler)),
                None => registry.catch_all.push((id, handler)),
            }
            id
        };

        let registry: Weak<RwLock<Registry<M>>> = Arc::downgrade(&self.registry);
        Subscription::new(id, move || {
            if let Some(registry) = registry.upgrade() {
                registry
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(id);
            }
        })
    }
}

impl<M: Event> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry {
                next_id: 0,
                by_kind: HashMap::new(),
                catch_all: Vec::new(),
            })),
        }
    }
}

impl<M: Event> core::fmt::Debug for InMemoryEventBus<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryEventBus").finish_non_exhaustive()
    }
}

#[async_trait]
impl<M: Event> EventBus<M> for InMemoryEventBus<M> {
    async fn publish(&self, event: M) {
        let handlers = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            registry.snapshot(&event.kind())
        };

        if handlers.is_empty() {
            debug!(event_type = event.event_type(), "event published with no subscribers");
            return;
        }

        for handler in handlers {
            if let Err(err) = handler.handle(&event).await {
                error!(
                    event_type = event.event_type(),
                    handler = handler.name(),
                    error = %format!("{err:#}"),
                    "event handler failed"
                );
            }
        }
    }

    fn subscribe(&self, kind: M::Kind, handler: Arc<dyn EventHandler<M>>) -> Subscription {
        self.register(Some(kind), handler)
    }

    fn subscribe_all(&self, handler: Arc<dyn EventHandler<M>>) -> Subscription {
        self.register(None, handler)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use narrator_core::{ItemId, JobId};

    use super::*;
    use crate::{EventKind, PipelineEvent, handler_fn};

    fn recorder(
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn EventHandler<PipelineEvent>> {
        Arc::new(handler_fn(label, move |event: PipelineEvent| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{label}:{}", event.event_type()));
                Ok(())
            }
        }))
    }

    #[tokio::test]
    async fn delivers_in_subscription_order_then_catch_all() {
        let bus = InMemoryEventBus::<PipelineEvent>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe_all(recorder("all", log.clone()));
        bus.subscribe(EventKind::JobStarted, recorder("first", log.clone()));
        bus.subscribe(EventKind::JobStarted, recorder("second", log.clone()));
        bus.subscribe(EventKind::JobFailed, recorder("other", log.clone()));

        bus.publish(PipelineEvent::job_started(JobId::from("j"))).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:job.started", "second:job.started", "all:job.started"]
        );
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let bus = InMemoryEventBus::<PipelineEvent>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(
            EventKind::ItemCompleted,
            Arc::new(handler_fn("boom", |_event: PipelineEvent| async {
                Err::<(), _>(anyhow::anyhow!("handler exploded"))
            })),
        );
        bus.subscribe(EventKind::ItemCompleted, recorder("after", log.clone()));

        bus.publish(PipelineEvent::item_completed(JobId::from("j"), ItemId::from("i")))
            .await;

        assert_eq!(*log.lock().unwrap(), vec!["after:item.completed"]);
    }

    #[tokio::test]
    async fn unsubscribe_removes_handler_once() {
        let bus = InMemoryEventBus::<PipelineEvent>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut sub = bus.subscribe(EventKind::JobStarted, recorder("h", log.clone()));
        assert_eq!(bus.handler_count(EventKind::JobStarted), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(bus.handler_count(EventKind::JobStarted), 0);

        bus.publish(PipelineEvent::job_started(JobId::from("j"))).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_many_preserves_order() {
        let bus = InMemoryEventBus::<PipelineEvent>::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe_all(recorder("all", log.clone()));

        bus.publish_many(vec![
            PipelineEvent::job_started(JobId::from("j")),
            PipelineEvent::item_completed(JobId::from("j"), ItemId::from("a")),
            PipelineEvent::job_failed(JobId::from("j"), "nope"),
        ])
        .await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["all:job.started", "all:item.completed", "all:job.failed"]
        );
    }

    #[tokio::test]
    async fn handlers_may_publish_nested_events() {
        let bus = Arc::new(InMemoryEventBus::<PipelineEvent>::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner_bus = Arc::downgrade(&bus);
        bus.subscribe(
            EventKind::JobStarted,
            Arc::new(handler_fn("relay", move |event: PipelineEvent| {
                let inner_bus = inner_bus.clone();
                async move {
                    if let (Some(bus), Some(job_id)) = (inner_bus.upgrade(), event.job_id()) {
                        bus.publish(PipelineEvent::job_paused(job_id.clone())).await;
                    }
                    Ok(())
                }
            })),
        );
        bus.subscribe(EventKind::JobPaused, recorder("paused", log.clone()));

        bus.publish(PipelineEvent::job_started(JobId::from("j"))).await;

        assert_eq!(*log.lock().unwrap(), vec!["paused:job.paused"]);
    }
}
