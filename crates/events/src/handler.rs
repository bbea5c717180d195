use std::future::Future;

use async_trait::async_trait;

use crate::Event;

/// Reacts to events delivered by an [`EventBus`](crate::EventBus).
///
/// Handlers are invoked sequentially within one `publish` call. A handler that
/// returns an error is logged by the bus and does not affect the other handlers
/// subscribed to the same event, so implementations should report failures
/// through `Err` rather than panicking.
///
/// Handlers may publish further events or subscribe new handlers; buses must
/// not hold internal locks while a handler runs.
#[async_trait]
pub trait EventHandler<M: Event>: Send + Sync {
    async fn handle(&self, event: &M) -> anyhow::Result<()>;

    /// Name used in logs when this handler fails.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> core::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

/// Build a named handler from a closure taking the event by value.
pub fn handler_fn<M, F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    M: Event,
    F: Fn(M) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<M, F, Fut> EventHandler<M> for FnHandler<F>
where
    M: Event,
    F: Fn(M) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &M) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
