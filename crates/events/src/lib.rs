//! `narrator-events`: pipeline events and the in-process event bus.

pub mod bus;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod pipeline;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use handler::{EventHandler, FnHandler, handler_fn};
pub use in_memory_bus::InMemoryEventBus;
pub use pipeline::{
    ErrorContext, ErrorFailed, ErrorOccurred, ErrorRecovered, EventKind, ItemSignal,
    JobCompleted, JobFailed, JobSignal, PipelineEvent, RetryScheduled,
};
