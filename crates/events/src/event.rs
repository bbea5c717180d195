use chrono::{DateTime, Utc};

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - **classified** by a closed `Kind` so buses can route them through a
///   dispatch table instead of inspecting type names at runtime
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Routing key for subscriptions (a fieldless enum in practice).
    type Kind: Copy + Eq + core::hash::Hash + core::fmt::Debug + Send + Sync + 'static;

    /// Routing key of this event.
    fn kind(&self) -> Self::Kind;

    /// Stable event name/type identifier (e.g. "job.started").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
