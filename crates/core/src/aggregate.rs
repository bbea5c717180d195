//! Aggregate root and entity traits for state-machine domain models.

/// Aggregate root marker + minimal interface.
///
/// This is intentionally small so pipeline modules can decide how they model
/// state transitions without bringing in any infrastructure concerns.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the aggregate's state.
    ///
    /// Incremented once per accepted mutation. Rejected mutations leave it
    /// untouched, which makes "the aggregate was not modified" observable.
    fn version(&self) -> u64;
}

/// An identified member of an aggregate (e.g. a content item under a job).
///
/// Entities carry identity but never enforce cross-entity invariants; that is
/// the owning aggregate's job.
pub trait Entity {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;
}
