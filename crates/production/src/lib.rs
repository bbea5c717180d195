//! Content production domain module.
//!
//! This crate contains the business rules for production jobs and their
//! content items, implemented purely as deterministic domain logic (no IO, no
//! async, no storage).

pub mod content_item;
pub mod job;
pub mod stage;

pub use content_item::{ContentItem, ItemStatus};
pub use job::{Job, JobStatus};
pub use stage::Stage;
