//! Store layer
//!
//! Data access for job records. The store is the only shared mutable state
//! in the system; all writes go through the dispatch loop.
//!
//! The store is trait-based to enable testing and mocking.

mod jobs;

// Re-export trait
pub use jobs::JobStore;

// Re-export implementation
pub use jobs::SqliteJobStore;
