//! Scheduler layer
//!
//! This layer drives every in-flight job. It polls the store for submitted
//! work, launches workers, and records terminal state when they exit.

pub mod dispatch;

pub use dispatch::Dispatcher;
