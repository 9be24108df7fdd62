//! Core domain types
//!
//! These types represent the fundamental entities of the dispatcher and are
//! shared between the store (for persistence) and the scheduler (for
//! execution).

pub mod job;
