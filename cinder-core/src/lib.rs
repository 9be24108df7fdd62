//! Cinder Core
//!
//! Core types for the Cinder job dispatcher.
//!
//! This crate contains the domain types shared between the dispatcher
//! (which mutates job records) and external submitters (which create them).

pub mod domain;
