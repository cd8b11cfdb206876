//! Priority dispatch loop -- picks the next task and drives the executor.
//!
//! Split into focused submodules:
//! - `core`: Dispatcher struct, settings, constructor and accessors
//! - `scheduling`: priority draining and round-robin over normal topics
//! - `execution`: per-delivery handling, commits and the main loop

mod core;
mod execution;
mod scheduling;

pub use self::core::{Dispatcher, DispatcherSettings};
