//! # pilot-session
//!
//! Session layer for Pilot:
//! - `SessionController`: session modes, emergency stop, control operations
//! - `Registry`: process-scoped wiring of store, bus, gate, engine and controller

pub mod controller;
pub mod registry;

pub use controller::{SessionController, StopSummary};
pub use registry::Registry;
