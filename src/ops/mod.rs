//! Operations and observability.
//!
//! This module provides operational tooling:
//! - `observability` - Presence metrics and snapshots
//! - `telemetry` - Logging setup with reloadable levels

pub mod observability;
pub mod telemetry;

pub use observability::*;
pub use telemetry::*;
