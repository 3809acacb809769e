//! Client presence tracking.
//!
//! This module holds the presence machinery:
//! - `keys` - store key and channel naming shared by the whole fleet
//! - `listener` - displacement callbacks handed in by connection handlers
//! - `registry` - local map of presence key to listener
//! - `manager` - the per-process presence manager

pub mod keys;
pub mod listener;
pub mod manager;
pub mod registry;

pub use keys::*;
pub use listener::*;
pub use manager::*;
pub use registry::*;
