//! Core infrastructure.
//!
//! This module contains the pieces everything else builds on:
//! - `config` - Configuration parsing and validation
//! - `time` - Deterministic time utilities

pub mod config;
pub mod time;

pub use config::*;
pub use time::*;
