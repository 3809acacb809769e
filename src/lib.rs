#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
// Variable naming: domain terms often similar
#![allow(clippy::similar_names)]
// Option/Result patterns
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Control flow style
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]

//! Roster - fleet-wide client presence tracking over a shared clustered store.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::time` - Deterministic time utilities
//!
//! ## Store
//! - `store` - Clustered key-value store contract and notification scheme
//! - `store::memory` - In-process store for tests and single-node use
//!
//! ## Presence
//! - `presence::keys` - Key and channel naming shared by the fleet
//! - `presence::listener` - Displacement callbacks
//! - `presence::registry` - Local listener registry
//! - `presence::manager` - The per-process presence manager
//!
//! ## Operations
//! - `ops::observability` - Metrics and snapshots
//! - `ops::telemetry` - Logging setup

// Core infrastructure
pub mod core;

// Store contract and in-memory implementation
pub mod store;

// Presence tracking
pub mod presence;

// Operations
pub mod ops;

// Re-exports for convenience
pub use self::core::{config, time};
pub use ops::{observability, telemetry};
pub use presence::{keys, listener, manager, registry};

// The types nearly every embedder touches
pub use self::core::config::PresenceConfig;
pub use self::core::time::{Clock, SystemClock};
pub use presence::listener::DisplacedPresenceListener;
pub use presence::manager::ClientPresenceManager;
pub use store::{ClusterStore, MemoryClusterStore};
