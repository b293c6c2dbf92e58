//! # Fleetsync
//!
//! Synchronization and scheduling core for a fleet of external database
//! instances: a durable job scheduler guarded by a process-wide lock, a
//! background execution bridge, the per-instance collection pipeline, the
//! sync session orchestrator and a generic run tracker.

pub mod adapters;
pub mod audit;
pub mod bridge;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod pagination;
pub mod payload;
pub mod pipeline;
pub mod process_lock;
pub mod repositories;
pub mod runs;
pub mod scheduler;
pub mod sessions;
pub mod tasks;
pub mod telemetry;
pub use migration;
