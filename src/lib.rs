//! AIR: an in-process telemetry engine.
//!
//! Application threads record samples into per-thread, per-node slots
//! without locks. A scheduler thread periodically opens latency windows,
//! correlates latency events, applies control commands and aggregates each
//! closed period into a JSON [`Snapshot`](process::snapshot::Snapshot).

pub mod chain;
pub mod collection;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod export;
pub mod meta;
pub mod metric;
pub mod node;
pub mod process;

pub use engine::{Air, ThreadLogger};
