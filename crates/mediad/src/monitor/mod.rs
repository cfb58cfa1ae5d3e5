//! Device monitoring: platform backends, the worker thread and its queues.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  poll(2)   ┌──────────────────────┐
//! │ PlatformBackend  │──────────▶│ worker thread         │
//! │ (netlink / test) │            │ dedup against shadow  │
//! └──────────────────┘            └──────────┬───────────┘
//!                                            │ fan-out (under lock)
//!                        ┌───────────────────┼───────────────────┐
//!                        ▼                   ▼                   ▼
//!                 ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//!                 │MonitorQueue │     │MonitorQueue │ ... │MonitorQueue │
//!                 └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! The worker owns the backend. The shadow knowledge (known paths, their kind
//! and parent) and the set of registered queues live behind one mutex that is
//! only held for single mutations, never across the blocking wait.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in this module tree
//! - Lock poisoning is recovered, never propagated
//! - A failing backend ends the worker with an exit marker, not a panic

mod backend;
#[cfg(target_os = "linux")]
pub mod linux;
mod queue;
pub mod scripted;
mod worker;

pub use backend::{BackendError, BackendEvent, PlatformBackend};
pub use queue::{MonitorQueue, QueueItem};
pub use worker::{DeviceMonitor, MonitorError};
