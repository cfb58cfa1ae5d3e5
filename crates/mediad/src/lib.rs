//! mediad Daemon - Removable media tracking and mount server
//!
//! This crate provides the core infrastructure for the mediad daemon:
//! - `config` - Daemon configuration and the filesystem option table
//! - `monitor` - Device monitor worker thread, platform backends and queues
//! - `tree` - The live device tree
//! - `mounts` - Mount service, mount orchestrators and the mount table watcher
//! - `server` - Client registry, protocol dispatcher and the event loop
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      mediad daemon                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │ PlatformBackend │────▶│  DeviceMonitor (thread)     │    │
//! │  │ (udev netlink)  │     │  dedup + fan-out            │    │
//! │  └─────────────────┘     └──────────────┬──────────────┘    │
//! │                                         │ MonitorQueue      │
//! │                                         ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │ ClientRegistry  │◀───▶│  DaemonServer (event loop)  │    │
//! │  │ (Unix socket)   │     │  DeviceTree + dispatcher    │    │
//! │  └─────────────────┘     └──────────────┬──────────────┘    │
//! │                                         │                   │
//! │                                         ▼                   │
//! │                          ┌─────────────────────────────┐    │
//! │                          │  MountService/Orchestrator  │    │
//! │                          └─────────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod monitor;
pub mod mounts;
pub mod server;
pub mod tree;

pub use config::DaemonConfig;
pub use server::{DaemonServer, ServerError};
