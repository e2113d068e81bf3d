//! Wakegate - A reverse proxy that wakes its backend on demand
//!
//! This library provides a single-backend HTTP reverse proxy that:
//! - Resolves the backend's wake hostname on every request
//! - Sends a wake-on-LAN magic packet to the backend's network interface
//! - Forwards the request to the backend whether or not the wake succeeded
//! - Answers a liveness probe on `/health` without touching the backend

pub mod config;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod resolver;
pub mod wol;

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
