//! CloudBridge - worker bridge and transfer engine
//!
//! Connects the UI execution context to the key-holding worker over a
//! correlated RPC bridge, and moves encrypted cloud files to and from local
//! storage with bounded concurrency.

pub mod bridge;
pub mod config;
pub mod loopback;
pub mod transfer;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
///
/// Installs an `EnvFilter` (default `info`, overridable via `RUST_LOG`) and a
/// `fmt` layer. Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
