//! Loopback HTTP endpoint for local media components

pub mod server;

pub use server::LoopbackServer;
