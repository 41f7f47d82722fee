//! dacgate Client Library
//!
//! Connects to a dacgate gateway, authenticates with the session handshake
//! and exchanges JSON commands over the encrypted channel.

pub mod cli;
pub mod client;

pub use cli::run_cli;
pub use client::{ClientConfig, GatewayClient};
