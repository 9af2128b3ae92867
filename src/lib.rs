//! Rusty Chat - A broadcast and direct-message chat relay over WebSockets
//!
//! This library provides the routing hub, per-connection sessions and the
//! warp routes needed to run the relay.

pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod handlers;
pub mod security;

// Re-export main components
pub use config::ServerConfig;
pub use error::{Result, RustyChatError};
