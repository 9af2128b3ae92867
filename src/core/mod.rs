//! Core functionality for the chat relay

pub mod hub;
pub mod message;
pub mod rate_limiter;
pub mod session;

// Re-export main components for convenience
pub use hub::{ConnectionStats, Hub, HubHandle};
pub use message::{Message, MessageType, ValidationError};
pub use rate_limiter::MessageRateLimiter;
pub use session::{SendError, Session, SessionId};
