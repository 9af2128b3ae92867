use std::error::Error;
use std::fmt;

use crate::core::message::ValidationError;

#[derive(Debug)]
pub enum RustyChatError {
    // Protocol errors
    MessageParseError(String),
    MessageTooLarge(usize),
    ValidationError(ValidationError),
    UnsupportedMessageType(String),
    BinaryFrame,

    // Policy errors
    InvalidDisplayName(ValidationError),
    NameTaken(String),
    NotJoined,
    RateLimited,
    SelfMessage,
    RecipientNotFound(String),
    RecipientUnreachable(String),
    AtCapacity,

    // Connection errors
    ConnectionError(String),
    ConnectionClosed,

    // Hub errors
    HubUnavailable,
    HubInconsistent(String),

    // Serialization errors
    SerializationError(String),

    // Configuration errors
    ConfigError(String),
}

impl RustyChatError {
    /// Errors that are reported back to the originating session as an error frame
    /// instead of being treated as a server-side failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::MessageParseError(_)
                | Self::ValidationError(_)
                | Self::UnsupportedMessageType(_)
                | Self::BinaryFrame
                | Self::InvalidDisplayName(_)
                | Self::NameTaken(_)
                | Self::NotJoined
                | Self::RateLimited
                | Self::SelfMessage
                | Self::RecipientNotFound(_)
                | Self::RecipientUnreachable(_)
                | Self::AtCapacity
        )
    }
}

impl fmt::Display for RustyChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageParseError(msg) => write!(f, "Invalid message format: {}", msg),
            Self::MessageTooLarge(size) => write!(f, "Message too large: {} bytes", size),
            Self::ValidationError(err) => write!(f, "Message validation failed: {}", err),
            Self::UnsupportedMessageType(kind) => write!(f, "Unknown message type: {}", kind),
            Self::BinaryFrame => write!(f, "Binary frames are not supported"),
            Self::InvalidDisplayName(err) => write!(f, "Display name error: {}", err),
            Self::NameTaken(name) => write!(f, "Display name error: '{}' is already taken", name),
            Self::NotJoined => write!(f, "Must join chat before sending messages"),
            Self::RateLimited => write!(f, "Rate limit exceeded. Please slow down your messages."),
            Self::SelfMessage => write!(f, "Cannot send private message to yourself"),
            Self::RecipientNotFound(_) => {
                write!(f, "Failed to send private message: recipient not found or offline")
            }
            Self::RecipientUnreachable(_) => write!(
                f,
                "Failed to send private message: failed to deliver message to recipient"
            ),
            Self::AtCapacity => write!(f, "Server at capacity"),
            Self::ConnectionError(msg) => write!(f, "Connection error: {}", msg),
            Self::ConnectionClosed => write!(f, "Connection closed unexpectedly"),
            Self::HubUnavailable => write!(f, "Hub is not running"),
            Self::HubInconsistent(msg) => write!(f, "Hub routing state inconsistent: {}", msg),
            Self::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for RustyChatError {}

impl From<serde_json::Error> for RustyChatError {
    fn from(err: serde_json::Error) -> Self {
        RustyChatError::SerializationError(err.to_string())
    }
}

impl From<ValidationError> for RustyChatError {
    fn from(err: ValidationError) -> Self {
        RustyChatError::ValidationError(err)
    }
}

// Generic result type for RustyChat
pub type Result<T> = std::result::Result<T, RustyChatError>;
