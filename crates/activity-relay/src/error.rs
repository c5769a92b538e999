//! Error types for the activity relay

use thiserror::Error;

use crate::identity::Role;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Token problems detected at the connection boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authentication token required")]
    MissingToken,

    #[error("Invalid authorization scheme (expected Bearer)")]
    InvalidScheme,

    #[error("Token expired")]
    Expired,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Invalid token claims: {0}")]
    InvalidClaims(String),

    #[error("Invalid authentication token: {0}")]
    Invalid(String),
}

/// Errors that can occur in the relay
#[derive(Error, Debug)]
pub enum Error {
    /// Missing, malformed or expired token
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthError),

    /// Role not permitted for the requested action
    #[error("Insufficient permissions: {role} may not {action}")]
    Authorization { role: Role, action: String },

    /// Too many requests inside the current window
    #[error("Rate limit exceeded, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Durable store read/write failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Presence store failure
    #[error("Presence store error: {0}")]
    Presence(String),

    /// Ingestion buffer is at capacity
    #[error("Event queue is full ({0} events)")]
    QueueFull(usize),

    /// Client sent something we cannot interpret
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Cross-instance relay failure
    #[error("Relay error: {0}")]
    Relay(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server errors
    #[error("Server error: {0}")]
    Server(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else raised inside a handler
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Stable code sent to clients in `event-error`
    pub fn code(&self) -> &'static str {
        match self {
            Error::Authentication(_) => "AUTHENTICATION_ERROR",
            Error::Authorization { .. } => "AUTHORIZATION_ERROR",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::Persistence(_) => "PERSISTENCE_ERROR",
            Error::Presence(_) => "PRESENCE_ERROR",
            Error::QueueFull(_) => "QUEUE_FULL",
            Error::InvalidMessage(_) => "INVALID_MESSAGE",
            Error::Relay(_) => "RELAY_ERROR",
            Error::Config(_) | Error::Server(_) | Error::Io(_) | Error::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// Whether the connection may stay open after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Authentication(_))
    }

    pub(crate) fn forbidden(role: Role, action: impl Into<String>) -> Self {
        Error::Authorization {
            role,
            action: action.into(),
        }
    }
}
