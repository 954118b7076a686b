//! Error types for the throttle guard.

use thiserror::Error;

/// Main error type for throttle guard operations.
///
/// Allow/deny outcomes are never errors; these variants cover
/// programming and configuration mistakes only.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// An endpoint class with no registered policy
    #[error("Unknown endpoint class: {0}")]
    UnknownEndpointClass(String),

    /// A fixed-window limiter name with no registered configuration
    #[error("Unknown rate limiter: {0}")]
    UnknownLimiter(String),

    /// A policy that cannot be enforced
    #[error("Invalid policy for '{class}': {reason}")]
    InvalidPolicy { class: String, reason: String },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for throttle guard operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;
