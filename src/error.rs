//! Error types for the message bus.

use std::time::Duration;
use thiserror::Error;

/// Main error type for bus operations.
///
/// Only structural failures surface here. Failures inside a handler are
/// reported through the configured [`ErrorHandler`](crate::ErrorHandler).
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Invalid handler descriptor on {listener}: {reason}")]
    InvalidHandlerDescriptor {
        listener: &'static str,
        reason: String,
    },

    #[error("Invalid type declaration for {ty}: {reason}")]
    InvalidTypeDeclaration { ty: &'static str, reason: String },

    #[error("Async delivery queue is full (capacity {capacity})")]
    DeliveryBackpressure { capacity: usize },

    #[error("Message bus is shut down")]
    ShutDown,

    #[error("Workers did not finish within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
