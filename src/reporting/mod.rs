//! Failure and dead-message reporting.
//!
//! A handler that returns an error or panics never aborts the publish it
//! belongs to; the failure is wrapped in a [`PublicationError`] and handed
//! to the configured [`ErrorHandler`]. A message no handler accepted is
//! wrapped in a [`DeadMessage`] and published once more.

mod dead;
mod errors;

pub use dead::DeadMessage;
pub use errors::{ErrorCause, ErrorHandler, LoggingErrorHandler, PublicationError};
