//! Publication errors and the error sink they are reported to.

use crate::error::BusError;
use crate::hierarchy::view::Payload;
use crate::subscriptions::{HandlerBinding, HandlerError, Invocation};
use crate::types::{Delivery, MessageType, SubscriptionId};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Why a handler did not complete.
#[derive(Debug, Error)]
pub enum ErrorCause {
    #[error("handler returned an error: {0}")]
    Failed(#[source] HandlerError),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("delivery rejected: {0}")]
    Rejected(#[source] BusError),
}

impl ErrorCause {
    /// Turns a `catch_unwind` payload into a cause.
    pub(crate) fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = panic.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        ErrorCause::Panicked(message)
    }
}

/// Details of one failed handler invocation.
///
/// Built at the failure site and handed to the [`ErrorHandler`].
#[derive(Error)]
#[error(
    "{} failed on {} (subscription {}): {}",
    .handler,
    .message_type,
    .subscription,
    .cause
)]
pub struct PublicationError {
    handler: String,
    accepts: MessageType,
    priority: i32,
    invocation: Invocation,
    subscription: SubscriptionId,
    listener: Option<Arc<dyn Any + Send + Sync>>,
    message: Arc<Payload>,
    message_type: MessageType,
    delivery: Delivery,
    cause: ErrorCause,
}

impl PublicationError {
    pub(crate) fn new(
        binding: &HandlerBinding,
        subscription: SubscriptionId,
        listener: Option<Arc<dyn Any + Send + Sync>>,
        message: Arc<Payload>,
        delivery: Delivery,
        cause: ErrorCause,
    ) -> Self {
        Self {
            handler: binding.name().to_string(),
            accepts: binding.accepts(),
            priority: binding.priority(),
            invocation: binding.invocation(),
            subscription,
            listener,
            message,
            message_type: delivery.message_type,
            delivery,
            cause,
        }
    }

    /// Name of the failing handler.
    pub fn handler(&self) -> &str {
        &self.handler
    }

    /// Message type the failing handler was declared for.
    pub fn accepts(&self) -> MessageType {
        self.accepts
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn invocation(&self) -> Invocation {
        self.invocation
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    /// The listener instance, if it was still reachable.
    pub fn listener<L: Any>(&self) -> Option<&L> {
        self.listener.as_deref().and_then(|l| l.downcast_ref::<L>())
    }

    /// The published message, if it is a `T`.
    pub fn message<T: Any>(&self) -> Option<&T> {
        self.message.downcast_ref::<T>()
    }

    /// Concrete type of the published message.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn cause(&self) -> &ErrorCause {
        &self.cause
    }
}

impl fmt::Debug for PublicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicationError")
            .field("handler", &self.handler)
            .field("accepts", &self.accepts)
            .field("subscription", &self.subscription)
            .field("delivery", &self.delivery)
            .field("cause", &self.cause)
            .finish()
    }
}

/// Receives every [`PublicationError`].
///
/// Implemented for closures, so `Arc::new(|e: &PublicationError| ...)`
/// works as an error handler.
pub trait ErrorHandler: Send + Sync + 'static {
    fn handle(&self, error: &PublicationError);
}

impl<F> ErrorHandler for F
where
    F: Fn(&PublicationError) + Send + Sync + 'static,
{
    fn handle(&self, error: &PublicationError) {
        self(error)
    }
}

/// Default error handler: logs every failure.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn handle(&self, error: &PublicationError) {
        tracing::error!(
            handler = error.handler(),
            message_type = error.message_type().name(),
            subscription = %error.subscription(),
            sequence = error.delivery().sequence.0,
            "publication error: {}",
            error.cause()
        );
    }
}
