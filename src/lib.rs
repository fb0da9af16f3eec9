//! # Courier
//!
//! An in-process publish/subscribe message bus with type-hierarchy aware
//! dispatch.
//!
//! ## Core Concepts
//!
//! - **Listeners**: Application objects describing their handlers, held weakly
//! - **Type declarations**: Supertypes and interfaces of a message type, so a
//!   handler for `Number` also sees every `Integer`
//! - **Dispatch**: Synchronous on the publishing thread, or asynchronous on a
//!   bounded worker pool with per-producer ordering
//! - **Reporting**: Handler failures go to an error handler, unmatched
//!   messages come back as [`DeadMessage`]s
//!
//! ## Example
//!
//! ```ignore
//! use courier::{Handlers, Listener, MessageBus, TypeDecl};
//!
//! struct Number(i64);
//! struct Integer { number: Number }
//!
//! struct Printer;
//!
//! impl Listener for Printer {
//!     fn describe(&self, handlers: &mut Handlers<Self>) {
//!         handlers.on::<Number>(|_, n| {
//!             println!("number {}", n.0);
//!             Ok(())
//!         });
//!     }
//! }
//!
//! let bus = MessageBus::new()?;
//! bus.declare(TypeDecl::<Integer>::new().extends::<Number>(|i| &i.number))?;
//!
//! let printer = Arc::new(Printer);
//! bus.subscribe(&printer)?;
//!
//! bus.publish(Integer { number: Number(42) });
//! ```

pub mod bus;
mod dispatch;
pub mod error;
pub mod hierarchy;
pub mod reporting;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use bus::{Backpressure, BusConfig, MessageBus, ShutdownPolicy};
pub use error::{BusError, Result};
pub use hierarchy::{DispatchMode, TypeClosure, TypeDecl, TypeHierarchy};
pub use reporting::{DeadMessage, ErrorCause, ErrorHandler, LoggingErrorHandler, PublicationError};
pub use subscriptions::{
    BindingOptions, DispatchPlan, Envelope, HandlerBinding, HandlerError, HandlerResult, Handlers,
    Invocation, Listener, LivenessTracker, SubscriptionRegistry,
};
pub use types::*;
