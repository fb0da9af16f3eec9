//! Subscription system: listeners, their handler bindings and the registry.
//!
//! This module provides:
//! - The [`Listener`] trait, through which an instance declares its handlers
//! - The [`SubscriptionRegistry`], mapping message types to live subscriptions
//! - Cached [`DispatchPlan`]s, one per concrete message type
//! - The [`LivenessTracker`], pruning listeners nothing else references
//!
//! Handlers support:
//! - Priorities (higher first, ties in registration order)
//! - Filters, all of which must pass
//! - Enveloped delivery with publication metadata
//! - Asynchronous invocation and per-handler serialization
//!
//! # Example
//!
//! ```ignore
//! struct Totals { sum: AtomicI64 }
//!
//! impl Listener for Totals {
//!     fn describe(&self, handlers: &mut Handlers<Self>) {
//!         handlers
//!             .on::<dyn Numeric>(|me, n| {
//!                 me.sum.fetch_add(n.value(), Ordering::SeqCst);
//!                 Ok(())
//!             })
//!             .filter(|n| n.value() > 0)
//!             .priority(5);
//!     }
//! }
//!
//! let totals = Arc::new(Totals { sum: AtomicI64::new(0) });
//! bus.subscribe(&totals)?;
//! ```

mod liveness;
mod registry;
mod types;

pub use liveness::LivenessTracker;
pub use registry::{DispatchPlan, SubscriptionRegistry};
pub use types::{
    BindingOptions, Envelope, HandlerBinding, HandlerError, HandlerResult, Handlers, Invocation,
    Listener,
};

pub(crate) use liveness::Janitor;
pub(crate) use registry::Target;
pub(crate) use types::Outcome;
