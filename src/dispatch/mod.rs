//! Message dispatch.
//!
//! The [`Dispatcher`] walks a [`DispatchPlan`] in priority order and offers
//! the message to each binding. Failures are contained per handler: an
//! `Err` or a panic becomes a [`PublicationError`] for the error handler,
//! and the walk continues with the next binding.
//!
//! Synchronous publishes run the walk on the caller's thread. Asynchronous
//! publishes hand the whole walk to the [`pipeline`]; bindings declared
//! [`Invocation::Asynchronous`] are handed to it one by one even when the
//! publish itself is synchronous.

pub(crate) mod pipeline;

use crate::error::Result;
use crate::hierarchy::view::Payload;
use crate::reporting::{DeadMessage, ErrorCause, ErrorHandler, PublicationError};
use crate::subscriptions::{DispatchPlan, Invocation, Outcome, SubscriptionRegistry, Target};
use crate::types::{Delivery, MessageType, PublishMode, Sequence, Timestamp};
use pipeline::Pipeline;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A message on its way to handlers.
#[derive(Clone)]
pub(crate) struct Publication {
    payload: Arc<Payload>,
    delivery: Delivery,
}

/// Routes publications to the handlers of a [`SubscriptionRegistry`].
pub(crate) struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    errors: Arc<dyn ErrorHandler>,
    dead_messages: bool,
    sequence: AtomicU64,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<SubscriptionRegistry>,
        errors: Arc<dyn ErrorHandler>,
        dead_messages: bool,
    ) -> Self {
        Self {
            registry,
            errors,
            dead_messages,
            sequence: AtomicU64::new(0),
        }
    }

    pub(crate) fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Last sequence number handed out.
    pub(crate) fn last_sequence(&self) -> Sequence {
        Sequence(self.sequence.load(Ordering::Acquire))
    }

    /// Delivers `message` on the calling thread.
    ///
    /// Asynchronous bindings are queued on `pipeline`.
    pub(crate) fn publish<M: Send + Sync + 'static>(
        self: &Arc<Self>,
        message: M,
        pipeline: &Pipeline,
    ) {
        let plan = self.registry.plan_for::<M>();
        let publication = self.publication(message, PublishMode::Sync);
        self.deliver(&publication, &plan, Some(pipeline));
        self.registry.after_publish();
    }

    /// Queues the delivery of `message` and returns.
    ///
    /// Handlers are resolved now; a listener unsubscribed before the
    /// worker gets to it is skipped.
    pub(crate) fn publish_async<M: Send + Sync + 'static>(
        self: &Arc<Self>,
        message: M,
        pipeline: &Pipeline,
    ) -> Result<()> {
        let plan = self.registry.plan_for::<M>();
        let publication = self.publication(message, PublishMode::Async);
        let dispatcher = Arc::clone(self);
        pipeline.submit(Box::new(move || {
            dispatcher.deliver(&publication, &plan, None);
        }))?;
        self.registry.after_publish();
        Ok(())
    }

    fn publication<M: Send + Sync + 'static>(&self, message: M, mode: PublishMode) -> Publication {
        let sequence = Sequence(self.sequence.fetch_add(1, Ordering::AcqRel) + 1);
        Publication {
            payload: Arc::new(message),
            delivery: Delivery {
                message_type: MessageType::of::<M>(),
                sequence,
                published_at: Timestamp::now(),
                mode,
            },
        }
    }

    /// Runs every target of `plan`, then routes the message to the
    /// dead-message handlers if none of them accepted it.
    ///
    /// `pipeline` is `None` on worker threads, where asynchronous bindings
    /// run inline.
    fn deliver(
        self: &Arc<Self>,
        publication: &Publication,
        plan: &DispatchPlan,
        pipeline: Option<&Pipeline>,
    ) {
        let mut matched = 0;
        for target in plan.targets() {
            if self.offer(publication, target, pipeline) {
                matched += 1;
            }
        }
        if matched == 0 {
            self.route_dead(publication, pipeline);
        }
    }

    /// Returns whether the target accepted the message.
    fn offer(
        self: &Arc<Self>,
        publication: &Publication,
        target: &Target,
        pipeline: Option<&Pipeline>,
    ) -> bool {
        match pipeline {
            Some(pipeline) if target.binding().invocation() == Invocation::Asynchronous => {
                self.defer(publication, target, pipeline);
                true
            }
            _ => self.invoke(publication, target),
        }
    }

    fn defer(self: &Arc<Self>, publication: &Publication, target: &Target, pipeline: &Pipeline) {
        let dispatcher = Arc::clone(self);
        let deferred = publication.clone();
        let queued = target.clone();
        let submitted = pipeline.submit(Box::new(move || {
            dispatcher.invoke(&deferred, &queued);
        }));
        if let Err(err) = submitted {
            let listener = target.subscription.upgrade();
            self.report(publication, target, listener, ErrorCause::Rejected(err));
        }
    }

    fn invoke(&self, publication: &Publication, target: &Target) -> bool {
        let Some(listener) = target.subscription.upgrade() else {
            self.registry.liveness().mark_unreachable();
            return false;
        };

        let binding = target.binding();
        let outcome = {
            let _serial = binding.serialize();
            catch_unwind(AssertUnwindSafe(|| {
                binding.invoke(
                    &*listener,
                    &*publication.payload,
                    &target.view,
                    &publication.delivery,
                )
            }))
        };

        match outcome {
            Ok(Outcome::Skipped) | Ok(Outcome::Filtered) => false,
            Ok(Outcome::Invoked(Ok(()))) => true,
            Ok(Outcome::Invoked(Err(err))) => {
                self.report(publication, target, Some(listener), ErrorCause::Failed(err));
                true
            }
            Err(panic) => {
                self.report(
                    publication,
                    target,
                    Some(listener),
                    ErrorCause::from_panic(panic),
                );
                true
            }
        }
    }

    fn report(
        &self,
        publication: &Publication,
        target: &Target,
        listener: Option<Arc<dyn Any + Send + Sync>>,
        cause: ErrorCause,
    ) {
        let error = PublicationError::new(
            target.binding(),
            target.subscription.id,
            listener,
            Arc::clone(&publication.payload),
            publication.delivery,
            cause,
        );
        let errors = &self.errors;
        if catch_unwind(AssertUnwindSafe(|| errors.handle(&error))).is_err() {
            tracing::error!(
                handler = error.handler(),
                "error handler panicked while reporting: {}",
                error
            );
        }
    }

    /// Wraps an unmatched message in a [`DeadMessage`] and offers it once.
    fn route_dead(self: &Arc<Self>, publication: &Publication, pipeline: Option<&Pipeline>) {
        let message_type = publication.delivery.message_type;
        if !self.dead_messages || message_type.is::<DeadMessage>() {
            tracing::trace!(ty = message_type.name(), "dropping unmatched message");
            return;
        }

        let plan = self.registry.plan_for::<DeadMessage>();
        if plan.is_empty() {
            tracing::trace!(ty = message_type.name(), "no dead message handlers");
            return;
        }

        let dead = Publication {
            payload: Arc::new(DeadMessage::new(
                Arc::clone(&publication.payload),
                publication.delivery,
            )),
            delivery: Delivery {
                message_type: MessageType::of::<DeadMessage>(),
                ..publication.delivery
            },
        };
        for target in plan.targets() {
            self.offer(&dead, target, pipeline);
        }
    }
}
