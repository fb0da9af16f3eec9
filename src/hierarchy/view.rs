//! Typed projections from a type-erased message to one of its supertypes.

use std::any::Any;
use std::sync::Arc;

/// Type-erased message payload as stored by the bus.
pub(crate) type Payload = dyn Any + Send + Sync;

/// A `View<U>` behind `dyn Any`, so closures over different targets can
/// share one collection.
pub(crate) type ErasedView = Arc<dyn Any + Send + Sync>;

type Project<U> = dyn for<'a> Fn(&'a Payload) -> Option<&'a U> + Send + Sync;

/// Projects the payload of one concrete message type to `&U`.
pub(crate) struct View<U: ?Sized + 'static> {
    project: Arc<Project<U>>,
}

impl<U: ?Sized + 'static> Clone for View<U> {
    fn clone(&self) -> Self {
        Self {
            project: Arc::clone(&self.project),
        }
    }
}

/// Pins a closure to the higher-ranked projection signature.
fn projection<U, F>(f: F) -> F
where
    U: ?Sized + 'static,
    F: for<'a> Fn(&'a Payload) -> Option<&'a U> + Send + Sync + 'static,
{
    f
}

impl<U: Send + Sync + 'static> View<U> {
    /// The payload seen as itself.
    pub(crate) fn identity() -> Self {
        Self {
            project: Arc::new(projection::<U, _>(|payload| payload.downcast_ref::<U>())),
        }
    }
}

impl<U: ?Sized + 'static> View<U> {
    /// Extends this view with one more upcast step.
    pub(crate) fn then<V: ?Sized + 'static>(&self, cast: fn(&U) -> &V) -> View<V> {
        let inner = Arc::clone(&self.project);
        View {
            project: Arc::new(projection::<V, _>(move |payload| {
                (inner)(payload).map(cast)
            })),
        }
    }

    pub(crate) fn project<'a>(&self, payload: &'a Payload) -> Option<&'a U> {
        (self.project)(payload)
    }

    pub(crate) fn erase(self) -> ErasedView {
        Arc::new(self)
    }
}

/// Recovers a typed view from its erased form.
pub(crate) fn typed<U: ?Sized + 'static>(view: &ErasedView) -> Option<&View<U>> {
    (**view).downcast_ref::<View<U>>()
}
