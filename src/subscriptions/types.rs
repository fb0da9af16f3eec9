//! Handler descriptors: the listener side of a subscription.

use crate::error::{BusError, Result};
use crate::hierarchy::view::{typed, ErasedView, Payload};
use crate::types::{Delivery, MessageType, Sequence, Timestamp};
use parking_lot::{Mutex, MutexGuard};
use std::any::Any;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::ops::Deref;

/// Error returned by a failing handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of every handler.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// An application object that exposes message handlers.
///
/// The bus calls [`describe`](Listener::describe) once per `subscribe` to
/// learn which handlers the instance exposes.
///
/// # Example
///
/// ```ignore
/// struct Audit { seen: AtomicUsize }
///
/// impl Listener for Audit {
///     fn describe(&self, handlers: &mut Handlers<Self>) {
///         handlers.on::<OrderPlaced>(|me, _| {
///             me.seen.fetch_add(1, Ordering::SeqCst);
///             Ok(())
///         })
///         .priority(10);
///     }
/// }
/// ```
pub trait Listener: Send + Sync + Sized + 'static {
    fn describe(&self, handlers: &mut Handlers<Self>);
}

/// Where a handler runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Invocation {
    /// On the publishing thread for `publish`, on a worker for `publish_async`.
    #[default]
    Synchronous,
    /// Always on a worker thread, even for `publish`.
    Asynchronous,
}

/// A message together with its delivery metadata.
pub struct Envelope<'a, M: ?Sized> {
    message: &'a M,
    delivery: &'a Delivery,
}

impl<'a, M: ?Sized> Envelope<'a, M> {
    pub fn message(&self) -> &'a M {
        self.message
    }

    pub fn delivery(&self) -> &'a Delivery {
        self.delivery
    }

    /// Concrete runtime type of the published message.
    pub fn message_type(&self) -> MessageType {
        self.delivery.message_type
    }

    pub fn sequence(&self) -> Sequence {
        self.delivery.sequence
    }

    pub fn published_at(&self) -> Timestamp {
        self.delivery.published_at
    }
}

impl<M: ?Sized> Deref for Envelope<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.message
    }
}

/// Result of offering a message to one binding.
pub(crate) enum Outcome {
    /// The binding does not apply (listener or view mismatch).
    Skipped,
    /// A filter rejected the message.
    Filtered,
    /// The handler ran.
    Invoked(HandlerResult),
}

type Invoker =
    dyn Fn(&(dyn Any + Send + Sync), &Payload, &ErasedView, &[Filter], &Delivery) -> Outcome
        + Send
        + Sync;

/// A type-erased `FilterFn<M>`.
type Filter = Box<dyn Any + Send + Sync>;

struct FilterFn<M: ?Sized>(Box<dyn Fn(&M) -> bool + Send + Sync>);

/// One handler of one listener instance.
///
/// Produced at subscribe time and immutable afterwards.
pub struct HandlerBinding {
    name: String,
    accepts: MessageType,
    priority: i32,
    invocation: Invocation,
    enveloped: bool,
    accepts_subtypes: bool,
    serial: Option<Mutex<()>>,
    filters: Vec<Filter>,
    invoker: Box<Invoker>,
}

impl HandlerBinding {
    /// Label used in error reports.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared message type.
    pub fn accepts(&self) -> MessageType {
        self.accepts
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn invocation(&self) -> Invocation {
        self.invocation
    }

    /// Whether the handler receives an [`Envelope`].
    pub fn is_enveloped(&self) -> bool {
        self.enveloped
    }

    /// Whether messages of a subtype of the declared type are delivered.
    pub fn accepts_subtypes(&self) -> bool {
        self.accepts_subtypes
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    /// Whether this binding applies to a closure member `ty` of `concrete`.
    pub(crate) fn matches(&self, ty: MessageType, concrete: MessageType) -> bool {
        self.accepts == ty && (self.accepts_subtypes || ty == concrete)
    }

    /// Serializes invocations of synchronized handlers.
    pub(crate) fn serialize(&self) -> Option<MutexGuard<'_, ()>> {
        self.serial.as_ref().map(|lock| lock.lock())
    }

    pub(crate) fn invoke(
        &self,
        listener: &(dyn Any + Send + Sync),
        payload: &Payload,
        view: &ErasedView,
        delivery: &Delivery,
    ) -> Outcome {
        (self.invoker)(listener, payload, view, &self.filters, delivery)
    }
}

impl std::fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("name", &self.name)
            .field("accepts", &self.accepts)
            .field("priority", &self.priority)
            .field("invocation", &self.invocation)
            .field("enveloped", &self.enveloped)
            .field("accepts_subtypes", &self.accepts_subtypes)
            .field("filters", &self.filters.len())
            .finish()
    }
}

/// Collects the handler bindings of one listener instance.
pub struct Handlers<L> {
    bindings: Vec<HandlerBinding>,
    explicit_names: Vec<String>,
    _marker: PhantomData<fn(&L)>,
}

impl<L: Listener> Handlers<L> {
    pub(crate) fn new() -> Self {
        Self {
            bindings: Vec::new(),
            explicit_names: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Handle messages of type `M` (or any subtype declared on the bus).
    pub fn on<M: ?Sized + 'static>(
        &mut self,
        handler: impl Fn(&L, &M) -> HandlerResult + Send + Sync + 'static,
    ) -> BindingOptions<'_, M> {
        self.push::<M>(false, move |listener, message, _| handler(listener, message))
    }

    /// Like [`on`](Self::on), but the handler also receives delivery metadata.
    pub fn on_envelope<M: ?Sized + 'static>(
        &mut self,
        handler: impl Fn(&L, Envelope<'_, M>) -> HandlerResult + Send + Sync + 'static,
    ) -> BindingOptions<'_, M> {
        self.push::<M>(true, move |listener, message, delivery| {
            handler(listener, Envelope { message, delivery })
        })
    }

    fn push<M: ?Sized + 'static>(
        &mut self,
        enveloped: bool,
        call: impl Fn(&L, &M, &Delivery) -> HandlerResult + Send + Sync + 'static,
    ) -> BindingOptions<'_, M> {
        let accepts = MessageType::of::<M>();
        let name = format!(
            "{}::on<{}>#{}",
            std::any::type_name::<L>(),
            accepts.name(),
            self.bindings.len()
        );

        let invoker: Box<Invoker> = Box::new(
            move |listener: &(dyn Any + Send + Sync),
                  payload: &Payload,
                  view: &ErasedView,
                  filters: &[Filter],
                  delivery: &Delivery| {
                let Some(listener) = listener.downcast_ref::<L>() else {
                    return Outcome::Skipped;
                };
                let Some(message) = typed::<M>(view).and_then(|v| v.project(payload)) else {
                    return Outcome::Skipped;
                };
                let passes = filters.iter().all(|filter| {
                    filter
                        .downcast_ref::<FilterFn<M>>()
                        .is_some_and(|f| (f.0)(message))
                });
                if !passes {
                    return Outcome::Filtered;
                }
                Outcome::Invoked(call(listener, message, delivery))
            },
        );

        self.bindings.push(HandlerBinding {
            name,
            accepts,
            priority: 0,
            invocation: Invocation::default(),
            enveloped,
            accepts_subtypes: true,
            serial: None,
            filters: Vec::new(),
            invoker,
        });

        let index = self.bindings.len() - 1;
        BindingOptions {
            binding: &mut self.bindings[index],
            explicit_names: &mut self.explicit_names,
            _marker: PhantomData,
        }
    }

    /// Validates and returns the collected bindings.
    pub(crate) fn finish(self) -> Result<Vec<HandlerBinding>> {
        let listener = std::any::type_name::<L>();

        if self.bindings.is_empty() {
            return Err(BusError::InvalidHandlerDescriptor {
                listener,
                reason: "listener declares no handlers".to_string(),
            });
        }

        let mut names = HashSet::new();
        for name in &self.explicit_names {
            if !names.insert(name.as_str()) {
                return Err(BusError::InvalidHandlerDescriptor {
                    listener,
                    reason: format!("handler name '{}' is ambiguous", name),
                });
            }
        }

        Ok(self.bindings)
    }
}

/// Options for the binding just registered.
pub struct BindingOptions<'a, M: ?Sized> {
    binding: &'a mut HandlerBinding,
    explicit_names: &'a mut Vec<String>,
    _marker: PhantomData<fn(&M)>,
}

impl<M: ?Sized + 'static> BindingOptions<'_, M> {
    /// Higher priorities run earlier. Default 0.
    pub fn priority(self, priority: i32) -> Self {
        self.binding.priority = priority;
        self
    }

    /// Only deliver messages for which `filter` returns true.
    ///
    /// May be called repeatedly; all filters must pass.
    pub fn filter(self, filter: impl Fn(&M) -> bool + Send + Sync + 'static) -> Self {
        self.binding
            .filters
            .push(Box::new(FilterFn::<M>(Box::new(filter))));
        self
    }

    pub fn invocation(self, invocation: Invocation) -> Self {
        self.binding.invocation = invocation;
        self
    }

    /// Shorthand for `invocation(Invocation::Asynchronous)`.
    pub fn asynchronous(self) -> Self {
        self.invocation(Invocation::Asynchronous)
    }

    /// Reject subtypes: only messages whose runtime type is exactly `M`.
    pub fn exact(self) -> Self {
        self.binding.accepts_subtypes = false;
        self
    }

    /// Never run this handler concurrently with itself.
    pub fn synchronized(self) -> Self {
        self.binding.serial = Some(Mutex::new(()));
        self
    }

    /// Label used in error reports. Must be unique per listener.
    pub fn named(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.explicit_names.push(name.clone());
        self.binding.name = name;
        self
    }
}
