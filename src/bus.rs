//! The message bus facade.

use crate::dispatch::pipeline::Pipeline;
use crate::dispatch::Dispatcher;
use crate::error::{BusError, Result};
use crate::hierarchy::{DispatchMode, TypeClosure, TypeDecl, TypeHierarchy};
use crate::reporting::{ErrorHandler, LoggingErrorHandler};
use crate::subscriptions::{Janitor, Listener, LivenessTracker, SubscriptionRegistry};
use crate::types::{Sequence, SubscriptionId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How long dropping a bus waits for queued deliveries.
const DROP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// What `publish_async` does when the delivery queue is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Backpressure {
    /// Wait until there is room.
    #[default]
    Block,
    /// Return [`BusError::DeliveryBackpressure`] immediately.
    Fail,
}

/// What happens to queued deliveries on shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ShutdownPolicy {
    /// Run everything already queued before stopping.
    #[default]
    Drain,
    /// Drop queued deliveries. The ones already running complete.
    Discard,
}

/// Configuration for a [`MessageBus`].
#[derive(Clone)]
pub struct BusConfig {
    /// Async worker threads. Each worker owns one delivery lane.
    pub worker_threads: usize,

    /// Deliveries admitted per lane, queued and running together.
    ///
    /// The bound applies to each lane, so the bus as a whole admits up to
    /// `worker_threads * queue_capacity` deliveries. Deliveries submitted
    /// by a handler running on a worker are not counted under
    /// [`Backpressure::Block`].
    pub queue_capacity: usize,

    pub backpressure: Backpressure,

    /// Whether handlers for supertypes see subtype messages.
    pub dispatch_mode: DispatchMode,

    /// Whether unmatched messages are republished as
    /// [`DeadMessage`](crate::DeadMessage)s.
    pub dead_messages: bool,

    /// Receives handler failures. `None` logs them.
    pub error_handler: Option<Arc<dyn ErrorHandler>>,

    pub shutdown_policy: ShutdownPolicy,

    /// Publishes between liveness sweeps. `None` disables.
    pub sweep_every: Option<u64>,

    /// Period of the background sweeper thread. `None` disables it.
    pub sweep_period: Option<Duration>,

    /// Prefix for worker thread names.
    pub thread_name: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            worker_threads: (cpus / 2).max(1),
            queue_capacity: 1024,
            backpressure: Backpressure::Block,
            dispatch_mode: DispatchMode::ExactWithSuperTypes,
            dead_messages: true,
            error_handler: None,
            shutdown_policy: ShutdownPolicy::Drain,
            sweep_every: Some(1024),
            sweep_period: None,
            thread_name: "courier-worker".to_string(),
        }
    }
}

impl fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConfig")
            .field("worker_threads", &self.worker_threads)
            .field("queue_capacity", &self.queue_capacity)
            .field("backpressure", &self.backpressure)
            .field("dispatch_mode", &self.dispatch_mode)
            .field("dead_messages", &self.dead_messages)
            .field("error_handler", &self.error_handler.is_some())
            .field("shutdown_policy", &self.shutdown_policy)
            .field("sweep_every", &self.sweep_every)
            .field("sweep_period", &self.sweep_period)
            .field("thread_name", &self.thread_name)
            .finish()
    }
}

/// In-process publish/subscribe bus.
///
/// Listeners are subscribed by `Arc` and held weakly; dropping the last
/// application reference to a listener is enough to stop its deliveries.
///
/// # Example
///
/// ```ignore
/// let bus = MessageBus::new()?;
/// bus.declare(TypeDecl::<Integer>::new().extends::<Number>(|i| &i.number))?;
///
/// let audit = Arc::new(Audit::default());
/// bus.subscribe(&audit)?;
///
/// bus.publish(Integer::new(42));
/// bus.publish_async(Integer::new(7))?;
///
/// assert!(bus.shutdown(Duration::from_secs(1)));
/// ```
pub struct MessageBus {
    dispatcher: Arc<Dispatcher>,
    pipeline: Pipeline,
    janitor: Mutex<Option<Janitor>>,
    shutdown_policy: ShutdownPolicy,
}

impl MessageBus {
    /// A bus with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Result<Self> {
        let registry = Arc::new(SubscriptionRegistry::new(
            TypeHierarchy::new(config.dispatch_mode),
            LivenessTracker::new(config.sweep_every),
        ));

        let pipeline = Pipeline::start(
            config.worker_threads,
            config.queue_capacity,
            config.backpressure,
            &config.thread_name,
        )?;

        let janitor = match config.sweep_period {
            Some(period) if !period.is_zero() => Some(Janitor::spawn(
                Arc::downgrade(&registry),
                period,
                format!("{}-sweeper", config.thread_name),
            )?),
            _ => None,
        };

        let errors: Arc<dyn ErrorHandler> = match config.error_handler {
            Some(handler) => handler,
            None => Arc::new(LoggingErrorHandler),
        };

        tracing::debug!(
            workers = config.worker_threads.max(1),
            dispatch_mode = ?config.dispatch_mode,
            dead_messages = config.dead_messages,
            "message bus started"
        );

        Ok(Self {
            dispatcher: Arc::new(Dispatcher::new(registry, errors, config.dead_messages)),
            pipeline,
            janitor: Mutex::new(janitor),
            shutdown_policy: config.shutdown_policy,
        })
    }

    fn registry(&self) -> &SubscriptionRegistry {
        self.dispatcher.registry()
    }

    /// Declare the supertypes of `C`.
    ///
    /// Declarations apply to publishes made after this returns.
    pub fn declare<C: ?Sized + 'static>(&self, decl: TypeDecl<C>) -> Result<()> {
        self.registry().declare(decl)
    }

    /// Register every handler `listener` describes.
    ///
    /// The bus keeps only a weak reference. Subscribing the same instance
    /// again is ignored and returns the id of the existing subscription.
    pub fn subscribe<L: Listener>(&self, listener: &Arc<L>) -> Result<SubscriptionId> {
        self.registry().subscribe(listener)
    }

    /// Remove every handler of `listener`.
    ///
    /// Returns false if it was not subscribed.
    pub fn unsubscribe<L: Listener>(&self, listener: &Arc<L>) -> bool {
        self.registry().unsubscribe(listener)
    }

    /// Deliver `message` on the calling thread.
    ///
    /// Handler failures go to the error handler, never to the caller.
    /// Handlers declared asynchronous are queued for the worker pool.
    pub fn publish<M: Send + Sync + 'static>(&self, message: M) {
        self.dispatcher.publish(message, &self.pipeline)
    }

    /// Queue `message` for delivery on a worker thread.
    ///
    /// Messages published from one thread are delivered in order.
    ///
    /// # Errors
    ///
    /// - [`BusError::DeliveryBackpressure`] if the queue is full and the
    ///   bus is configured with [`Backpressure::Fail`]
    /// - [`BusError::ShutDown`] after [`shutdown`](Self::shutdown)
    pub fn publish_async<M: Send + Sync + 'static>(&self, message: M) -> Result<()> {
        self.dispatcher.publish_async(message, &self.pipeline)
    }

    /// Prune subscriptions whose listener has been dropped.
    pub fn sweep(&self) -> usize {
        self.registry().sweep()
    }

    /// Number of subscribed listener instances.
    pub fn subscription_count(&self) -> usize {
        self.registry().subscription_count()
    }

    /// Whether async deliveries are queued or running.
    pub fn has_pending_messages(&self) -> bool {
        self.pipeline.has_pending()
    }

    /// Types whose handlers receive a published `M`, most specific first.
    pub fn closure_of<M: Send + Sync + 'static>(&self) -> Arc<TypeClosure> {
        self.registry().hierarchy().closure_of::<M>()
    }

    /// Sequence number of the most recent publish.
    pub fn last_sequence(&self) -> Sequence {
        self.dispatcher.last_sequence()
    }

    pub fn is_shut_down(&self) -> bool {
        self.pipeline.is_shut_down()
    }

    /// Stop accepting async work and wait for the workers.
    ///
    /// Returns whether the workers finished within `timeout`. Calling it
    /// again after a timeout keeps waiting for the same workers. Called
    /// from a handler running on a worker, it stops accepting async work
    /// and returns false without waiting.
    /// Synchronous `publish` keeps working afterwards.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        if let Some(janitor) = self.janitor.lock().take() {
            janitor.stop();
        }
        let finished = self.pipeline.shutdown(self.shutdown_policy, timeout);
        tracing::debug!(finished, policy = ?self.shutdown_policy, "message bus shut down");
        finished
    }

    /// Like [`shutdown`](Self::shutdown), but a timeout is an error.
    pub fn try_shutdown(&self, timeout: Duration) -> Result<()> {
        if self.shutdown(timeout) {
            Ok(())
        } else {
            Err(BusError::ShutdownTimeout(timeout))
        }
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        // Best-effort drain on drop. A worker cannot wait for itself, so
        // there the lanes are only closed.
        let _ = self.shutdown(DROP_SHUTDOWN_TIMEOUT);
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("subscriptions", &self.subscription_count())
            .field("capacity", &self.pipeline.capacity())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
