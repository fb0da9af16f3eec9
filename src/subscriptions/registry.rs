//! Subscription registry with copy-on-write snapshots.
//!
//! All registry state lives in one immutable [`RegistryState`] behind an
//! [`ArcSwap`]. Publishers load it without locking. Writers serialize on
//! `write_lock`, build the next state from the current one and swap it in;
//! a published state is never mutated.
//!
//! Dispatch plans are cached inside the state. Every write bumps the
//! generation and starts with an empty plan cache, and a reader only
//! inserts a plan it built if the generation is still the one it read.

use super::liveness::LivenessTracker;
use super::types::{HandlerBinding, Handlers, Listener};
use crate::error::Result;
use crate::hierarchy::view::ErasedView;
use crate::hierarchy::{TypeClosure, TypeDecl, TypeHierarchy};
use crate::types::{dispatch_order, MessageType, SubscriptionId};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Identity of a listener instance: the address of its `Arc` allocation.
///
/// The registry keeps a `Weak` to every tracked listener, which pins the
/// allocation, so an address cannot be reused while it is registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ListenerKey(usize);

impl ListenerKey {
    pub(crate) fn of<L>(listener: &Arc<L>) -> Self {
        ListenerKey(Arc::as_ptr(listener) as *const () as usize)
    }
}

/// Live association between a listener instance and its bindings.
pub(crate) struct Subscription {
    pub(crate) id: SubscriptionId,
    key: ListenerKey,
    pub(crate) listener_type: &'static str,
    listener: Weak<dyn Any + Send + Sync>,
    pub(crate) bindings: Vec<HandlerBinding>,
    active: AtomicBool,
}

impl Subscription {
    fn new<L: Listener>(
        id: SubscriptionId,
        listener: &Arc<L>,
        bindings: Vec<HandlerBinding>,
    ) -> Self {
        let weak: Weak<L> = Arc::downgrade(listener);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        Self {
            id,
            key: ListenerKey::of(listener),
            listener_type: std::any::type_name::<L>(),
            listener: weak,
            bindings,
            active: AtomicBool::new(true),
        }
    }

    /// Strong reference for the duration of one invocation.
    ///
    /// `None` once the subscription was removed or the listener dropped.
    pub(crate) fn upgrade(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        if !self.active.load(Ordering::Acquire) {
            return None;
        }
        self.listener.upgrade()
    }

    pub(crate) fn is_live(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.listener.strong_count() > 0
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Distinct declared message types, in declaration order.
    fn declared_types(&self) -> Vec<MessageType> {
        let mut types: Vec<MessageType> = Vec::new();
        for binding in &self.bindings {
            if !types.contains(&binding.accepts()) {
                types.push(binding.accepts());
            }
        }
        types
    }
}

/// One handler to run for a concrete message type.
#[derive(Clone)]
pub(crate) struct Target {
    pub(crate) subscription: Arc<Subscription>,
    pub(crate) binding: usize,
    pub(crate) view: ErasedView,
}

impl Target {
    pub(crate) fn binding(&self) -> &HandlerBinding {
        &self.subscription.bindings[self.binding]
    }
}

/// Cached, priority-ordered handlers for one concrete message type,
/// merged across its whole type closure.
pub struct DispatchPlan {
    message_type: MessageType,
    generation: u64,
    targets: Vec<Target>,
}

impl DispatchPlan {
    /// Dead subscriptions are left out and reported to `liveness`.
    fn build(state: &RegistryState, closure: &TypeClosure, liveness: &LivenessTracker) -> Self {
        let concrete = closure.concrete();
        let mut targets = Vec::new();

        for entry in closure.entries() {
            let Some(subscriptions) = state.by_type.get(&entry.ty.id()) else {
                continue;
            };
            for subscription in subscriptions {
                if !subscription.is_live() {
                    liveness.mark_unreachable();
                    continue;
                }
                for (index, binding) in subscription.bindings.iter().enumerate() {
                    if binding.matches(entry.ty, concrete) {
                        targets.push(Target {
                            subscription: Arc::clone(subscription),
                            binding: index,
                            view: Arc::clone(&entry.view),
                        });
                    }
                }
            }
        }

        targets.sort_by(|a, b| {
            dispatch_order(
                (a.binding().priority(), a.subscription.id, a.binding),
                (b.binding().priority(), b.subscription.id, b.binding),
            )
        });

        Self {
            message_type: concrete,
            generation: state.generation,
            targets,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Registry generation this plan was built from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Handler names in invocation order.
    pub fn handler_names(&self) -> Vec<String> {
        self.targets
            .iter()
            .map(|t| t.binding().name().to_string())
            .collect()
    }

    pub(crate) fn targets(&self) -> &[Target] {
        &self.targets
    }
}

/// Immutable registry snapshot.
#[derive(Clone, Default)]
struct RegistryState {
    generation: u64,
    /// Declared message type -> subscriptions, in registration order.
    by_type: Arc<HashMap<TypeId, Vec<Arc<Subscription>>>>,
    listeners: Arc<HashMap<ListenerKey, Arc<Subscription>>>,
    plans: HashMap<TypeId, Arc<DispatchPlan>>,
}

/// Owns all subscriptions and the dispatch plan cache.
pub struct SubscriptionRegistry {
    hierarchy: TypeHierarchy,
    state: ArcSwap<RegistryState>,
    /// Serializes writers. Readers never take it.
    write_lock: Mutex<()>,
    next_id: AtomicU64,
    liveness: LivenessTracker,
}

impl SubscriptionRegistry {
    pub fn new(hierarchy: TypeHierarchy, liveness: LivenessTracker) -> Self {
        Self {
            hierarchy,
            state: ArcSwap::from_pointee(RegistryState::default()),
            write_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            liveness,
        }
    }

    pub fn hierarchy(&self) -> &TypeHierarchy {
        &self.hierarchy
    }

    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }

    /// Current registry generation. Changes on every structural write.
    pub fn generation(&self) -> u64 {
        self.state.load().generation
    }

    /// Number of tracked listener instances.
    pub fn subscription_count(&self) -> usize {
        self.state.load().listeners.len()
    }

    /// Declare supertypes of `C`, invalidating all cached plans.
    pub fn declare<C: ?Sized + 'static>(&self, decl: TypeDecl<C>) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.hierarchy.declare(decl)?;

        let current = self.state.load_full();
        self.state.store(Arc::new(RegistryState {
            generation: current.generation + 1,
            by_type: Arc::clone(&current.by_type),
            listeners: Arc::clone(&current.listeners),
            plans: HashMap::new(),
        }));
        Ok(())
    }

    /// Register all handlers of `listener`.
    ///
    /// Subscribing an instance that is already subscribed is ignored and
    /// returns the existing id.
    pub fn subscribe<L: Listener>(&self, listener: &Arc<L>) -> Result<SubscriptionId> {
        let key = ListenerKey::of(listener);
        if let Some(existing) = self.state.load().listeners.get(&key) {
            return Ok(existing.id);
        }

        // Extraction runs user code, keep it out of the critical section.
        let mut handlers = Handlers::new();
        listener.describe(&mut handlers);
        let bindings = handlers.finish()?;

        let _guard = self.write_lock.lock();
        let current = self.state.load_full();
        if let Some(existing) = current.listeners.get(&key) {
            return Ok(existing.id);
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let subscription = Arc::new(Subscription::new(id, listener, bindings));

        let mut by_type = (*current.by_type).clone();
        for ty in subscription.declared_types() {
            by_type
                .entry(ty.id())
                .or_default()
                .push(Arc::clone(&subscription));
        }
        let mut listeners = (*current.listeners).clone();
        listeners.insert(key, Arc::clone(&subscription));

        tracing::debug!(
            subscription = %id,
            listener = subscription.listener_type,
            handlers = subscription.bindings.len(),
            "subscribed listener"
        );

        self.publish_state(&current, by_type, listeners);
        Ok(id)
    }

    /// Remove all handlers of `listener`. Returns false if it was not subscribed.
    pub fn unsubscribe<L: Listener>(&self, listener: &Arc<L>) -> bool {
        let key = ListenerKey::of(listener);
        if !self.state.load().listeners.contains_key(&key) {
            return false;
        }

        let _guard = self.write_lock.lock();
        let removed = self.remove_where(|s| s.key == key);
        if let Some(subscription) = removed.first() {
            tracing::debug!(
                subscription = %subscription.id,
                listener = subscription.listener_type,
                "unsubscribed listener"
            );
        }
        !removed.is_empty()
    }

    /// Prune subscriptions whose listener is no longer reachable.
    ///
    /// Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let guard = self.write_lock.lock();
        self.sweep_locked(guard)
    }

    /// Like [`sweep`](Self::sweep), but gives up if a writer is active.
    pub fn try_sweep(&self) -> Option<usize> {
        let guard = self.write_lock.try_lock()?;
        Some(self.sweep_locked(guard))
    }

    /// Counts a publish and sweeps opportunistically when one is due.
    pub(crate) fn after_publish(&self) {
        if self.liveness.record_publish() {
            self.try_sweep();
        }
    }

    fn sweep_locked(&self, _guard: MutexGuard<'_, ()>) -> usize {
        self.liveness.begin_sweep();
        let removed = self.remove_where(|s| !s.is_live());
        if !removed.is_empty() {
            tracing::debug!(removed = removed.len(), "swept unreachable listeners");
        }
        removed.len()
    }

    /// Dispatch plan for the concrete type `M`, built on a cache miss.
    pub fn plan_for<M: Send + Sync + 'static>(&self) -> Arc<DispatchPlan> {
        let id = TypeId::of::<M>();
        let state = self.state.load_full();
        if let Some(plan) = state.plans.get(&id) {
            return Arc::clone(plan);
        }

        let closure = self.hierarchy.closure_of::<M>();
        let plan = Arc::new(DispatchPlan::build(&state, &closure, &self.liveness));
        tracing::trace!(
            ty = plan.message_type.name(),
            handlers = plan.len(),
            generation = plan.generation,
            "built dispatch plan"
        );

        self.state.rcu(|current| {
            if current.generation != plan.generation || current.plans.contains_key(&id) {
                return Arc::clone(current);
            }
            let mut next = RegistryState::clone(current);
            next.plans.insert(id, Arc::clone(&plan));
            Arc::new(next)
        });

        plan
    }

    /// Removes matching subscriptions and publishes the next state.
    ///
    /// Callers must hold `write_lock`.
    fn remove_where(&self, condition: impl Fn(&Subscription) -> bool) -> Vec<Arc<Subscription>> {
        let current = self.state.load_full();
        let removed: Vec<Arc<Subscription>> = current
            .listeners
            .values()
            .filter(|s| condition(s))
            .cloned()
            .collect();
        if removed.is_empty() {
            return removed;
        }

        // Deactivate first so in-flight snapshots skip them from now on.
        for subscription in &removed {
            subscription.deactivate();
        }

        let mut listeners = (*current.listeners).clone();
        for subscription in &removed {
            listeners.remove(&subscription.key);
        }
        let mut by_type = (*current.by_type).clone();
        by_type.retain(|_, subscriptions| {
            subscriptions.retain(|s| s.active.load(Ordering::Acquire));
            !subscriptions.is_empty()
        });

        self.publish_state(&current, by_type, listeners);
        removed
    }

    fn publish_state(
        &self,
        current: &RegistryState,
        by_type: HashMap<TypeId, Vec<Arc<Subscription>>>,
        listeners: HashMap<ListenerKey, Arc<Subscription>>,
    ) {
        self.state.store(Arc::new(RegistryState {
            generation: current.generation + 1,
            by_type: Arc::new(by_type),
            listeners: Arc::new(listeners),
            plans: HashMap::new(),
        }));
    }
}
