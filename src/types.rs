//! Core types for the message bus.

use std::any::TypeId;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of a runtime message type.
///
/// Works for concrete types as well as trait-object types (`dyn Trait`),
/// which act as interfaces in a declared type hierarchy.
#[derive(Clone, Copy)]
pub struct MessageType {
    id: TypeId,
    name: &'static str,
}

impl MessageType {
    /// Identity of `T`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Type name, for diagnostics only.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether this is the identity of `T`.
    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MessageType {}

impl Hash for MessageType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageType({})", self.name)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Unique identifier for a subscription.
///
/// Ids are handed out in registration order and double as the
/// tie-break when handlers share a priority.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Publication counter, assigned per bus.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// How a message entered the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishMode {
    /// `publish`: handlers run on the caller's thread.
    Sync,
    /// `publish_async`: handlers run on a worker thread.
    Async,
}

/// Metadata attached to every publication.
///
/// Handed to enveloped handlers and carried by publication errors and
/// dead messages.
#[derive(Clone, Copy, Debug)]
pub struct Delivery {
    /// Concrete runtime type of the published message.
    pub message_type: MessageType,
    pub sequence: Sequence,
    /// When the publish call was made.
    pub published_at: Timestamp,
    pub mode: PublishMode,
}

/// Total order used for dispatch: higher priority first, then registration
/// order, then declaration order within the listener.
pub(crate) fn dispatch_order(
    a: (i32, SubscriptionId, usize),
    b: (i32, SubscriptionId, usize),
) -> Ordering {
    b.0.cmp(&a.0)
        .then_with(|| a.1.cmp(&b.1))
        .then_with(|| a.2.cmp(&b.2))
}
