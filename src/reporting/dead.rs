//! Notification for messages no handler accepted.

use crate::hierarchy::view::Payload;
use crate::types::{Delivery, MessageType, Sequence, Timestamp};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A published message that matched no handler.
///
/// Subscribe a handler for `DeadMessage` to observe them:
///
/// ```ignore
/// handlers.on::<DeadMessage>(|me, dead| {
///     me.unmatched.lock().push(dead.message_type());
///     Ok(())
/// });
/// ```
///
/// A `DeadMessage` that matches nothing itself is dropped, and publishing
/// a `DeadMessage` directly never wraps it again.
#[derive(Clone)]
pub struct DeadMessage {
    message: Arc<Payload>,
    delivery: Delivery,
}

impl DeadMessage {
    pub(crate) fn new(message: Arc<Payload>, delivery: Delivery) -> Self {
        Self { message, delivery }
    }

    /// The original message, if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.message.downcast_ref::<T>()
    }

    /// Whether the original message is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.message.is::<T>()
    }

    /// Concrete type of the original message.
    pub fn message_type(&self) -> MessageType {
        self.delivery.message_type
    }

    /// When the original publish was attempted.
    pub fn published_at(&self) -> Timestamp {
        self.delivery.published_at
    }

    pub fn sequence(&self) -> Sequence {
        self.delivery.sequence
    }

    /// Delivery metadata of the original publication.
    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }
}

impl fmt::Debug for DeadMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadMessage")
            .field("message_type", &self.delivery.message_type)
            .field("sequence", &self.delivery.sequence)
            .field("published_at", &self.delivery.published_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PublishMode;

    #[test]
    fn test_dead_message_accessors() {
        let delivery = Delivery {
            message_type: MessageType::of::<String>(),
            sequence: Sequence(7),
            published_at: Timestamp(42),
            mode: PublishMode::Sync,
        };
        let dead = DeadMessage::new(Arc::new(String::from("lost")), delivery);

        assert!(dead.is::<String>());
        assert!(!dead.is::<u32>());
        assert_eq!(dead.downcast_ref::<String>().map(String::as_str), Some("lost"));
        assert_eq!(dead.message_type(), MessageType::of::<String>());
        assert_eq!(dead.sequence(), Sequence(7));
        assert_eq!(dead.published_at(), Timestamp(42));
    }
}
