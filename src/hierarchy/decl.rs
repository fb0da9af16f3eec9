//! Declarations of supertypes and interfaces for message types.

use super::view::{typed, ErasedView};
use crate::types::MessageType;
use std::marker::PhantomData;
use std::sync::Arc;

type Lift = dyn Fn(&ErasedView) -> Option<ErasedView> + Send + Sync;

/// One declared supertype relation, `source -> target`.
///
/// Lifting turns a view of the source into a view of the target, so
/// projections compose along the closure.
#[derive(Clone)]
pub(crate) struct Edge {
    pub(crate) target: MessageType,
    lift: Arc<Lift>,
}

impl Edge {
    fn new<C: ?Sized + 'static, T: ?Sized + 'static>(cast: fn(&C) -> &T) -> Self {
        Self {
            target: MessageType::of::<T>(),
            lift: Arc::new(move |view: &ErasedView| {
                typed::<C>(view).map(|source| source.then(cast).erase())
            }),
        }
    }

    pub(crate) fn lift(&self, view: &ErasedView) -> Option<ErasedView> {
        (self.lift)(view)
    }
}

/// Declares where `C` sits in the message type hierarchy.
///
/// Rust has no runtime class hierarchy, so ancestry is declared up front.
/// Every relation carries a projection, which is how a handler bound to a
/// supertype receives a typed reference to a subtype's message.
///
/// # Example
///
/// ```ignore
/// struct Number { value: i64 }
/// struct Integer { number: Number }
/// trait Comparable { fn key(&self) -> i64; }
///
/// bus.declare(
///     TypeDecl::<Integer>::new()
///         .extends::<Number>(|i| &i.number)
///         .implements::<dyn Comparable>(|i| i),
/// )?;
/// ```
pub struct TypeDecl<C: ?Sized + 'static> {
    pub(crate) ty: MessageType,
    pub(crate) parent: Option<Edge>,
    pub(crate) interfaces: Vec<Edge>,
    pub(crate) problems: Vec<String>,
    _marker: PhantomData<fn(&C)>,
}

impl<C: ?Sized + 'static> TypeDecl<C> {
    pub fn new() -> Self {
        Self {
            ty: MessageType::of::<C>(),
            parent: None,
            interfaces: Vec::new(),
            problems: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Declares the single ancestor type of `C`.
    pub fn extends<P: ?Sized + 'static>(mut self, cast: fn(&C) -> &P) -> Self {
        let edge = Edge::new(cast);
        if edge.target == self.ty {
            self.problems.push("a type cannot extend itself".to_string());
        } else if let Some(existing) = &self.parent {
            self.problems.push(format!(
                "already extends {}, cannot also extend {}",
                existing.target, edge.target
            ));
        } else {
            self.parent = Some(edge);
        }
        self
    }

    /// Declares an interface implemented by `C`.
    ///
    /// For an interface type (`dyn I`) this lists its super-interfaces.
    pub fn implements<I: ?Sized + 'static>(mut self, cast: fn(&C) -> &I) -> Self {
        let edge = Edge::new(cast);
        if edge.target == self.ty {
            self.problems.push("a type cannot implement itself".to_string());
        } else if self.interfaces.iter().any(|i| i.target == edge.target) {
            self.problems
                .push(format!("interface {} declared twice", edge.target));
        } else {
            self.interfaces.push(edge);
        }
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.ty
    }
}

impl<C: ?Sized + 'static> Default for TypeDecl<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Base;
    struct Derived {
        base: Base,
    }
    struct Other;
    trait Marker {}
    impl Marker for Derived {}

    #[test]
    fn test_valid_declaration() {
        let decl = TypeDecl::<Derived>::new()
            .extends::<Base>(|d| &d.base)
            .implements::<dyn Marker>(|d| d);

        assert!(decl.problems.is_empty());
        assert_eq!(decl.parent.as_ref().unwrap().target, MessageType::of::<Base>());
        assert_eq!(decl.interfaces.len(), 1);
    }

    #[test]
    fn test_second_parent_is_a_problem() {
        static OTHER: Other = Other;
        let decl = TypeDecl::<Derived>::new()
            .extends::<Base>(|d| &d.base)
            .extends::<Other>(|_| &OTHER);

        assert_eq!(decl.problems.len(), 1);
        assert!(decl.problems[0].contains("already extends"));
    }

    #[test]
    fn test_self_extension_is_a_problem() {
        let decl = TypeDecl::<Base>::new().extends::<Base>(|b| b);
        assert_eq!(decl.problems.len(), 1);
    }
}
