//! Declared message type hierarchy.
//!
//! A published message matches handlers declared for its own type and for
//! every type in its closure:
//! - the ancestor chain declared with [`TypeDecl::extends`]
//! - interfaces (`dyn Trait` types) declared with [`TypeDecl::implements`],
//!   including interfaces of ancestors and super-interfaces
//!
//! Each relation carries a projection, so a handler for a supertype is
//! called with a typed reference rather than a type-erased value.

mod decl;
mod resolver;
pub(crate) mod view;

pub use decl::TypeDecl;
pub use resolver::{DispatchMode, TypeClosure, TypeHierarchy};
