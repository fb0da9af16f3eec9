//! Resolution of a concrete type into its ordered supertype closure.

use super::decl::{Edge, TypeDecl};
use super::view::{ErasedView, View};
use crate::error::{BusError, Result};
use crate::types::MessageType;
use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Which declared supertypes take part in matching.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Only handlers declared for the exact runtime type.
    Exact,
    /// Handlers for the runtime type and every declared ancestor and interface.
    #[default]
    ExactWithSuperTypes,
}

/// Stored form of a [`TypeDecl`].
struct Declaration {
    parent: Option<Edge>,
    interfaces: Vec<Edge>,
}

/// One member of a closure, with the projection that reaches it.
#[derive(Clone)]
pub(crate) struct ClosureEntry {
    pub(crate) ty: MessageType,
    pub(crate) view: ErasedView,
}

/// Ordered, de-duplicated set of types a concrete message satisfies,
/// most-derived first.
pub struct TypeClosure {
    concrete: MessageType,
    entries: Vec<ClosureEntry>,
}

impl TypeClosure {
    /// The runtime type this closure was built for.
    pub fn concrete(&self) -> MessageType {
        self.concrete
    }

    /// Types in closure order.
    pub fn types(&self) -> impl Iterator<Item = MessageType> + '_ {
        self.entries.iter().map(|e| e.ty)
    }

    pub fn contains(&self, ty: MessageType) -> bool {
        self.entries.iter().any(|e| e.ty == ty)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entries(&self) -> &[ClosureEntry] {
        &self.entries
    }
}

/// Resolves concrete message types into their supertype closures.
///
/// Declarations are rare and closures are cached until the next
/// declaration. The cache is only written while holding the declarations
/// lock, so a closure built from old declarations can never be stored
/// after a newer declaration cleared the cache.
pub struct TypeHierarchy {
    mode: DispatchMode,
    declarations: RwLock<HashMap<TypeId, Declaration>>,
    closures: RwLock<HashMap<TypeId, Arc<TypeClosure>>>,
}

impl TypeHierarchy {
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            mode,
            declarations: RwLock::new(HashMap::new()),
            closures: RwLock::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Register the supertypes of `C`.
    pub fn declare<C: ?Sized + 'static>(&self, decl: TypeDecl<C>) -> Result<()> {
        let TypeDecl {
            ty,
            parent,
            interfaces,
            problems,
            ..
        } = decl;

        if let Some(reason) = problems.into_iter().next() {
            return Err(BusError::InvalidTypeDeclaration {
                ty: ty.name(),
                reason,
            });
        }

        let mut declarations = self.declarations.write();
        if declarations.contains_key(&ty.id()) {
            return Err(BusError::InvalidTypeDeclaration {
                ty: ty.name(),
                reason: "type is already declared".to_string(),
            });
        }

        tracing::debug!(
            ty = ty.name(),
            parent = parent.as_ref().map(|p| p.target.name()),
            interfaces = interfaces.len(),
            "declared message type"
        );

        declarations.insert(ty.id(), Declaration { parent, interfaces });
        self.closures.write().clear();
        Ok(())
    }

    /// Whether `ty` has a declaration.
    pub fn is_declared(&self, ty: MessageType) -> bool {
        self.declarations.read().contains_key(&ty.id())
    }

    /// Closure of the concrete type `M`, built on first use.
    pub fn closure_of<M: Send + Sync + 'static>(&self) -> Arc<TypeClosure> {
        let id = TypeId::of::<M>();
        if let Some(closure) = self.closures.read().get(&id) {
            return Arc::clone(closure);
        }

        let declarations = self.declarations.read();
        let closure = Arc::new(self.build(
            &declarations,
            MessageType::of::<M>(),
            View::<M>::identity().erase(),
        ));

        self.closures
            .write()
            .entry(id)
            .or_insert_with(|| Arc::clone(&closure))
            .clone()
    }

    fn build(
        &self,
        declarations: &HashMap<TypeId, Declaration>,
        concrete: MessageType,
        identity: ErasedView,
    ) -> TypeClosure {
        let mut entries = vec![ClosureEntry {
            ty: concrete,
            view: identity,
        }];

        if self.mode == DispatchMode::Exact {
            return TypeClosure { concrete, entries };
        }

        let mut seen = HashSet::from([concrete]);

        // Ancestor chain first.
        let mut chain = 1;
        loop {
            let current = entries[entries.len() - 1].clone();
            let Some(edge) = declarations
                .get(&current.ty.id())
                .and_then(|d| d.parent.as_ref())
            else {
                break;
            };
            if !seen.insert(edge.target) {
                tracing::warn!(
                    ty = current.ty.name(),
                    parent = edge.target.name(),
                    "cycle in declared ancestry"
                );
                break;
            }
            let Some(view) = edge.lift(&current.view) else {
                break;
            };
            entries.push(ClosureEntry {
                ty: edge.target,
                view,
            });
            chain += 1;
        }

        // Then interfaces of each class, depth-first.
        for index in 0..chain {
            let class = entries[index].clone();
            collect_interfaces(declarations, &class, &mut seen, &mut entries);
        }

        tracing::trace!(
            ty = concrete.name(),
            closure = entries.len(),
            "resolved type closure"
        );

        TypeClosure { concrete, entries }
    }
}

fn collect_interfaces(
    declarations: &HashMap<TypeId, Declaration>,
    from: &ClosureEntry,
    seen: &mut HashSet<MessageType>,
    entries: &mut Vec<ClosureEntry>,
) {
    let Some(declaration) = declarations.get(&from.ty.id()) else {
        return;
    };

    for edge in &declaration.interfaces {
        if !seen.insert(edge.target) {
            continue;
        }
        let Some(view) = edge.lift(&from.view) else {
            continue;
        };
        let entry = ClosureEntry {
            ty: edge.target,
            view,
        };
        entries.push(entry.clone());
        collect_interfaces(declarations, &entry, seen, entries);
    }
}

impl Default for TypeHierarchy {
    fn default() -> Self {
        Self::new(DispatchMode::default())
    }
}
