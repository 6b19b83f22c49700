//! Scope management and frame slot allocation

use std::sync::Arc;

use kestrel_ir::Slot;
use rustc_hash::FxHashMap;

use crate::error::{CompileError, CompileResult};

/// A variable binding
#[derive(Debug, Clone)]
pub struct Binding {
    /// Frame slot holding the variable
    pub slot: Slot,
    /// Is this a const binding
    pub is_const: bool,
}

/// A lexical scope
#[derive(Debug, Default)]
pub struct Scope {
    /// Bindings in this scope
    pub bindings: FxHashMap<String, Binding>,
    /// Is this the function scope (`var` target)
    pub is_function: bool,
}

/// Allocates frame slots for parameters, locals and temporaries.
///
/// Slots are never reused: a temporary stays distinct for the whole
/// function, so a frame snapshot never has to reason about liveness.
#[derive(Debug, Default)]
pub struct SlotAllocator {
    names: Vec<Option<Arc<str>>>,
}

impl SlotAllocator {
    /// Create an empty allocator
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, name: Option<Arc<str>>) -> CompileResult<Slot> {
        let index = u16::try_from(self.names.len()).map_err(|_| CompileError::TooManySlots)?;
        self.names.push(name);
        Ok(Slot(index))
    }

    /// Allocate a named slot
    pub fn named(&mut self, name: &str) -> CompileResult<Slot> {
        self.push(Some(Arc::from(name)))
    }

    /// Allocate an anonymous temporary
    pub fn temp(&mut self) -> CompileResult<Slot> {
        self.push(None)
    }

    /// Whether `slot` is a compiler temporary
    pub fn is_temp(&self, slot: Slot) -> bool {
        self.names
            .get(slot.index())
            .is_some_and(|name| name.is_none())
    }

    /// Number of slots allocated so far
    pub fn len(&self) -> u16 {
        self.names.len() as u16
    }

    /// Whether no slot has been allocated
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Consume the allocator, returning the slot debug names
    pub fn into_names(self) -> Vec<Option<Arc<str>>> {
        self.names
    }
}

/// Scope chain for variable resolution within one function
#[derive(Debug, Default)]
pub struct ScopeChain {
    scopes: Vec<Scope>,
}

impl ScopeChain {
    /// Create a chain holding only the function scope
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope {
                bindings: FxHashMap::default(),
                is_function: true,
            }],
        }
    }

    /// Enter a block scope
    pub fn enter(&mut self) {
        self.scopes.push(Scope::default());
    }

    /// Exit the current block scope; the function scope is never popped
    pub fn exit(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Declare a block-scoped binding (`let`, `const`, catch parameter).
    ///
    /// Returns `None` on redeclaration within the same scope.
    pub fn declare(&mut self, name: &str, slot: Slot, is_const: bool) -> Option<Slot> {
        let scope = self.scopes.last_mut()?;
        if scope.bindings.contains_key(name) {
            return None;
        }
        scope
            .bindings
            .insert(name.to_string(), Binding { slot, is_const });
        Some(slot)
    }

    /// Look up an existing `var` binding in the function scope
    pub fn function_binding(&self, name: &str) -> Option<Slot> {
        self.scopes
            .iter()
            .find(|scope| scope.is_function)
            .and_then(|scope| scope.bindings.get(name))
            .map(|binding| binding.slot)
    }

    /// Declare a function-scoped binding (`var`, parameters)
    pub fn declare_var(&mut self, name: &str, slot: Slot) -> Slot {
        if let Some(existing) = self.function_binding(name) {
            return existing;
        }
        if let Some(scope) = self.scopes.iter_mut().find(|scope| scope.is_function) {
            scope.bindings.insert(
                name.to_string(),
                Binding {
                    slot,
                    is_const: false,
                },
            );
        }
        slot
    }

    /// Resolve a name, innermost scope first
    pub fn resolve(&self, name: &str) -> Option<&Binding> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.bindings.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_shadowing() {
        let mut slots = SlotAllocator::new();
        let mut chain = ScopeChain::new();
        let outer = slots.named("e").unwrap();
        chain.declare("e", outer, false);

        chain.enter();
        let inner = slots.named("e").unwrap();
        chain.declare("e", inner, false);
        assert_eq!(chain.resolve("e").unwrap().slot, inner);

        chain.exit();
        assert_eq!(chain.resolve("e").unwrap().slot, outer);
    }

    #[test]
    fn test_var_hoists_to_function_scope() {
        let mut slots = SlotAllocator::new();
        let mut chain = ScopeChain::new();
        chain.enter();
        let r = slots.named("r").unwrap();
        chain.declare_var("r", r);
        chain.exit();
        assert_eq!(chain.resolve("r").unwrap().slot, r);

        let again = slots.named("r").unwrap();
        assert_eq!(chain.declare_var("r", again), r);
    }

    #[test]
    fn test_redeclaration_rejected() {
        let mut slots = SlotAllocator::new();
        let mut chain = ScopeChain::new();
        let a = slots.named("a").unwrap();
        assert!(chain.declare("a", a, true).is_some());
        assert!(chain.declare("a", a, true).is_none());
    }

    #[test]
    fn test_temporaries_are_anonymous() {
        let mut slots = SlotAllocator::new();
        let named = slots.named("x").unwrap();
        let temp = slots.temp().unwrap();
        assert!(!slots.is_temp(named));
        assert!(slots.is_temp(temp));
        assert_eq!(slots.len(), 2);
    }
}
