//! Scope stack and symbol table for semantic analysis.
//!
//! Scopes are a plain stack; lookup walks from innermost outward. The
//! `unsafe` flag is a boolean on the scope, inherited by inner scopes via
//! the walk in [`ScopeStack::in_unsafe`].

use crate::types::TypeRef;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Var,
    Function,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub name: String,
    pub ty: TypeRef,
    pub scope_depth: usize,
    pub is_const: bool,
    /// For const bindings: whether the single allowed write happened.
    pub initialized: bool,
}

struct Scope {
    symbols: HashMap<String, Symbol>,
    is_unsafe: bool,
}

pub struct ScopeStack {
    scopes: Vec<Scope>,
}

impl ScopeStack {
    pub fn new() -> Self {
        ScopeStack { scopes: Vec::new() }
    }

    /// Current depth; the global scope is depth 0.
    pub fn depth(&self) -> usize {
        self.scopes.len().saturating_sub(1)
    }

    pub fn push(&mut self) {
        self.push_with_unsafe(false);
    }

    pub fn push_with_unsafe(&mut self, is_unsafe: bool) {
        self.scopes.push(Scope {
            symbols: HashMap::new(),
            is_unsafe,
        });
    }

    pub fn pop(&mut self) {
        self.scopes.pop();
    }

    /// True when any enclosing scope is an `unsafe` block.
    pub fn in_unsafe(&self) -> bool {
        self.scopes.iter().any(|s| s.is_unsafe)
    }

    /// Declares a symbol in the innermost scope. Returns the shadowed
    /// symbol of the *same* scope if there was one (a redefinition).
    pub fn declare(&mut self, symbol: Symbol) -> Option<Symbol> {
        let scope = self
            .scopes
            .last_mut()
            .expect("declare requires an open scope");
        scope.symbols.insert(symbol.name.clone(), symbol)
    }

    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.symbols.get(name))
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut Symbol> {
        self.scopes
            .iter_mut()
            .rev()
            .find_map(|s| s.symbols.get_mut(name))
    }

    /// True when `name` is declared in the innermost scope itself.
    pub fn declared_here(&self, name: &str) -> bool {
        self.scopes
            .last()
            .is_some_and(|s| s.symbols.contains_key(name))
    }
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

/// A live borrow of a named binding, recorded at the scope depth where the
/// reference was created. Records are pruned on scope pop; flow-sensitive
/// refinement is deliberately out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Borrow {
    pub mutable: bool,
    pub scope_depth: usize,
}

/// Per-target borrow records keyed by binding name.
#[derive(Debug, Default)]
pub struct BorrowSet {
    records: HashMap<String, Vec<Borrow>>,
}

impl BorrowSet {
    pub fn new() -> Self {
        BorrowSet {
            records: HashMap::new(),
        }
    }

    /// Records a borrow and reports whether it conflicts with an existing
    /// one: a new mutable borrow conflicts with any other borrow at the
    /// same or inner depth; a new immutable borrow conflicts with a
    /// mutable one.
    pub fn add(&mut self, target: &str, borrow: Borrow) -> bool {
        let records = self.records.entry(target.to_string()).or_default();
        let conflict = records.iter().any(|existing| {
            if borrow.mutable {
                existing.scope_depth >= borrow.scope_depth
            } else {
                existing.mutable
            }
        });
        records.push(borrow);
        conflict
    }

    /// Drops every record created at `depth` or deeper.
    pub fn pop_scope(&mut self, depth: usize) {
        for records in self.records.values_mut() {
            records.retain(|b| b.scope_depth < depth);
        }
        self.records.retain(|_, v| !v.is_empty());
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    fn sym(name: &str, depth: usize) -> Symbol {
        Symbol {
            kind: SymbolKind::Var,
            name: name.to_string(),
            ty: Type::int32(),
            scope_depth: depth,
            is_const: false,
            initialized: true,
        }
    }

    #[test]
    fn test_lookup_walks_outward() {
        let mut scopes = ScopeStack::new();
        scopes.push();
        scopes.declare(sym("x", 0));
        scopes.push();
        scopes.declare(sym("y", 1));

        assert!(scopes.lookup("x").is_some());
        assert!(scopes.lookup("y").is_some());
        scopes.pop();
        assert!(scopes.lookup("y").is_none());
        assert!(scopes.lookup("x").is_some());
    }

    #[test]
    fn test_shadowing_is_per_scope() {
        let mut scopes = ScopeStack::new();
        scopes.push();
        scopes.declare(sym("x", 0));
        scopes.push();
        // Shadowing in an inner scope is not a redefinition.
        assert!(scopes.declare(sym("x", 1)).is_none());
        scopes.pop();
        // Same scope again: redefinition.
        assert!(scopes.declare(sym("x", 0)).is_some());
    }

    #[test]
    fn test_unsafe_inherited_by_inner_scopes() {
        let mut scopes = ScopeStack::new();
        scopes.push();
        assert!(!scopes.in_unsafe());
        scopes.push_with_unsafe(true);
        scopes.push();
        assert!(scopes.in_unsafe());
        scopes.pop();
        scopes.pop();
        assert!(!scopes.in_unsafe());
    }

    #[test]
    fn test_borrow_exclusivity() {
        let mut borrows = BorrowSet::new();
        // First mutable borrow is fine.
        assert!(!borrows.add("x", Borrow { mutable: true, scope_depth: 1 }));
        // Second mutable borrow of the same binding conflicts.
        assert!(borrows.add("x", Borrow { mutable: true, scope_depth: 1 }));
        // Immutable borrow while a mutable one lives also conflicts.
        assert!(borrows.add("x", Borrow { mutable: false, scope_depth: 1 }));
    }

    #[test]
    fn test_shared_borrows_allowed() {
        let mut borrows = BorrowSet::new();
        assert!(!borrows.add("x", Borrow { mutable: false, scope_depth: 1 }));
        assert!(!borrows.add("x", Borrow { mutable: false, scope_depth: 1 }));
    }

    #[test]
    fn test_pop_scope_prunes_records() {
        let mut borrows = BorrowSet::new();
        assert!(!borrows.add("x", Borrow { mutable: true, scope_depth: 2 }));
        borrows.pop_scope(2);
        // The old borrow is gone; a new one is conflict-free.
        assert!(!borrows.add("x", Borrow { mutable: true, scope_depth: 1 }));
    }
}
