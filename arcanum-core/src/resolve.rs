//! Symbol and scope resolution
//!
//! Every `Name` in the tree is annotated with the binding it refers to, or
//! left as `None` for globals. Scopes live in an arena and point at their
//! parent by index, so the chain is a tree walked upwards.
//!
//! Passes that synthesize code with fresh names simply resolve again; names
//! produced by [`crate::rng::NameGen`] never collide, so re-resolution is
//! stable.

use std::collections::BTreeSet;

use crate::lua::ast::*;

pub type ScopeId = usize;
pub type FunctionId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Local,
    Param,
    LocalFunction,
    ForVar,
}

#[derive(Debug, Clone)]
pub struct BindingInfo {
    pub ident: String,
    pub kind: BindingKind,
    pub scope: ScopeId,
    pub function: FunctionId,
    /// Declaration order within the owning function
    pub slot: u16,
    /// Referenced from a nested function
    pub captured: bool,
    pub reads: usize,
    pub writes: usize,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub function: FunctionId,
    pub names: Vec<(String, BindingId)>,
}

/// How one identifier occurrence is reached at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Local { binding: BindingId, slot: u16 },
    Upvalue { binding: BindingId, depth: u32 },
    Global,
}

#[derive(Debug, Clone, Default)]
pub struct ScopeTree {
    pub scopes: Vec<Scope>,
    pub bindings: Vec<BindingInfo>,
    /// Parent of each function; the main chunk is function 0
    pub function_parents: Vec<Option<FunctionId>>,
    pub globals_read: BTreeSet<String>,
    pub globals_written: BTreeSet<String>,
}

impl ScopeTree {
    pub fn binding(&self, id: BindingId) -> Option<&BindingInfo> {
        self.bindings.get(id as usize)
    }

    /// Classify a resolved name as seen from code inside `from`
    pub fn resolution(&self, name: &Name, from: FunctionId) -> Resolution {
        let Some(info) = name.binding.and_then(|id| self.binding(id)) else {
            return Resolution::Global;
        };
        let binding = name.binding.unwrap_or_default();
        if info.function == from {
            return Resolution::Local {
                binding,
                slot: info.slot,
            };
        }
        let mut depth = 0;
        let mut current = Some(from);
        while let Some(function) = current {
            if function == info.function {
                break;
            }
            depth += 1;
            current = self.function_parents.get(function as usize).copied().flatten();
        }
        Resolution::Upvalue { binding, depth }
    }

    /// Whether any source code touches a global by this name
    pub fn mentions_global(&self, ident: &str) -> bool {
        self.globals_read.contains(ident) || self.globals_written.contains(ident)
    }
}

/// Annotate every name of the chunk and return the scope tree
pub fn resolve(chunk: &mut Chunk) -> ScopeTree {
    let mut resolver = Resolver {
        tree: ScopeTree::default(),
        current: 0,
        function: 0,
        next_slot: vec![0],
    };
    resolver.tree.scopes.push(Scope {
        parent: None,
        function: 0,
        names: Vec::new(),
    });
    resolver.tree.function_parents.push(None);
    resolver.block(&mut chunk.block);
    resolver.tree
}

struct Resolver {
    tree: ScopeTree,
    current: ScopeId,
    function: FunctionId,
    next_slot: Vec<u16>,
}

impl Resolver {
    fn push_scope(&mut self) {
        let id = self.tree.scopes.len();
        self.tree.scopes.push(Scope {
            parent: Some(self.current),
            function: self.function,
            names: Vec::new(),
        });
        self.current = id;
    }

    fn pop_scope(&mut self) {
        self.current = self.tree.scopes[self.current].parent.unwrap_or(0);
    }

    fn declare(&mut self, name: &mut Name, kind: BindingKind) {
        let id = self.tree.bindings.len() as BindingId;
        let slot_counter = &mut self.next_slot[self.function as usize];
        let slot = *slot_counter;
        *slot_counter = slot_counter.saturating_add(1);
        self.tree.bindings.push(BindingInfo {
            ident: name.ident.clone(),
            kind,
            scope: self.current,
            function: self.function,
            slot,
            captured: false,
            reads: 0,
            writes: 0,
        });
        self.tree.scopes[self.current]
            .names
            .push((name.ident.clone(), id));
        name.binding = Some(id);
    }

    fn find(&self, ident: &str) -> Option<BindingId> {
        let mut scope = Some(self.current);
        while let Some(id) = scope {
            let data = &self.tree.scopes[id];
            if let Some((_, binding)) = data.names.iter().rev().find(|(n, _)| n == ident) {
                return Some(*binding);
            }
            scope = data.parent;
        }
        None
    }

    fn reference(&mut self, name: &mut Name, read: bool, write: bool) {
        name.binding = self.find(&name.ident);
        match name.binding {
            Some(id) => {
                let function = self.function;
                let info = &mut self.tree.bindings[id as usize];
                if info.function != function {
                    info.captured = true;
                }
                if read {
                    info.reads += 1;
                }
                if write {
                    info.writes += 1;
                }
            }
            None => {
                if read {
                    self.tree.globals_read.insert(name.ident.clone());
                }
                if write {
                    self.tree.globals_written.insert(name.ident.clone());
                }
            }
        }
    }

    fn block(&mut self, block: &mut Block) {
        for stmt in &mut block.stmts {
            self.stmt(stmt);
        }
    }

    fn scoped_block(&mut self, block: &mut Block) {
        self.push_scope();
        self.block(block);
        self.pop_scope();
    }

    fn target(&mut self, target: &mut Expr, read: bool) {
        match target {
            Expr::Name(name) => self.reference(name, read, true),
            other => self.expr(other),
        }
    }

    fn stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::Local { names, exprs } => {
                for expr in exprs {
                    self.expr(expr);
                }
                for name in names {
                    self.declare(name, BindingKind::Local);
                }
            }
            Stmt::LocalFunction { name, func } => {
                self.declare(name, BindingKind::LocalFunction);
                self.function(func);
            }
            Stmt::Assign { targets, exprs } => {
                for expr in exprs {
                    self.expr(expr);
                }
                for target in targets {
                    self.target(target, false);
                }
            }
            Stmt::CompoundAssign { target, value, .. } => {
                self.target(target, true);
                self.expr(value);
            }
            Stmt::Call(call) => self.expr(call),
            Stmt::Do(body) => self.scoped_block(body),
            Stmt::While { cond, body } => {
                self.expr(cond);
                self.scoped_block(body);
            }
            Stmt::Repeat { body, cond } => {
                // The condition sees the body's locals
                self.push_scope();
                self.block(body);
                self.expr(cond);
                self.pop_scope();
            }
            Stmt::If {
                clauses,
                else_block,
            } => {
                for clause in clauses {
                    self.expr(&mut clause.cond);
                    self.scoped_block(&mut clause.body);
                }
                if let Some(body) = else_block {
                    self.scoped_block(body);
                }
            }
            Stmt::NumericFor {
                var,
                start,
                limit,
                step,
                body,
            } => {
                self.expr(start);
                self.expr(limit);
                if let Some(step) = step {
                    self.expr(step);
                }
                self.push_scope();
                self.declare(var, BindingKind::ForVar);
                self.scoped_block(body);
                self.pop_scope();
            }
            Stmt::GenericFor { names, exprs, body } => {
                for expr in exprs {
                    self.expr(expr);
                }
                self.push_scope();
                for name in names {
                    self.declare(name, BindingKind::ForVar);
                }
                self.scoped_block(body);
                self.pop_scope();
            }
            Stmt::Return(exprs) => {
                for expr in exprs {
                    self.expr(expr);
                }
            }
            Stmt::Break | Stmt::Continue => {}
        }
    }

    fn function(&mut self, func: &mut FunctionBody) {
        let outer_function = self.function;
        let outer_scope = self.current;
        let id = self.tree.function_parents.len() as FunctionId;
        self.tree.function_parents.push(Some(outer_function));
        self.next_slot.push(0);
        self.function = id;
        self.push_scope();
        for param in &mut func.params {
            self.declare(param, BindingKind::Param);
        }
        self.block(&mut func.body);
        self.function = outer_function;
        self.current = outer_scope;
    }

    fn expr(&mut self, expr: &mut Expr) {
        match expr {
            Expr::Name(name) => self.reference(name, true, false),
            Expr::Function(func) => self.function(func),
            _ => {
                // Every other expression only nests further expressions
                struct Children<'a>(&'a mut Resolver);
                impl VisitMut for Children<'_> {
                    fn visit_expr(&mut self, expr: &mut Expr) {
                        self.0.expr(expr);
                    }
                }
                walk_expr_mut(&mut Children(self), expr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua::parse;

    fn first_local_names(chunk: &Chunk) -> Vec<Option<BindingId>> {
        let mut out = Vec::new();
        struct Names<'a>(&'a mut Vec<Option<BindingId>>);
        impl Visit for Names<'_> {
            fn visit_name(&mut self, name: &Name) {
                if name.ident == "x" {
                    self.0.push(name.binding);
                }
            }
        }
        Names(&mut out).visit_block(&chunk.block);
        out
    }

    #[test]
    fn test_shadowing_creates_distinct_bindings() {
        let mut chunk = parse("local x = 1 local x = x + 1 print(x)").unwrap();
        resolve(&mut chunk);
        let ids = first_local_names(&chunk);
        // declaration, read in initializer, second declaration, final read
        assert_eq!(ids, vec![Some(0), Some(0), Some(1), Some(1)]);
    }

    #[test]
    fn test_globals_are_unbound() {
        let mut chunk = parse("x = 1 print(x)").unwrap();
        let tree = resolve(&mut chunk);
        assert!(first_local_names(&chunk).iter().all(Option::is_none));
        assert!(tree.globals_written.contains("x"));
        assert!(tree.globals_read.contains("print"));
    }

    #[test]
    fn test_upvalue_capture() {
        let mut chunk = parse("local x = 0 local function inc() x = x + 1 end").unwrap();
        let tree = resolve(&mut chunk);
        let info = tree.binding(0).unwrap();
        assert_eq!(info.ident, "x");
        assert!(info.captured);
        assert_eq!(info.writes, 1);
        let func = tree.binding(1).unwrap();
        assert!(!func.captured);
    }

    #[test]
    fn test_upvalue_depth() {
        let mut chunk = parse("local x = 0 local f = function() return function() return x end end").unwrap();
        let tree = resolve(&mut chunk);
        let name = Name {
            ident: "x".into(),
            binding: Some(0),
        };
        assert_eq!(
            tree.resolution(&name, 0),
            Resolution::Local {
                binding: 0,
                slot: 0
            }
        );
        assert_eq!(tree.resolution(&name, 2), Resolution::Upvalue { binding: 0, depth: 2 });
    }

    #[test]
    fn test_repeat_condition_sees_body_locals() {
        let mut chunk = parse("repeat local x = 1 until x == 1").unwrap();
        let tree = resolve(&mut chunk);
        assert_eq!(first_local_names(&chunk), vec![Some(0), Some(0)]);
        assert!(tree.globals_read.is_empty());
    }

    #[test]
    fn test_local_initializer_sees_outer_binding() {
        let mut chunk = parse("local x = x").unwrap();
        let tree = resolve(&mut chunk);
        // the read happens before the declaration
        assert_eq!(first_local_names(&chunk), vec![None, Some(0)]);
        assert!(tree.globals_read.contains("x"));
    }
}
