//! Control-flow flattening
//!
//! A function body is rewritten into a single dispatch loop:
//!
//! ```lua
//! local st = ENTRY + R[1]
//! local h1, h2 --[[ hoisted locals ]]
//! while st ~= 0 do
//!     if st == 8812 then ...; st = 1204
//!     elseif st == 1204 then if cond then st = 77 else st = 0 end
//!     ...
//!     end
//! end
//! ```
//!
//! Straight-line statements are grouped into arms, `if` statements become
//! arms that pick the next state, and `while`/`repeat` loops become back
//! edges between states when their bodies neither exit the loop early nor
//! create closures. Locals declared along the way are hoisted to the top of
//! the body under fresh names, one per binding, so shadowed declarations
//! never collide.

use std::collections::{BTreeMap, BTreeSet};

use crate::lua::ast::*;
use crate::resolve::resolve;

use super::junk::inert_stmt;
use super::PassContext;

/// Bodies hoisting more locals than this are left structured
const MAX_HOISTED: usize = 150;
const STATE_LIMIT: i64 = 1 << 24;

pub fn apply(chunk: &mut Chunk, ctx: &mut PassContext) -> String {
    resolve(chunk);
    let mut flattener = Flattener {
        ctx,
        bodies: 0,
        states: 0,
    };
    flattener.body(&mut chunk.block, false);
    format!(
        "flattened {} bodies into {} dispatch states",
        flattener.bodies, flattener.states
    )
}

struct Flattener<'a> {
    ctx: &'a mut PassContext,
    bodies: usize,
    states: usize,
}

impl Flattener<'_> {
    /// Flatten a function or loop body if possible, then descend into
    /// whatever stayed nested inside it
    fn body(&mut self, block: &mut Block, is_loop: bool) {
        if block.synthetic {
            return;
        }
        if block.stmts.len() < 2 || (is_loop && has_loop_exit(block)) {
            walk_block_mut(self, block);
            return;
        }
        let mut hoisted = BTreeSet::new();
        count_hoisted(&block.stmts, &mut hoisted);
        if hoisted.len() > MAX_HOISTED {
            walk_block_mut(self, block);
            return;
        }
        let stmts = std::mem::take(&mut block.stmts);
        let mut machine = Machine {
            var: self.ctx.fresh(),
            ..Machine::default()
        };
        let entry = self.seq(&mut machine, stmts, 0);
        block.stmts = self.assemble(machine, entry);
        self.bodies += 1;
    }

    fn new_state(&mut self, machine: &mut Machine) -> i64 {
        loop {
            let state = self.ctx.rng.range(1, STATE_LIMIT - 1);
            if machine.used.insert(state) {
                self.states += 1;
                return state;
            }
        }
    }

    /// `st = target`, or a relative step from the current state
    fn jump(&self, machine: &Machine, from: i64, to: i64) -> Stmt {
        let st = Expr::name(machine.var.clone());
        let value = if self.ctx.settings.non_linear_pc {
            let delta = to - from;
            if delta < 0 {
                Expr::binary(BinOp::Sub, st.clone(), Expr::Number(-delta as f64))
            } else {
                Expr::binary(BinOp::Add, st.clone(), Expr::Number(delta as f64))
            }
        } else {
            Expr::Number(to as f64)
        };
        Stmt::Assign {
            targets: vec![st],
            exprs: vec![value],
        }
    }

    /// Compile a statement list that continues at `next`; returns its entry
    fn seq(&mut self, machine: &mut Machine, stmts: Vec<Stmt>, next: i64) -> i64 {
        let mut next = next;
        let mut pending: Vec<Stmt> = Vec::new();
        let mut group = self.ctx.rng.range(1, 3) as usize;

        for stmt in stmts.into_iter().rev() {
            match stmt {
                // engine-made code moves as a unit; flattening it only adds states
                stmt if stmt.is_synthetic() => pending.push(stmt),
                // a return closes its block, so nothing is pending yet
                Stmt::Return(mut exprs) => {
                    for expr in &mut exprs {
                        self.visit_expr(expr);
                    }
                    let state = self.new_state(machine);
                    machine.arms.insert(state, vec![Stmt::Return(exprs)]);
                    next = state;
                }
                Stmt::Do(body) => {
                    next = self.flush(machine, &mut pending, next);
                    next = self.seq(machine, body.stmts, next);
                }
                Stmt::If {
                    clauses,
                    else_block,
                } => {
                    next = self.flush(machine, &mut pending, next);
                    let state = self.new_state(machine);
                    let else_target = match else_block {
                        Some(body) => self.seq(machine, body.stmts, next),
                        None => next,
                    };
                    let mut arms = Vec::with_capacity(clauses.len());
                    for clause in clauses.into_iter().rev() {
                        let target = self.seq(machine, clause.body.stmts, next);
                        let mut cond = clause.cond;
                        self.visit_expr(&mut cond);
                        arms.push((cond, target));
                    }
                    arms.reverse();
                    let clauses = arms
                        .into_iter()
                        .map(|(cond, target)| IfClause {
                            cond,
                            body: Block::new(vec![self.jump(machine, state, target)]),
                        })
                        .collect();
                    let else_jump = self.jump(machine, state, else_target);
                    machine.arms.insert(
                        state,
                        vec![Stmt::If {
                            clauses,
                            else_block: Some(Block::new(vec![else_jump])),
                        }],
                    );
                    next = state;
                }
                Stmt::While { mut cond, body } if loop_flattenable(&body) => {
                    next = self.flush(machine, &mut pending, next);
                    let head = self.new_state(machine);
                    let entry = self.seq(machine, body.stmts, head);
                    self.visit_expr(&mut cond);
                    let arm = Stmt::If {
                        clauses: vec![IfClause {
                            cond,
                            body: Block::new(vec![self.jump(machine, head, entry)]),
                        }],
                        else_block: Some(Block::new(vec![self.jump(machine, head, next)])),
                    };
                    machine.arms.insert(head, vec![arm]);
                    next = head;
                }
                Stmt::Repeat { body, mut cond } if loop_flattenable(&body) => {
                    next = self.flush(machine, &mut pending, next);
                    let check = self.new_state(machine);
                    let entry = self.seq(machine, body.stmts, check);
                    self.visit_expr(&mut cond);
                    let arm = Stmt::If {
                        clauses: vec![IfClause {
                            cond,
                            body: Block::new(vec![self.jump(machine, check, next)]),
                        }],
                        else_block: Some(Block::new(vec![self.jump(machine, check, entry)])),
                    };
                    machine.arms.insert(check, vec![arm]);
                    next = entry;
                }
                Stmt::Local { names, mut exprs } => {
                    for expr in &mut exprs {
                        self.visit_expr(expr);
                    }
                    let targets = names.into_iter().map(|n| machine.hoist(n, self.ctx)).collect();
                    if exprs.is_empty() {
                        exprs.push(Expr::Nil);
                    }
                    pending.push(Stmt::Assign { targets, exprs });
                }
                Stmt::LocalFunction { name, mut func } => {
                    self.body(&mut func.body, false);
                    let target = machine.hoist(name, self.ctx);
                    pending.push(Stmt::Assign {
                        targets: vec![target],
                        exprs: vec![Expr::Function(Box::new(func))],
                    });
                }
                mut other => {
                    self.visit_stmt(&mut other);
                    pending.push(other);
                }
            }
            if pending.len() >= group {
                next = self.flush(machine, &mut pending, next);
                group = self.ctx.rng.range(1, 3) as usize;
            }
        }
        self.flush(machine, &mut pending, next)
    }

    /// Turn the pending statements (collected in reverse) into one arm
    fn flush(&mut self, machine: &mut Machine, pending: &mut Vec<Stmt>, next: i64) -> i64 {
        if pending.is_empty() {
            return next;
        }
        let state = self.new_state(machine);
        let mut body: Vec<Stmt> = pending.drain(..).rev().collect();
        body.push(self.jump(machine, state, next));
        machine.arms.insert(state, body);
        state
    }

    fn assemble(&mut self, mut machine: Machine, entry: i64) -> Vec<Stmt> {
        let var = machine.var.clone();
        let st = || Expr::name(var.clone());
        let real: Vec<i64> = machine.arms.keys().copied().collect();

        if self.ctx.settings.jump_logic && !real.is_empty() {
            for _ in 0..self.ctx.rng.range(1, 3) {
                let state = self.new_state(&mut machine);
                let target = real[self.ctx.rng.below(real.len())];
                let decoy = inert_stmt(&mut self.ctx.rng, &mut self.ctx.names);
                let jump = self.jump(&machine, state, target);
                machine.arms.insert(state, vec![decoy, jump]);
            }
        }

        let mut arms: Vec<(i64, Vec<Stmt>)> = std::mem::take(&mut machine.arms).into_iter().collect();
        let dispatch = if self.ctx.settings.jump_logic {
            search_tree(&var, &arms)
        } else {
            self.ctx.rng.shuffle(&mut arms);
            let clauses = arms
                .into_iter()
                .map(|(state, body)| IfClause {
                    cond: Expr::binary(BinOp::Eq, st(), Expr::Number(state as f64)),
                    body: Block::new(body),
                })
                .collect();
            Stmt::If {
                clauses,
                else_block: Some(Block::new(vec![halt(&var)])),
            }
        };

        let mut out = Vec::new();
        let control = self.ctx.runtime.control_read();
        out.push(Stmt::Local {
            names: vec![Name::new(var.clone())],
            exprs: vec![Expr::binary(BinOp::Add, Expr::Number(entry as f64), control)],
        });
        if !machine.hoisted.is_empty() {
            let names = machine.hoisted.iter().map(|n| Name::new(n.clone())).collect();
            out.push(Stmt::Local {
                names,
                exprs: Vec::new(),
            });
        }
        let mut body = Block::new(vec![dispatch]);
        Renamer(&machine.renames).visit_block(&mut body);
        out.push(Stmt::While {
            cond: Expr::binary(BinOp::Ne, st(), Expr::Number(0.0)),
            body,
        });
        out
    }
}

impl VisitMut for Flattener<'_> {
    fn visit_function(&mut self, func: &mut FunctionBody) {
        self.body(&mut func.body, false);
    }

    fn visit_stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::While { cond, body } => {
                self.visit_expr(cond);
                self.body(body, true);
            }
            Stmt::Repeat { body, cond } => {
                self.body(body, true);
                self.visit_expr(cond);
            }
            Stmt::NumericFor {
                start,
                limit,
                step,
                body,
                ..
            } => {
                self.visit_expr(start);
                self.visit_expr(limit);
                if let Some(step) = step {
                    self.visit_expr(step);
                }
                self.body(body, true);
            }
            Stmt::GenericFor { exprs, body, .. } => {
                for expr in exprs {
                    self.visit_expr(expr);
                }
                self.body(body, true);
            }
            _ => walk_stmt_mut(self, stmt),
        }
    }
}

#[derive(Default)]
struct Machine {
    var: String,
    arms: BTreeMap<i64, Vec<Stmt>>,
    used: BTreeSet<i64>,
    hoisted: Vec<String>,
    renames: BTreeMap<BindingId, String>,
}

impl Machine {
    /// Give a declared name a fresh hoisted identity; returns the new target
    fn hoist(&mut self, name: Name, ctx: &mut PassContext) -> Expr {
        let fresh = ctx.fresh();
        if let Some(binding) = name.binding {
            self.renames.insert(binding, fresh.clone());
        }
        self.hoisted.push(fresh.clone());
        Expr::Name(Name {
            ident: fresh,
            binding: name.binding,
        })
    }
}

fn loop_flattenable(body: &Block) -> bool {
    !has_loop_exit(body) && !contains_function(body)
}

/// Locals the flattener would hoist out of this statement list
fn count_hoisted(stmts: &[Stmt], out: &mut BTreeSet<BindingId>) {
    for stmt in stmts {
        match stmt {
            Stmt::Local { names, .. } => {
                out.extend(names.iter().filter_map(|n| n.binding));
            }
            Stmt::LocalFunction { name, .. } => out.extend(name.binding),
            Stmt::Do(body) => count_hoisted(&body.stmts, out),
            Stmt::If {
                clauses,
                else_block,
            } => {
                for clause in clauses {
                    count_hoisted(&clause.body.stmts, out);
                }
                if let Some(body) = else_block {
                    count_hoisted(&body.stmts, out);
                }
            }
            Stmt::While { body, .. } | Stmt::Repeat { body, .. } if loop_flattenable(body) => {
                count_hoisted(&body.stmts, out)
            }
            _ => {}
        }
    }
}

fn halt(var: &str) -> Stmt {
    Stmt::Assign {
        targets: vec![Expr::name(var)],
        exprs: vec![Expr::Number(0.0)],
    }
}

/// Binary-search dispatch over sorted states
fn search_tree(var: &str, arms: &[(i64, Vec<Stmt>)]) -> Stmt {
    if let [(state, body)] = arms {
        return Stmt::If {
            clauses: vec![IfClause {
                cond: Expr::binary(BinOp::Eq, Expr::name(var), Expr::Number(*state as f64)),
                body: Block::new(body.clone()),
            }],
            else_block: Some(Block::new(vec![halt(var)])),
        };
    }
    let mid = arms.len() / 2;
    let pivot = arms[mid].0;
    Stmt::If {
        clauses: vec![IfClause {
            cond: Expr::binary(BinOp::Lt, Expr::name(var), Expr::Number(pivot as f64)),
            body: Block::new(vec![search_tree(var, &arms[..mid])]),
        }],
        else_block: Some(Block::new(vec![search_tree(var, &arms[mid..])])),
    }
}

/// Apply hoisting renames to every reference, nested closures included
struct Renamer<'a>(&'a BTreeMap<BindingId, String>);

impl VisitMut for Renamer<'_> {
    fn visit_name(&mut self, name: &mut Name) {
        if let Some(fresh) = name.binding.and_then(|b| self.0.get(&b)) {
            name.ident = fresh.clone();
        }
    }
}
