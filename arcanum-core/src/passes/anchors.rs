//! State anchors and ghost cycles
//!
//! Each function body gets a hidden state variable advanced by a linear
//! congruential step between its statements. Real statements are wrapped in
//! `if A == v then ... end` checks against the value the variable must hold
//! at that point, which the pass computes ahead of time. Ghost cycles are
//! short counted loops whose result is folded into the same state.
//!
//! The modulus stays below 2^26 so every product is exact in a double.

use crate::lua::ast::*;

use super::junk::inert_stmt;
use super::PassContext;

const MODULUS_MIN: i64 = 1 << 20;
const MODULUS_MAX: i64 = (1 << 26) - 1;

/// Chance, in percent, that an eligible statement is wrapped in a check
const GUARD_PERCENT: u32 = 60;
/// Chance, in percent, of a ghost cycle after a statement
const GHOST_PERCENT: u32 = 25;

#[derive(Default)]
struct Counters {
    functions: usize,
    guarded: usize,
    ghosts: usize,
}

pub fn apply(chunk: &mut Chunk, ctx: &mut PassContext) -> String {
    let mut anchor = Anchor {
        ctx,
        counters: Counters::default(),
    };
    anchor.visit_block(&mut chunk.block);
    anchor.body(&mut chunk.block);
    let c = anchor.counters;
    format!(
        "anchored {} function bodies, guarded {} statements, {} ghost cycles",
        c.functions, c.guarded, c.ghosts
    )
}

struct Anchor<'a> {
    ctx: &'a mut PassContext,
    counters: Counters,
}

/// Statements that can move under an `if` without changing scoping
fn wrappable(stmt: &Stmt) -> bool {
    !matches!(
        stmt,
        Stmt::Local { .. } | Stmt::LocalFunction { .. } | Stmt::Return(_) | Stmt::Break | Stmt::Continue
    )
}

fn num(n: i64) -> Expr {
    Expr::Number(n as f64)
}

/// `(x * a + b) % m`
fn lcg(x: Expr, a: i64, b: i64, m: i64) -> Expr {
    Expr::binary(
        BinOp::Mod,
        Expr::binary(BinOp::Add, Expr::binary(BinOp::Mul, x, num(a)), num(b)),
        num(m),
    )
}

impl Anchor<'_> {
    fn body(&mut self, block: &mut Block) {
        if block.stmts.is_empty() || block.synthetic {
            return;
        }
        let anchors = self.ctx.settings.state_anchors;
        let ghosts = self.ctx.settings.ghost_cycles;
        let rng = &mut self.ctx.rng;
        let m = rng.range(MODULUS_MIN, MODULUS_MAX);
        let a = rng.odd_below(m);
        let b = rng.range(0, m - 1);
        let mut value = rng.range(0, m - 1);
        let state = self.ctx.names.fresh();

        let limit = block.insertion_limit();
        let original = std::mem::take(&mut block.stmts);
        let mut out = Vec::with_capacity(original.len() * 2 + 1);
        if anchors {
            out.push(Stmt::Local {
                names: vec![Name::new(state.clone())],
                exprs: vec![num(value)],
            });
            self.counters.functions += 1;
        }

        for (i, stmt) in original.into_iter().enumerate() {
            if i >= limit {
                out.push(stmt);
                continue;
            }
            if anchors
                && wrappable(&stmt)
                && !stmt.is_synthetic()
                && self.ctx.rng.chance(GUARD_PERCENT)
            {
                let decoy = inert_stmt(&mut self.ctx.rng, &mut self.ctx.names);
                out.push(Stmt::If {
                    clauses: vec![IfClause {
                        cond: Expr::binary(BinOp::Eq, Expr::name(state.clone()), num(value)),
                        body: Block::new(vec![stmt]),
                    }],
                    else_block: Some(Block::synthetic(vec![decoy])),
                });
                self.counters.guarded += 1;
            } else {
                out.push(stmt);
            }
            if anchors {
                out.push(Stmt::Assign {
                    targets: vec![Expr::name(state.clone())],
                    exprs: vec![lcg(Expr::name(state.clone()), a, b, m)],
                });
                value = (value * a + b) % m;
            }
            if ghosts && self.ctx.rng.chance(GHOST_PERCENT) {
                let (stmt, folded) = self.ghost_cycle(anchors.then_some(state.as_str()), m);
                out.push(stmt);
                value = (value + folded) % m;
                self.counters.ghosts += 1;
            }
        }
        block.stmts = out;
    }

    /// A counted loop over a private accumulator, optionally folded into the
    /// anchor state. Returns the statement and the folded amount.
    fn ghost_cycle(&mut self, state: Option<&str>, m: i64) -> (Stmt, i64) {
        let rng = &mut self.ctx.rng;
        let c = rng.odd_below(m);
        let d = rng.range(1, m - 1);
        let rounds = rng.range(2, 8);
        let mut g = rng.range(0, m - 1);
        let acc = self.ctx.names.fresh();
        let counter = self.ctx.names.fresh();

        let mut stmts = vec![
            Stmt::Local {
                names: vec![Name::new(acc.clone())],
                exprs: vec![num(g)],
            },
            Stmt::NumericFor {
                var: Name::new(counter),
                start: num(1),
                limit: num(rounds),
                step: None,
                body: Block::synthetic(vec![Stmt::Assign {
                    targets: vec![Expr::name(acc.clone())],
                    exprs: vec![lcg(Expr::name(acc.clone()), c, d, m)],
                }]),
            },
        ];
        for _ in 0..rounds {
            g = (g * c + d) % m;
        }
        let folded = match state {
            Some(state) => {
                stmts.push(Stmt::Assign {
                    targets: vec![Expr::name(state)],
                    exprs: vec![Expr::binary(
                        BinOp::Mod,
                        Expr::binary(BinOp::Add, Expr::name(state), Expr::name(acc)),
                        num(m),
                    )],
                });
                g
            }
            None => 0,
        };
        (Stmt::Do(Block::synthetic(stmts)), folded)
    }
}

impl VisitMut for Anchor<'_> {
    fn visit_function(&mut self, func: &mut FunctionBody) {
        walk_function_mut(self, func);
        self.body(&mut func.body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::lua::parse;
    use crate::lua::printer::print_chunk;
    use crate::passes::test_support::context_for;

    #[test]
    fn test_anchor_guards_every_function() {
        let settings = Settings {
            state_anchors: true,
            ..Settings::all_disabled()
        };
        let source = "local function f(x) print(x) print(x) return x end f(1) f(2)";
        let (mut chunk, mut ctx) = context_for(source, settings);
        let summary = apply(&mut chunk, &mut ctx);
        assert!(summary.starts_with("anchored 2 function bodies"));
        assert!(summary.ends_with("0 ghost cycles"));
        assert!(matches!(chunk.block.stmts[0], Stmt::Local { .. }));
        parse(&print_chunk(&chunk)).unwrap();
    }

    #[test]
    fn test_ghost_cycles_without_anchors_are_standalone() {
        let settings = Settings {
            ghost_cycles: true,
            ..Settings::all_disabled()
        };
        let source = (0..40).map(|i| format!("print({})\n", i)).collect::<String>();
        let (mut chunk, mut ctx) = context_for(&source, settings);
        let summary = apply(&mut chunk, &mut ctx);
        assert!(summary.starts_with("anchored 0 function bodies, guarded 0 statements"));
        assert!(!summary.ends_with(" 0 ghost cycles"));
        // ghost loops only ever write their own accumulator
        for stmt in &chunk.block.stmts {
            if let Stmt::Do(block) = stmt {
                assert_eq!(block.stmts.len(), 2);
            }
        }
    }
}
