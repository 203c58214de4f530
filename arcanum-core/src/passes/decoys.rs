//! Decoy traps, honeypot functions and decoy constants
//!
//! Everything added here is unreachable or unused: traps sit behind opaque
//! false predicates, honeypots are local functions nothing calls, decoy
//! constants are tables nothing reads.

use crate::lua::ast::*;

use super::junk::{dead_branch, inert_stmt, opaque_false, plausible_value};
use super::PassContext;

/// Chance, in percent, that a given block receives a trap
const TRAP_PERCENT: u32 = 35;

pub fn apply(chunk: &mut Chunk, ctx: &mut PassContext) -> String {
    let mut traps = 0;
    if ctx.settings.decoy_traps {
        let mut injector = TrapInjector { ctx, traps: 0 };
        injector.visit_block(&mut chunk.block);
        traps = injector.traps;
    }

    let mut top_level = Vec::new();
    let mut honeypots = 0;
    if ctx.settings.honey_pots {
        for _ in 0..ctx.rng.range(1, 3) {
            top_level.push(honeypot(ctx));
            honeypots += 1;
        }
    }
    let mut constants = 0;
    if ctx.settings.decoy_constants {
        for _ in 0..ctx.rng.range(1, 2) {
            top_level.push(decoy_table(ctx));
            constants += 1;
        }
    }
    for stmt in top_level {
        let at = ctx.rng.range(0, chunk.block.insertion_limit() as i64) as usize;
        chunk.block.stmts.insert(at, stmt);
    }

    format!(
        "planted {} traps, {} honeypots, {} decoy constant tables",
        traps, honeypots, constants
    )
}

struct TrapInjector<'a> {
    ctx: &'a mut PassContext,
    traps: usize,
}

impl VisitMut for TrapInjector<'_> {
    fn visit_block(&mut self, block: &mut Block) {
        walk_block_mut(self, block);
        if !self.ctx.rng.chance(TRAP_PERCENT) {
            return;
        }
        let ctx = &mut *self.ctx;
        let body = trap_body(ctx);
        let trap = dead_branch(&mut ctx.rng, &mut ctx.names, body);
        let at = ctx.rng.range(0, block.insertion_limit() as i64) as usize;
        block.stmts.insert(at, trap);
        self.traps += 1;
    }
}

/// Code that looks like an integrity check bailing out
fn trap_body(ctx: &mut PassContext) -> Vec<Stmt> {
    let flag = ctx.fresh();
    let mut body = vec![Stmt::Local {
        names: vec![Name::new(flag.clone())],
        exprs: vec![plausible_value(&mut ctx.rng)],
    }];
    if ctx.rng.coin() {
        body.push(Stmt::Call(Expr::call(
            Expr::name("error"),
            vec![Expr::Name(Name::new(flag))],
        )));
    } else {
        body.push(Stmt::While {
            cond: Expr::True,
            body: Block::synthetic(vec![inert_stmt(&mut ctx.rng, &mut ctx.names)]),
        });
    }
    body
}

/// `local function f(a, b) ... end`, never called
fn honeypot(ctx: &mut PassContext) -> Stmt {
    let name = ctx.fresh();
    let params: Vec<String> = (0..ctx.rng.range(1, 3)).map(|_| ctx.names.fresh()).collect();
    let first = Expr::name(params[0].clone());
    let key = Expr::Number(ctx.rng.range(3, 1 << 16) as f64);
    let check = Stmt::If {
        clauses: vec![IfClause {
            cond: Expr::binary(
                BinOp::Eq,
                Expr::call(Expr::name("type"), vec![first.clone()]),
                Expr::string("table"),
            ),
            body: Block::synthetic(vec![Stmt::Return(vec![Expr::index(
                first.clone(),
                key.clone(),
            )])]),
        }],
        else_block: None,
    };
    let mut stmts = vec![check];
    if ctx.rng.coin() {
        stmts.push(dead_branch(&mut ctx.rng, &mut ctx.names, Vec::new()));
    }
    stmts.push(Stmt::Return(vec![Expr::binary(
        BinOp::Or,
        Expr::binary(BinOp::And, opaque_false(&mut ctx.rng), first),
        key,
    )]));
    Stmt::LocalFunction {
        name: Name::new(name),
        func: FunctionBody {
            params: params.into_iter().map(Name::new).collect(),
            is_vararg: false,
            body: Block::synthetic(stmts),
        },
    }
}

/// `local t = {n1, n2, ...}`, never read
fn decoy_table(ctx: &mut PassContext) -> Stmt {
    let count = ctx.rng.range(4, 12);
    let fields = (0..count)
        .map(|_| TableField::Positional(Expr::Number(ctx.rng.range(0, 1 << 24) as f64)))
        .collect();
    Stmt::Local {
        names: vec![Name::new(ctx.fresh())],
        exprs: vec![Expr::Table(fields)],
    }
}
