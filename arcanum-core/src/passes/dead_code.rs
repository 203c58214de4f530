//! Dead code injection
//!
//! Every block receives inert statements in proportion to the statements it
//! already holds. Injected code declares its own locals inside a `do` or a
//! dead `if`, so nothing outside it can observe the values.

use crate::lua::ast::*;

use super::junk::inert_stmt;
use super::PassContext;

pub fn apply(chunk: &mut Chunk, ctx: &mut PassContext) -> String {
    let percent = ctx.settings.dead_code_percent as usize;
    let mut injector = Injector {
        ctx,
        percent,
        real: 0,
        injected: 0,
    };
    injector.visit_block(&mut chunk.block);
    format!(
        "injected {} inert statements ({}% of {} real statements)",
        injector.injected, percent, injector.real
    )
}

struct Injector<'a> {
    ctx: &'a mut PassContext,
    percent: usize,
    real: usize,
    injected: usize,
}

impl VisitMut for Injector<'_> {
    fn visit_block(&mut self, block: &mut Block) {
        if block.synthetic {
            return;
        }
        // Recurse first so injected statements are never counted as real
        walk_block_mut(self, block);
        let real = block.stmts.iter().filter(|s| !s.is_synthetic()).count();
        if real == 0 {
            return;
        }
        self.real += real;
        let count = (real * self.percent / 100).max(1);
        for _ in 0..count {
            let stmt = inert_stmt(&mut self.ctx.rng, &mut self.ctx.names);
            let at = self.ctx.rng.range(0, block.insertion_limit() as i64) as usize;
            block.stmts.insert(at, stmt);
        }
        self.injected += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::passes::test_support::context_for;

    fn settings(percent: u8) -> Settings {
        Settings {
            dead_code_percent: percent,
            ..Settings::all_disabled()
        }
    }

    #[test]
    fn test_density_follows_percent() {
        let source = "local a = 1 local b = 2 local c = a + b print(c)";
        let (mut chunk, mut ctx) = context_for(source, settings(100));
        let summary = apply(&mut chunk, &mut ctx);
        assert_eq!(summary, "injected 4 inert statements (100% of 4 real statements)");
        assert_eq!(chunk.block.stmts.len(), 8);
    }

    #[test]
    fn test_engine_made_code_is_neither_counted_nor_filled() {
        let (mut chunk, mut ctx) = context_for("local a = 1 print(a)", settings(100));
        chunk.block.stmts.insert(
            1,
            Stmt::Do(Block::synthetic(vec![Stmt::Call(Expr::call(
                Expr::name("print"),
                vec![],
            ))])),
        );
        let first = apply(&mut chunk, &mut ctx);
        assert_eq!(first, "injected 2 inert statements (100% of 2 real statements)");
        let second = apply(&mut chunk, &mut ctx);
        assert_eq!(second, first);
        assert_eq!(chunk.block.stmts.len(), 7);
        let Stmt::Do(marked) = chunk
            .block
            .stmts
            .iter()
            .find(|s| matches!(s, Stmt::Do(b) if b.stmts.len() == 1 && matches!(b.stmts[0], Stmt::Call(_))))
            .unwrap()
        else {
            unreachable!()
        };
        assert!(marked.synthetic);
    }

    #[test]
    fn test_terminators_stay_last() {
        let source = "local function f() return 1 end while true do break end return f()";
        let (mut chunk, mut ctx) = context_for(source, settings(95));
        apply(&mut chunk, &mut ctx);
        assert!(chunk.block.ends_with_terminator());
        let Some(Stmt::LocalFunction { func, .. }) = chunk
            .block
            .stmts
            .iter()
            .find(|s| matches!(s, Stmt::LocalFunction { .. }))
        else {
            panic!("function disappeared");
        };
        assert!(func.body.ends_with_terminator());
        assert_eq!(func.body.stmts.len(), 2);
    }

    #[test]
    fn test_original_statements_keep_their_order() {
        let source = "print(1) print(2) print(3)";
        let (mut chunk, mut ctx) = context_for(source, settings(99));
        apply(&mut chunk, &mut ctx);
        let calls: Vec<_> = chunk
            .block
            .stmts
            .iter()
            .filter_map(|s| match s {
                Stmt::Call(Expr::Call { args, .. }) => Some(args[0].clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            calls,
            vec![Expr::Number(1.0), Expr::Number(2.0), Expr::Number(3.0)]
        );
    }
}
