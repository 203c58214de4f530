//! Arithmetic disguise
//!
//! Numeric literals are replaced with identity expressions that evaluate to
//! the same double:
//!
//! - additive `(n + a) - a`
//! - multiplicative `(n * b) / b` with `b` a power of two
//! - modular `(n + a*m) % m` for `0 <= n < m`
//!
//! Integer identities are only used where every intermediate stays an
//! integer below 2^53. Arithmetic between operands that are not provably
//! numbers is left alone and reported as an unsafe site.

use crate::lua::ast::*;

use super::PassContext;

const PASS: &str = "arithmetic";
/// Largest literal magnitude rewritten with integer identities
const INTEGER_LIMIT: f64 = 2_147_483_648.0;
/// Largest magnitude for which `(x * 1024) / 1024` cannot overflow
const SCALE_LIMIT: f64 = 1e300;

pub fn apply(chunk: &mut Chunk, ctx: &mut PassContext) -> String {
    let layers = if ctx.settings.heavy_math { 3 } else { 1 };
    let mut disguiser = Disguiser {
        ctx,
        layers,
        node: 0,
        literals: 0,
        folded: 0,
    };
    disguiser.visit_block(&mut chunk.block);
    let (literals, folded) = (disguiser.literals, disguiser.folded);
    format!(
        "disguised {} literals and {} constant expressions, {} sites left untouched",
        literals,
        folded,
        ctx.unsafe_count()
    )
}

/// Evaluate a tree made only of numeric literals and arithmetic, the way
/// Lua 5.1 would
pub fn constant_value(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Number(n) => Some(*n),
        Expr::Paren(inner) => constant_value(inner),
        Expr::Unary {
            op: UnOp::Neg,
            operand,
        } => constant_value(operand).map(|v| -v),
        Expr::Binary { op, lhs, rhs } if op.is_arithmetic() => {
            let (a, b) = (constant_value(lhs)?, constant_value(rhs)?);
            Some(match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::IDiv => (a / b).floor(),
                BinOp::Mod => a - (a / b).floor() * b,
                BinOp::Pow => a.powf(b),
                _ => return None,
            })
        }
        _ => None,
    }
}

struct Disguiser<'a> {
    ctx: &'a mut PassContext,
    layers: usize,
    node: usize,
    literals: usize,
    folded: usize,
}

fn num(n: f64) -> Expr {
    Expr::Number(n)
}

impl Disguiser<'_> {
    /// Whether the expression touches a variable spelled in the input
    fn mentions_source(&self, expr: &Expr) -> bool {
        struct Finder<'s> {
            idents: &'s std::collections::BTreeSet<String>,
            found: bool,
        }
        impl Visit for Finder<'_> {
            fn visit_name(&mut self, name: &Name) {
                self.found |= self.idents.contains(&name.ident);
            }
        }
        let mut finder = Finder {
            idents: &self.ctx.source_idents,
            found: false,
        };
        finder.visit_expr(expr);
        finder.found
    }

    fn additive(&mut self, inner: Expr) -> Expr {
        let a = self.ctx.rng.range(1, (1 << 31) - 1) as f64;
        Expr::paren(Expr::binary(
            BinOp::Sub,
            Expr::paren(Expr::binary(BinOp::Add, inner, num(a))),
            num(a),
        ))
    }

    fn multiplicative(&mut self, inner: Expr) -> Expr {
        let b = (1u32 << self.ctx.rng.range(1, 10)) as f64;
        Expr::paren(Expr::binary(
            BinOp::Div,
            Expr::paren(Expr::binary(BinOp::Mul, inner, num(b))),
            num(b),
        ))
    }

    fn modular(&mut self, n: f64) -> Expr {
        let m = n + self.ctx.rng.range(1, 1 << 16) as f64;
        let a = self.ctx.rng.range(1, 1 << 10) as f64;
        Expr::paren(Expr::binary(BinOp::Mod, num(n + a * m), num(m)))
    }

    /// An expression equal to the literal `n`
    fn literal(&mut self, n: f64) -> Expr {
        let integer = n.fract() == 0.0 && n.abs() < INTEGER_LIMIT && !(n == 0.0 && n.is_sign_negative());
        if !integer && !(n.is_finite() && n.abs() < SCALE_LIMIT) {
            return num(n);
        }
        let mut expr = num(n);
        for layer in 0..self.layers {
            expr = if !integer {
                self.multiplicative(expr)
            } else {
                match self.ctx.rng.below(3) {
                    0 => self.additive(expr),
                    1 => self.multiplicative(expr),
                    // the modular form needs the bare literal
                    _ if layer == 0 && n >= 0.0 => self.modular(n),
                    _ => self.additive(expr),
                }
            };
        }
        self.literals += 1;
        expr
    }

    /// Wrap an all-constant arithmetic expression in one more identity
    fn fold(&mut self, expr: Expr, value: f64) -> Expr {
        if !value.is_finite() || value.abs() >= SCALE_LIMIT {
            return expr;
        }
        self.folded += 1;
        let integer = value.fract() == 0.0
            && value.abs() < INTEGER_LIMIT
            && !(value == 0.0 && value.is_sign_negative());
        if integer && self.ctx.rng.coin() {
            self.additive(expr)
        } else {
            self.multiplicative(expr)
        }
    }
}

impl VisitMut for Disguiser<'_> {
    fn visit_stmt(&mut self, stmt: &mut Stmt) {
        walk_stmt_mut(self, stmt);
        if let Stmt::CompoundAssign { op, target, value } = stmt {
            if op.is_arithmetic() && (self.mentions_source(target) || self.mentions_source(value)) {
                let node = self.node;
                self.ctx.skip_unsafe(PASS, node);
            }
        }
    }

    fn visit_expr(&mut self, expr: &mut Expr) {
        let node = self.node;
        self.node += 1;
        walk_expr_mut(self, expr);
        match expr {
            Expr::Number(n) => {
                let n = *n;
                *expr = self.literal(n);
            }
            Expr::Binary { op, .. } if op.is_arithmetic() => {
                if let Some(value) = constant_value(expr) {
                    let original = std::mem::replace(expr, Expr::Nil);
                    *expr = self.fold(original, value);
                } else if self.mentions_source(expr) {
                    self.ctx.skip_unsafe(PASS, node);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::lua::parse;
    use crate::lua::printer::print_chunk;
    use crate::passes::test_support::context_for;

    fn settings(heavy: bool) -> Settings {
        Settings {
            arithmetic_obf: true,
            heavy_math: heavy,
            ..Settings::all_disabled()
        }
    }

    fn first_value(chunk: &Chunk) -> &Expr {
        match &chunk.block.stmts[0] {
            Stmt::Local { exprs, .. } => &exprs[0],
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_literals_keep_their_value() {
        for (source, expected) in [
            ("local x = 42", 42.0),
            ("local x = 0", 0.0),
            ("local x = 0.1", 0.1),
            ("local x = 123456789", 123_456_789.0),
            ("local x = 1 + 2", 3.0),
            ("local x = 7 % 3", 1.0),
            ("local x = 1 / 3", 1.0 / 3.0),
            ("local x = -2 ^ 2", -4.0),
        ] {
            for heavy in [false, true] {
                let (mut chunk, mut ctx) = context_for(source, settings(heavy));
                apply(&mut chunk, &mut ctx);
                let value = constant_value(first_value(&chunk)).unwrap();
                assert_eq!(value, expected, "{}", source);
                // the disguised tree survives printing
                let reparsed = parse(&print_chunk(&chunk)).unwrap();
                assert_eq!(constant_value(first_value(&reparsed)).unwrap(), expected);
            }
        }
    }

    #[test]
    fn test_non_numeric_sites_are_reported() {
        let (mut chunk, mut ctx) = context_for("local s = a + 1 local t = 'x' .. 'y'", settings(false));
        let summary = apply(&mut chunk, &mut ctx);
        assert!(summary.ends_with("1 sites left untouched"));
        assert_eq!(
            ctx.report.lines(),
            &["[arithmetic] pass skipped at node 0: unsafe".to_string()]
        );
    }

    #[test]
    fn test_synthesized_arithmetic_is_not_reported() {
        let (mut chunk, mut ctx) = context_for("print(1)", settings(false));
        let counter = ctx.fresh();
        chunk.block.stmts.push(Stmt::Assign {
            targets: vec![Expr::name(counter.clone())],
            exprs: vec![Expr::binary(BinOp::Add, Expr::name(counter), Expr::Number(1.0))],
        });
        apply(&mut chunk, &mut ctx);
        assert!(ctx.report.lines().is_empty());
    }
}
