//! Generators for code that never affects the program
//!
//! Opaque predicates are built from integer identities that hold for every
//! `n`, so the guarded branch is dead by construction. Inert statements only
//! ever write fresh locals declared inside their own `do` block.

use crate::lua::ast::*;
use crate::rng::Entropy;
use crate::rng::NameGen;

fn num(n: i64) -> Expr {
    Expr::Number(n as f64)
}

fn add(a: Expr, b: Expr) -> Expr {
    Expr::binary(BinOp::Add, a, b)
}

fn mul(a: Expr, b: Expr) -> Expr {
    Expr::binary(BinOp::Mul, a, b)
}

/// An expression that always evaluates to `false`
pub fn opaque_false(rng: &mut Entropy) -> Expr {
    let n = rng.range(2, 32_768);
    match rng.below(3) {
        // n(n+1) is even
        0 => Expr::binary(
            BinOp::Eq,
            Expr::binary(BinOp::Mod, add(mul(num(n), num(n)), num(n)), num(2)),
            num(1),
        ),
        // squares are 0 or 1 modulo 4
        1 => Expr::binary(
            BinOp::Eq,
            Expr::binary(BinOp::Mod, mul(num(n), num(n)), num(4)),
            num(2),
        ),
        // n^3 - n is a product of three consecutive integers
        _ => Expr::binary(
            BinOp::Ne,
            Expr::binary(
                BinOp::Mod,
                Expr::binary(BinOp::Sub, mul(mul(num(n), num(n)), num(n)), num(n)),
                num(6),
            ),
            num(0),
        ),
    }
}

/// An expression that always evaluates to `true`
pub fn opaque_true(rng: &mut Entropy) -> Expr {
    Expr::unary(UnOp::Not, Expr::paren(opaque_false(rng)))
}

const DECOY_WORDS: &[&str] = &[
    "checksum", "session", "license", "token", "handshake", "signature", "payload", "nonce",
    "heartbeat", "auth", "verify", "integrity",
];

/// A random constant that looks like it could matter
pub fn plausible_value(rng: &mut Entropy) -> Expr {
    match rng.below(4) {
        0 => Expr::string(rng.pick(DECOY_WORDS).copied().unwrap_or("token")),
        1 => num(rng.range(0, 1 << 20)),
        2 => Expr::Number(rng.range(1, 9_999) as f64 / 8.0),
        _ => {
            let fields = (0..rng.range(1, 4))
                .map(|_| TableField::Positional(num(rng.range(0, 255))))
                .collect();
            Expr::Table(fields)
        }
    }
}

/// Statements that read like working code but only touch `locals`
fn busy_work(rng: &mut Entropy, locals: &[String]) -> Vec<Stmt> {
    let mut stmts = Vec::new();
    for _ in 0..rng.range(1, 3) {
        let Some(target) = rng.pick(locals).cloned() else {
            break;
        };
        let stmt = match rng.below(3) {
            0 => Stmt::Assign {
                targets: vec![Expr::name(target.clone())],
                exprs: vec![plausible_value(rng)],
            },
            1 => Stmt::Assign {
                targets: vec![Expr::name(target.clone())],
                exprs: vec![Expr::Table(vec![TableField::Named(
                    rng.pick(DECOY_WORDS).copied().unwrap_or("nonce").to_string(),
                    num(rng.range(0, 65_535)),
                )])],
            },
            _ => Stmt::Assign {
                targets: vec![Expr::name(target.clone())],
                exprs: vec![Expr::binary(
                    BinOp::Or,
                    Expr::name(target.clone()),
                    plausible_value(rng),
                )],
            },
        };
        stmts.push(stmt);
    }
    stmts
}

/// A self-contained statement with no observable effect
pub fn inert_stmt(rng: &mut Entropy, names: &mut NameGen) -> Stmt {
    let locals: Vec<String> = (0..rng.range(1, 2)).map(|_| names.fresh()).collect();
    let decl = Stmt::Local {
        names: locals.iter().map(|n| Name::new(n.clone())).collect(),
        exprs: locals.iter().map(|_| plausible_value(rng)).collect(),
    };
    let mut body = vec![decl];
    body.extend(busy_work(rng, &locals));
    if rng.coin() {
        Stmt::Do(Block::synthetic(body))
    } else {
        Stmt::If {
            clauses: vec![IfClause {
                cond: opaque_false(rng),
                body: Block::synthetic(body),
            }],
            else_block: None,
        }
    }
}

/// `if <false> then <plausible code> end`
pub fn dead_branch(rng: &mut Entropy, names: &mut NameGen, body: Vec<Stmt>) -> Stmt {
    let mut stmts = body;
    if stmts.is_empty() {
        stmts.push(inert_stmt(rng, names));
    }
    Stmt::If {
        clauses: vec![IfClause {
            cond: opaque_false(rng),
            body: Block::synthetic(stmts),
        }],
        else_block: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Constant-fold the integer expressions produced above
    fn eval(expr: &Expr) -> f64 {
        match expr {
            Expr::Number(n) => *n,
            Expr::Paren(inner) => eval(inner),
            Expr::Binary { op, lhs, rhs } => {
                let (a, b) = (eval(lhs), eval(rhs));
                match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Mod => a - (a / b).floor() * b,
                    BinOp::Eq => (a == b) as i32 as f64,
                    BinOp::Ne => (a != b) as i32 as f64,
                    other => panic!("unexpected operator {:?}", other),
                }
            }
            Expr::Unary {
                op: UnOp::Not,
                operand,
            } => (eval(operand) == 0.0) as i32 as f64,
            other => panic!("unexpected expression {:?}", other),
        }
    }

    #[test]
    fn test_opaque_predicates_hold() {
        let mut rng = Entropy::new("junk", "test");
        for _ in 0..300 {
            assert_eq!(eval(&opaque_false(&mut rng)), 0.0);
            assert_eq!(eval(&opaque_true(&mut rng)), 1.0);
        }
    }

    #[test]
    fn test_inert_statements_are_scoped() {
        let mut rng = Entropy::new("junk", "scope");
        let mut names = NameGen::new("junk", Vec::new());
        for _ in 0..50 {
            match inert_stmt(&mut rng, &mut names) {
                Stmt::Do(block) => assert!(matches!(block.stmts[0], Stmt::Local { .. })),
                Stmt::If { clauses, .. } => {
                    assert!(matches!(clauses[0].body.stmts[0], Stmt::Local { .. }))
                }
                other => panic!("unscoped statement {:?}", other),
            }
        }
    }
}
