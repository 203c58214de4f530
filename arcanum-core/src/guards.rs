//! Runtime guards
//!
//! Guards are split into a head, placed right after the prelude, and checks
//! placed at a random top-level point of the user code. A failed check
//! never raises: it writes a nonzero value into the control cell, which
//! skews every consumer of `R[1]` from then on. On an unmodified run every
//! check passes and nothing observable changes.

use crate::lua::ast::*;
use crate::passes::junk::plausible_value;
use crate::passes::PassContext;
use crate::vm::Sealed;

/// Prime modulus of the integrity checksum
pub const CHECKSUM_MODULUS: i64 = 16_777_213;
/// Longest run of words covered by one checksum
const MAX_SEALED_WORDS: usize = 64;
/// Length of the seal table used when nothing was virtualized
const SEAL_LENGTH: usize = 24;

/// `s = (s * 31 + w) % 16777213` over `words`, starting from zero
pub fn checksum(words: &[i64]) -> i64 {
    words
        .iter()
        .fold(0, |sum, word| (sum * 31 + word) % CHECKSUM_MODULUS)
}

fn num(n: i64) -> Expr {
    Expr::Number(n as f64)
}

/// Install the enabled guards into `user`; returns the head statements
pub fn install(user: &mut Block, sealed: Option<&Sealed>, ctx: &mut PassContext) -> Vec<Stmt> {
    ctx.begin("guards");
    let mut head = Vec::new();
    let mut installed = Vec::new();

    if ctx.settings.anti_tracing {
        head.push(anti_tracing(ctx));
        installed.push("anti-tracing".to_string());
    }
    if ctx.settings.anti_tamper {
        let (seal, check, covered) = anti_tamper(sealed, ctx);
        head.extend(seal);
        insert_randomly(user, check, ctx);
        installed.push(format!("anti-tamper over {} words", covered));
    }
    if ctx.settings.env_lock {
        let (capture, check) = env_lock(ctx);
        head.push(capture);
        insert_randomly(user, check, ctx);
        installed.push("environment lock".to_string());
    }
    if !installed.is_empty() {
        ctx.report
            .log("guards", format!("installed {}", installed.join(", ")));
    }

    if !ctx.settings.watermark.is_empty() {
        head.push(watermark(ctx));
        let length = ctx.settings.watermark.len();
        ctx.report
            .log("watermark", format!("embedded {} bytes under a computed key", length));
    }
    head
}

fn insert_randomly(user: &mut Block, stmt: Stmt, ctx: &mut PassContext) {
    let at = ctx.rng.range(0, user.insertion_limit() as i64) as usize;
    user.stmts.insert(at, stmt);
}

/// `R[1] = k` with a nonzero `k`
fn corrupt(ctx: &mut PassContext) -> Stmt {
    let value = ctx.rng.range(1, 1 << 20);
    Stmt::Assign {
        targets: vec![ctx.runtime.control_read()],
        exprs: vec![num(value)],
    }
}

/// `do local d = (E["debug"] or {})["gethook"] if d and d() then return end end`
fn anti_tracing(ctx: &mut PassContext) -> Stmt {
    ctx.runtime.escape(b"debug");
    ctx.runtime.escape(b"gethook");
    let hook = ctx.fresh();
    let library = Expr::paren(Expr::binary(
        BinOp::Or,
        Expr::index(ctx.runtime.env(), Expr::string("debug")),
        Expr::Table(Vec::new()),
    ));
    Stmt::Do(Block::new(vec![
        Stmt::Local {
            names: vec![Name::new(hook.clone())],
            exprs: vec![Expr::index(library, Expr::string("gethook"))],
        },
        Stmt::If {
            clauses: vec![IfClause {
                cond: Expr::binary(
                    BinOp::And,
                    Expr::name(hook.clone()),
                    Expr::call(Expr::name(hook), Vec::new()),
                ),
                body: Block::new(vec![Stmt::Return(Vec::new())]),
            }],
            else_block: None,
        },
    ]))
}

/// Seal declarations for the head, the check, and the number of covered words
fn anti_tamper(sealed: Option<&Sealed>, ctx: &mut PassContext) -> (Vec<Stmt>, Stmt, usize) {
    let mut seal = Vec::new();
    let (table, words) = match sealed.filter(|s| !s.words.is_empty()) {
        Some(sealed) => {
            let len = sealed.words.len();
            let span = len.min(MAX_SEALED_WORDS);
            let start = ctx.rng.below(len - span + 1);
            let code = Expr::index(
                Expr::index(Expr::name(sealed.bank.clone()), num(1)),
                num(1),
            );
            (code, (start, sealed.words[start..start + span].to_vec()))
        }
        None => {
            let name = ctx.fresh();
            let values: Vec<i64> = (0..SEAL_LENGTH)
                .map(|_| ctx.rng.range(0, (1 << 24) - 1))
                .collect();
            seal.push(Stmt::Local {
                names: vec![Name::new(name.clone())],
                exprs: vec![Expr::Table(
                    values.iter().map(|v| TableField::Positional(num(*v))).collect(),
                )],
            });
            (Expr::name(name), (0, values))
        }
    };
    let (start, covered) = words;
    let expected = checksum(&covered);

    let sum = ctx.fresh();
    let view = ctx.fresh();
    let index = ctx.fresh();
    let step = Expr::binary(
        BinOp::Mod,
        Expr::binary(
            BinOp::Add,
            Expr::binary(BinOp::Mul, Expr::name(sum.clone()), num(31)),
            Expr::index(Expr::name(view.clone()), Expr::name(index.clone())),
        ),
        num(CHECKSUM_MODULUS),
    );
    let check = Stmt::Do(Block::new(vec![
        Stmt::Local {
            names: vec![Name::new(sum.clone()), Name::new(view)],
            exprs: vec![num(0), table],
        },
        Stmt::NumericFor {
            var: Name::new(index),
            start: num(start as i64 + 1),
            limit: num((start + covered.len()) as i64),
            step: None,
            body: Block::new(vec![Stmt::Assign {
                targets: vec![Expr::name(sum.clone())],
                exprs: vec![step],
            }]),
        },
        Stmt::If {
            clauses: vec![IfClause {
                cond: Expr::binary(BinOp::Ne, Expr::name(sum), num(expected)),
                body: Block::new(vec![corrupt(ctx)]),
            }],
            else_block: None,
        },
    ]));
    (seal, check, covered.len())
}

/// Capture `{getmetatable(""), rawequal, getmetatable}` and a later comparison
fn env_lock(ctx: &mut PassContext) -> (Stmt, Stmt) {
    ctx.runtime.escape(b"getmetatable");
    ctx.runtime.escape(b"rawequal");
    let lock = ctx.fresh();
    let getmetatable = Expr::index(ctx.runtime.env(), Expr::string("getmetatable"));
    let rawequal = Expr::index(ctx.runtime.env(), Expr::string("rawequal"));
    let capture = Stmt::Local {
        names: vec![Name::new(lock.clone())],
        exprs: vec![Expr::Table(vec![
            TableField::Positional(Expr::call(getmetatable.clone(), vec![Expr::string("")])),
            TableField::Positional(rawequal),
            TableField::Positional(getmetatable),
        ])],
    };
    let slot = |i: i64| Expr::index(Expr::name(lock.clone()), num(i));
    let same = Expr::call(
        slot(2),
        vec![slot(1), Expr::call(slot(3), vec![Expr::string("")])],
    );
    let check = Stmt::If {
        clauses: vec![IfClause {
            cond: Expr::unary(UnOp::Not, same),
            body: Block::new(vec![corrupt(ctx)]),
        }],
        else_block: None,
    };
    (capture, check)
}

/// `local M = {[a * b % m] = "<watermark>", ...}` among decoy entries
fn watermark(ctx: &mut PassContext) -> Stmt {
    let name = ctx.fresh();
    let rng = &mut ctx.rng;
    let (a, b, m) = (rng.range(3, 9_973), rng.range(3, 9_973), rng.range(101, 65_521));
    let key = Expr::binary(
        BinOp::Mod,
        Expr::binary(BinOp::Mul, num(a), num(b)),
        num(m),
    );
    let mut fields = vec![TableField::Keyed(
        key,
        Expr::Str(ctx.settings.watermark.as_bytes().to_vec()),
    )];
    for _ in 0..ctx.rng.range(2, 4) {
        // decoy keys stay clear of the computed one
        let decoy = ctx.rng.range(m, m + 65_521);
        fields.push(TableField::Keyed(num(decoy), plausible_value(&mut ctx.rng)));
    }
    ctx.rng.shuffle(&mut fields);
    Stmt::Local {
        names: vec![Name::new(name)],
        exprs: vec![Expr::Table(fields)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::lua::parse;
    use crate::lua::printer::print_chunk;
    use crate::passes::test_support::context_for;

    fn guards(settings: Settings) -> Settings {
        Settings {
            anti_tracing: true,
            anti_tamper: true,
            env_lock: true,
            ..settings
        }
    }

    #[test]
    fn test_checksum_matches_reference_fold() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[5]), 5);
        assert_eq!(checksum(&[1, 2, 3]), (31 + 2) * 31 + 3);
        let big = checksum(&[16_777_215; 10]);
        assert!((0..CHECKSUM_MODULUS).contains(&big));
    }

    #[test]
    fn test_every_guard_reports_and_parses() {
        let (mut chunk, mut ctx) = context_for("print(1) print(2)", guards(Settings::all_disabled()));
        let head = install(&mut chunk.block, None, &mut ctx);
        assert_eq!(
            ctx.report.lines(),
            &[
                "[guards] installed anti-tracing, anti-tamper over 24 words, environment lock".to_string(),
                "[watermark] embedded 14 bytes under a computed key".to_string(),
            ]
        );
        // anti-tracing, seal table, lock capture, watermark
        assert_eq!(head.len(), 4);
        assert_eq!(chunk.block.stmts.len(), 4);
        let mut whole = head;
        whole.extend(chunk.block.stmts);
        let text = print_chunk(&Chunk {
            block: Block::new(whole),
        });
        parse(&text).unwrap();
        assert!(text.contains("Arcanum_v5.0.0"));
    }

    #[test]
    fn test_sealed_program_range() {
        let (mut chunk, mut ctx) = context_for("print(1)", guards(Settings::all_disabled().with_watermark("")));
        let sealed = Sealed {
            bank: "B".into(),
            words: (0..100).collect(),
        };
        let head = install(&mut chunk.block, Some(&sealed), &mut ctx);
        // no seal table when bytecode exists
        assert_eq!(head.len(), 2);
        assert!(ctx.report.lines()[0].contains("anti-tamper over 64 words"));
        assert!(print_chunk(&chunk).contains("B[1][1]"));
    }

    #[test]
    fn test_empty_watermark_is_skipped() {
        let (mut chunk, mut ctx) = context_for("print(1)", Settings::all_disabled().with_watermark(""));
        assert!(install(&mut chunk.block, None, &mut ctx).is_empty());
        assert!(ctx.report.lines().is_empty());
    }
}
