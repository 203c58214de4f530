//! Virtualization backend
//!
//! Selected statement regions are compiled to programs for a generated
//! stack machine. Each region is replaced in place by a driver that builds
//! its accessor table and calls the interpreter; with nesting enabled the
//! driver call is itself compiled again for a fresh instruction set, down to
//! a fixed depth. Programs, interpreters and their support functions are
//! returned as definitions to be placed ahead of the user code.

pub mod compiler;
pub mod interpreter;
pub mod isa;

use std::collections::BTreeSet;

use regex::Regex;

use crate::error::{Diagnostic, ObfuscateError, ObfuscateResult};
use crate::lua::ast::*;
use crate::lua::parse;
use crate::passes::PassContext;
use crate::rng::Entropy;

use compiler::{compile, eligible, Accessor, Compiled, Const, Program};
use interpreter::{interpreter, placeholder_pattern, support, Symbols, SUPPORT_STRINGS};
use isa::Isa;

/// Hard bound on driver re-lowering
pub const MAX_NESTING_DEPTH: usize = 3;

/// Words one region may spend across all of its nesting levels
pub const MAX_PROGRAM_WORDS: usize = 40_000;
/// Words the whole program table may hold
pub const MAX_BANK_WORDS: usize = 400_000;

/// Size caps for the emitted programs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub program_words: usize,
    pub bank_words: usize,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            program_words: MAX_PROGRAM_WORDS,
            bank_words: MAX_BANK_WORDS,
        }
    }
}

/// Stored words of the first program, for integrity checks
#[derive(Debug, Clone)]
pub struct Sealed {
    /// Name of the program table
    pub bank: String,
    pub words: Vec<i64>,
}

#[derive(Debug, Default)]
pub struct Lowered {
    /// Statements to place ahead of the user code
    pub defs: Vec<Stmt>,
    pub sealed: Option<Sealed>,
}

struct Level {
    isa: Isa,
    name: String,
}

/// Requested nesting depth for the configured intensity
pub fn requested_depth(nested: bool, intensity: u8) -> usize {
    if nested {
        1 + (intensity as usize).div_ceil(34)
    } else {
        1
    }
}

/// Lower regions of `chunk` in place. `reserved` lists identifiers that
/// name locals the final script declares ahead of the user code.
pub fn virtualize(
    chunk: &mut Chunk,
    ctx: &mut PassContext,
    reserved: &BTreeSet<String>,
) -> ObfuscateResult<Lowered> {
    virtualize_within(chunk, ctx, reserved, Budget::default())
}

pub(crate) fn virtualize_within(
    chunk: &mut Chunk,
    ctx: &mut PassContext,
    reserved: &BTreeSet<String>,
    budget: Budget,
) -> ObfuscateResult<Lowered> {
    ctx.begin("virtualize");
    let intensity = ctx.settings.virtualization_intensity;
    let requested = requested_depth(ctx.settings.nested_vm, intensity);
    let depth = requested.min(MAX_NESTING_DEPTH);
    if requested > MAX_NESTING_DEPTH {
        ctx.report.diagnostic(&Diagnostic::VirtualizationDepthExceeded {
            requested,
            cap: MAX_NESTING_DEPTH,
        });
    }

    let bank = ctx.fresh();
    let mut levels = Vec::with_capacity(depth);
    for _ in 0..depth {
        let isa = Isa::new(&ctx.settings, &mut ctx.rng);
        levels.push(Level {
            isa,
            name: ctx.fresh(),
        });
    }
    let mut outer = reserved.clone();
    outer.insert(bank.clone());
    outer.extend(levels.iter().map(|l| l.name.clone()));

    let mut virtualizer = Virtualizer {
        ctx,
        levels,
        bank,
        outer,
        programs: Vec::new(),
        sealed: None,
        budget,
        words: 0,
        over_budget: false,
        regions: 0,
        statements: 0,
        error: None,
    };
    virtualizer.visit_block(&mut chunk.block);
    if let Some(error) = virtualizer.error.take() {
        return Err(error);
    }

    let summary = format!(
        "lowered {} regions ({} statements) into {} programs, depth {}",
        virtualizer.regions,
        virtualizer.statements,
        virtualizer.programs.len(),
        depth
    );
    let defs = virtualizer.definitions()?;
    let sealed = virtualizer.sealed.take();
    virtualizer.ctx.report.log("virtualize", summary);
    Ok(Lowered { defs, sealed })
}

struct Virtualizer<'a> {
    ctx: &'a mut PassContext,
    levels: Vec<Level>,
    bank: String,
    /// Identifiers of enclosing locals the resolver does not know about
    outer: BTreeSet<String>,
    programs: Vec<Expr>,
    sealed: Option<Sealed>,
    budget: Budget,
    /// Words stored in the bank so far
    words: usize,
    over_budget: bool,
    regions: usize,
    statements: usize,
    error: Option<ObfuscateError>,
}

fn number(n: i64) -> Expr {
    Expr::Number(n as f64)
}

fn program_table(program: Program, encrypt: bool, rng: &mut Entropy) -> Expr {
    let words = program
        .words
        .iter()
        .map(|w| TableField::Positional(number(*w)))
        .collect();
    let consts = program
        .consts
        .into_iter()
        .map(|c| {
            TableField::Positional(match c {
                Const::Number(n) => Expr::Number(n),
                Const::Str(bytes) if encrypt => encrypted_string(&bytes, rng),
                Const::Str(bytes) => Expr::Str(bytes),
            })
        })
        .collect();
    let exports = program
        .exports
        .iter()
        .map(|r| TableField::Positional(number(*r)))
        .collect();
    Expr::Table(vec![
        TableField::Positional(Expr::Table(words)),
        TableField::Positional(Expr::Table(consts)),
        TableField::Positional(Expr::Table(exports)),
        TableField::Positional(number(program.entry)),
    ])
}

/// `{k, s, c3, c4, ...}` with `c_j = (byte + k + j*s) % 256`
fn encrypted_string(bytes: &[u8], rng: &mut Entropy) -> Expr {
    let k = rng.range(1, 255);
    let s = rng.range(1, 255);
    let mut fields = vec![
        TableField::Positional(number(k)),
        TableField::Positional(number(s)),
    ];
    for (i, b) in bytes.iter().enumerate() {
        let j = i as i64 + 3;
        fields.push(TableField::Positional(number((*b as i64 + k + j * s) % 256)));
    }
    Expr::Table(fields)
}

fn accessor_table(accessors: &[Accessor], ctx: &mut PassContext) -> Expr {
    let fields = accessors
        .iter()
        .map(|a| {
            let func = if a.setter {
                let value = ctx.fresh();
                FunctionBody {
                    params: vec![Name::new(value.clone())],
                    is_vararg: false,
                    body: Block::new(vec![Stmt::Assign {
                        targets: vec![Expr::name(a.ident.clone())],
                        exprs: vec![Expr::name(value)],
                    }]),
                }
            } else {
                FunctionBody {
                    params: Vec::new(),
                    is_vararg: false,
                    body: Block::new(vec![Stmt::Return(vec![Expr::name(a.ident.clone())])]),
                }
            };
            TableField::Positional(Expr::Function(Box::new(func)))
        })
        .collect();
    Expr::Table(fields)
}

/// Statements produced for one compiled program
struct Driver {
    /// Declarations that must stay visible after the region
    head: Vec<Stmt>,
    /// Statements run inside the region's own block; the call is last
    inner: Vec<Stmt>,
    /// Locals the driver introduces
    locals: Vec<String>,
}

impl Virtualizer<'_> {
    fn push_program(&mut self, program: Program, level: usize) -> i64 {
        if self.sealed.is_none() {
            self.sealed = Some(Sealed {
                bank: self.bank.clone(),
                words: program.words.clone(),
            });
        }
        let encrypt = self.levels[level].isa.encrypt_strings;
        let table = program_table(program, encrypt, &mut self.ctx.rng);
        self.programs.push(table);
        self.programs.len() as i64
    }

    fn driver(&mut self, level: usize, compiled: Compiled) -> Driver {
        let Compiled {
            program,
            accessors,
            exports,
        } = compiled;
        let index = self.push_program(program, level);
        let mut args = vec![Expr::index(Expr::name(self.bank.clone()), number(index))];
        let mut driver = Driver {
            head: Vec::new(),
            inner: Vec::new(),
            locals: Vec::new(),
        };

        if !accessors.is_empty() {
            let acc = self.ctx.fresh();
            let decl = Stmt::Local {
                names: vec![Name::new(acc.clone())],
                exprs: vec![accessor_table(&accessors, self.ctx)],
            };
            // the accessors must close over the enclosing locals, not the exports
            let shadowed = exports.iter().any(|e| accessors.iter().any(|a| &a.ident == e));
            if shadowed {
                driver.head.push(decl);
            } else {
                driver.inner.push(decl);
            }
            args.push(Expr::name(acc.clone()));
            driver.locals.push(acc);
        }

        let call = Expr::call(Expr::name(self.levels[level].name.clone()), args);
        if exports.is_empty() {
            driver.inner.push(Stmt::Call(call));
        } else {
            driver.head.push(Stmt::Local {
                names: exports.iter().map(Name::new).collect(),
                exprs: Vec::new(),
            });
            driver.inner.push(Stmt::Assign {
                targets: exports.iter().map(Expr::name).collect(),
                exprs: vec![call],
            });
            driver.locals.extend(exports);
        }
        driver
    }

    /// Whether `size` more words fit the region's remaining `left` and the
    /// bank; logs the first refusal
    fn admit(&mut self, size: usize, left: usize) -> bool {
        let (scope, cap) = if size > left {
            ("program", self.budget.program_words)
        } else if self.words + size > self.budget.bank_words {
            ("bank", self.budget.bank_words)
        } else {
            self.words += size;
            return true;
        };
        if !self.over_budget {
            self.over_budget = true;
            self.ctx
                .report
                .diagnostic(&Diagnostic::VirtualizationBudgetExceeded { scope, cap });
        }
        false
    }

    /// Compile `stmts` and nest the driver while the budget allows; `None`
    /// leaves the region as plain code
    fn lower(&mut self, stmts: &[Stmt]) -> ObfuscateResult<Option<Vec<Stmt>>> {
        let compiled = compile(stmts, &self.levels[0].isa, &self.outer, &mut self.ctx.rng)?;
        let mut left = self.budget.program_words;
        let size = compiled.program.words.len();
        if !self.admit(size, left) {
            return Ok(None);
        }
        left -= size;
        let Driver {
            mut head,
            mut inner,
            mut locals,
        } = self.driver(0, compiled);

        let mut outer = self.outer.clone();
        for level in 1..self.levels.len() {
            let Some(call) = inner.pop() else {
                break;
            };
            outer.extend(locals.drain(..));
            let compiled = compile(
                std::slice::from_ref(&call),
                &self.levels[level].isa,
                &outer,
                &mut self.ctx.rng,
            )?;
            let size = compiled.program.words.len();
            if !self.admit(size, left) {
                inner.push(call);
                break;
            }
            left -= size;
            let deeper = self.driver(level, compiled);
            inner.extend(deeper.head);
            inner.extend(deeper.inner);
            locals = deeper.locals;
        }

        head.push(Stmt::Do(Block::synthetic(inner)));
        self.regions += 1;
        self.statements += stmts.len();
        Ok(Some(head))
    }

    /// Lower or descend into a run of eligible statements
    fn flush(&mut self, run: &mut Vec<Stmt>, out: &mut Vec<Stmt>) {
        if run.is_empty() {
            return;
        }
        let stmts = std::mem::take(run);
        let intensity = self.ctx.settings.virtualization_intensity as u32;
        if self.error.is_none() && self.ctx.rng.chance(intensity) {
            match self.lower(&stmts) {
                Ok(Some(driver)) => {
                    out.extend(driver);
                    return;
                }
                Ok(None) => {}
                Err(error) => self.error = Some(error),
            }
        }
        for mut stmt in stmts {
            walk_stmt_mut(self, &mut stmt);
            out.push(stmt);
        }
    }

    /// Support code, interpreters and the program table
    fn definitions(&mut self) -> ObfuscateResult<Vec<Stmt>> {
        if self.programs.is_empty() {
            return Ok(Vec::new());
        }
        let pattern: Regex = placeholder_pattern()?;
        let env = self.ctx.runtime.env();
        let control = self.ctx.runtime.control_cell();
        let mut shared = Symbols::new();
        for (key, expr) in [("E", env), ("R", control)] {
            if let Expr::Name(name) = expr {
                shared.bind(key, name.ident);
            }
        }
        for text in SUPPORT_STRINGS {
            self.ctx.runtime.escape(text.as_bytes());
        }

        let mut source = support(&mut shared, &mut self.ctx.names, &pattern);
        for level in &self.levels {
            source.push_str(&interpreter(
                &level.isa,
                &level.name,
                &shared,
                &mut self.ctx.names,
                &mut self.ctx.rng,
                &pattern,
            ));
        }
        let chunk = parse(&source).map_err(|e| {
            ObfuscateError::Internal(format!("generated interpreter does not parse: {}", e))
        })?;

        let mut defs = chunk.block.stmts;
        defs.push(Stmt::Local {
            names: vec![Name::new(self.bank.clone())],
            exprs: vec![Expr::Table(
                std::mem::take(&mut self.programs)
                    .into_iter()
                    .map(TableField::Positional)
                    .collect(),
            )],
        });
        Ok(defs)
    }
}

impl VisitMut for Virtualizer<'_> {
    fn visit_block(&mut self, block: &mut Block) {
        if self.error.is_some() {
            return;
        }
        let mut out = Vec::with_capacity(block.stmts.len());
        let mut run = Vec::new();
        for mut stmt in std::mem::take(&mut block.stmts) {
            if eligible(&stmt) {
                run.push(stmt);
                continue;
            }
            self.flush(&mut run, &mut out);
            walk_stmt_mut(self, &mut stmt);
            out.push(stmt);
        }
        self.flush(&mut run, &mut out);
        block.stmts = out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::lua::printer::print_chunk;
    use crate::passes::test_support::context_for;
    use crate::resolve::resolve;

    fn run(source: &str, settings: Settings) -> (Chunk, PassContext, Lowered) {
        let (mut chunk, mut ctx) = context_for(source, settings);
        resolve(&mut chunk);
        let reserved: BTreeSet<String> = ctx.runtime.idents().iter().map(|s| s.to_string()).collect();
        let lowered = virtualize(&mut chunk, &mut ctx, &reserved).unwrap();
        (chunk, ctx, lowered)
    }

    fn vm_settings(intensity: u8, nested: bool) -> Settings {
        Settings {
            stack_machine: true,
            virtualization_intensity: intensity,
            nested_vm: nested,
            ..Settings::all_disabled()
        }
    }

    #[test]
    fn test_requested_depth() {
        assert_eq!(requested_depth(false, 100), 1);
        assert_eq!(requested_depth(true, 0), 1);
        assert_eq!(requested_depth(true, 34), 2);
        assert_eq!(requested_depth(true, 35), 3);
        assert_eq!(requested_depth(true, 100), 4);
    }

    #[test]
    fn test_full_intensity_lowers_every_region() {
        let source = "local x = 1 + 2 print(x) local function f() return x end print(f())";
        let (chunk, ctx, lowered) = run(source, vm_settings(100, false));
        assert_eq!(
            ctx.report.lines(),
            &["[virtualize] lowered 2 regions (3 statements) into 2 programs, depth 1".to_string()]
        );
        assert!(!lowered.defs.is_empty());
        assert!(lowered.sealed.is_some());
        // the export keeps `x` visible to the function that follows
        assert!(matches!(&chunk.block.stmts[0], Stmt::Local { names, exprs } if names[0].ident == "x" && exprs.is_empty()));
        let mut whole = lowered.defs.clone();
        whole.extend(chunk.block.stmts.clone());
        parse(&print_chunk(&Chunk {
            block: Block::new(whole),
        }))
        .unwrap();
    }

    #[test]
    fn test_depth_is_capped() {
        let (_, ctx, _) = run("print(1)", vm_settings(100, true));
        let lines = ctx.report.lines();
        assert_eq!(lines[0], "[virtualize] warning: nesting depth 4 requested, capped at 3");
        assert_eq!(
            lines[1],
            "[virtualize] lowered 1 regions (1 statements) into 3 programs, depth 3"
        );
    }

    fn run_within(source: &str, settings: Settings, budget: Budget) -> (PassContext, Lowered) {
        let (mut chunk, mut ctx) = context_for(source, settings);
        resolve(&mut chunk);
        let reserved: BTreeSet<String> = ctx.runtime.idents().iter().map(|s| s.to_string()).collect();
        let lowered = virtualize_within(&mut chunk, &mut ctx, &reserved, budget).unwrap();
        let mut whole = lowered.defs.clone();
        whole.extend(chunk.block.stmts);
        parse(&print_chunk(&Chunk {
            block: Block::new(whole),
        }))
        .unwrap();
        (ctx, lowered)
    }

    #[test]
    fn test_program_budget_falls_back_to_shallower_depth() {
        let source = "print(1 + 2)";
        let (_, _, unbounded) = run(source, vm_settings(100, true));
        let first = unbounded.sealed.unwrap().words.len();

        // room for the region's own program but not for any driver above it
        let budget = Budget {
            program_words: first,
            ..Budget::default()
        };
        let (ctx, lowered) = run_within(source, vm_settings(100, true), budget);
        let lines = ctx.report.lines();
        assert_eq!(
            lines[1],
            format!(
                "[virtualize] warning: program budget of {} words reached, lowering shallower",
                first
            )
        );
        assert!(lines[2].contains("into 1 programs, depth 3"), "{}", lines[2]);
        assert_eq!(lowered.sealed.unwrap().words.len(), first);
    }

    #[test]
    fn test_full_bank_leaves_code_unlowered() {
        let budget = Budget {
            bank_words: 0,
            ..Budget::default()
        };
        let (ctx, lowered) = run_within("print(1) print(2)", vm_settings(100, false), budget);
        assert!(lowered.defs.is_empty());
        assert!(lowered.sealed.is_none());
        let lines = ctx.report.lines();
        assert_eq!(
            lines[0],
            "[virtualize] warning: bank budget of 0 words reached, lowering shallower"
        );
        assert!(lines[1].contains("lowered 0 regions"));
    }

    #[test]
    fn test_nothing_selected_emits_no_definitions() {
        let (chunk, ctx, lowered) = run("local function f() end", vm_settings(100, false));
        assert!(lowered.defs.is_empty());
        assert!(lowered.sealed.is_none());
        assert_eq!(chunk.block.stmts.len(), 1);
        assert!(ctx.report.lines()[0].contains("lowered 0 regions"));
    }
}
