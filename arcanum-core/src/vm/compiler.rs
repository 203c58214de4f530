//! Lowering of statement regions to stack machine programs
//!
//! A region is a run of consecutive statements that only use constructs the
//! machine implements. Locals declared inside the region live in machine
//! registers; every other local is reached through an accessor table of
//! getter and setter closures built at the call site, and globals go through
//! the captured environment. Top-level locals of the region are returned by
//! the program so the surrounding code still sees them.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ObfuscateError, ObfuscateResult};
use crate::lua::ast::*;
use crate::rng::Entropy;

use super::isa::{Instr, Isa, Op, WORDS_PER_SLOT};

/// Entry of a constant pool
#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    Number(f64),
    Str(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum ConstKey {
    Number(u64),
    Str(Vec<u8>),
}

/// An encoded program, ready to be written out as a table literal
#[derive(Debug, Clone)]
pub struct Program {
    pub words: Vec<i64>,
    pub consts: Vec<Const>,
    /// Registers returned when the program halts
    pub exports: Vec<i64>,
    pub entry: i64,
}

/// One slot of the accessor table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accessor {
    pub ident: String,
    pub setter: bool,
}

#[derive(Debug)]
pub struct Compiled {
    pub program: Program,
    pub accessors: Vec<Accessor>,
    /// Identifiers of the exported locals, in register order of `program.exports`
    pub exports: Vec<String>,
}

// ---------------------------------------------------------------------------
// Eligibility
// ---------------------------------------------------------------------------

/// Whether a statement can start or extend a region
pub fn eligible(stmt: &Stmt) -> bool {
    stmt_ok(stmt, false)
}

fn expr_ok(expr: &Expr) -> bool {
    struct Checker(bool);
    impl Visit for Checker {
        fn visit_expr(&mut self, expr: &Expr) {
            match expr {
                Expr::Vararg | Expr::Interp(_) => self.0 = false,
                Expr::Binary {
                    op: BinOp::IDiv, ..
                } => self.0 = false,
                _ => walk_expr(self, expr),
            }
        }

        fn visit_function(&mut self, _func: &FunctionBody) {
            self.0 = false;
        }
    }
    let mut checker = Checker(true);
    checker.visit_expr(expr);
    checker.0
}

fn block_ok(block: &Block, in_loop: bool) -> bool {
    block.stmts.iter().all(|s| stmt_ok(s, in_loop))
}

/// `continue` that targets this loop
fn has_continue(block: &Block) -> bool {
    block.stmts.iter().any(|stmt| match stmt {
        Stmt::Continue => true,
        Stmt::Do(inner) => has_continue(inner),
        Stmt::If {
            clauses,
            else_block,
        } => {
            clauses.iter().any(|c| has_continue(&c.body))
                || else_block.as_ref().is_some_and(has_continue)
        }
        _ => false,
    })
}

fn stmt_ok(stmt: &Stmt, in_loop: bool) -> bool {
    match stmt {
        Stmt::Local { exprs, .. } => exprs.iter().all(expr_ok),
        Stmt::Assign { targets, exprs } => {
            let targets_ok = targets.iter().all(|t| matches!(t, Expr::Name(_)))
                || matches!(targets.as_slice(), [Expr::Index { obj, key }] if expr_ok(obj) && expr_ok(key));
            targets_ok && exprs.iter().all(expr_ok)
        }
        Stmt::CompoundAssign {
            op,
            target: Expr::Name(_),
            value,
        } => *op != BinOp::IDiv && expr_ok(value),
        Stmt::Call(call) => expr_ok(call),
        Stmt::Do(block) => block_ok(block, in_loop),
        Stmt::While { cond, body } => expr_ok(cond) && block_ok(body, true),
        Stmt::Repeat { body, cond } => !has_continue(body) && block_ok(body, true) && expr_ok(cond),
        Stmt::If {
            clauses,
            else_block,
        } => {
            clauses
                .iter()
                .all(|c| expr_ok(&c.cond) && block_ok(&c.body, in_loop))
                && else_block.as_ref().map_or(true, |b| block_ok(b, in_loop))
        }
        Stmt::NumericFor {
            start,
            limit,
            step,
            body,
            ..
        } => {
            expr_ok(start)
                && expr_ok(limit)
                && step.as_ref().map_or(true, expr_ok)
                && block_ok(body, true)
        }
        Stmt::GenericFor { exprs, body, .. } => {
            matches!(exprs.first(), Some(Expr::Call { .. } | Expr::Method { .. }))
                && exprs.iter().all(expr_ok)
                && block_ok(body, true)
        }
        Stmt::Break | Stmt::Continue => in_loop,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Code generation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LoopLabels {
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

struct Compiler<'a> {
    /// Identifiers that name enclosing locals even without a resolved binding
    outer: &'a BTreeSet<String>,
    code: Vec<Instr>,
    consts: Vec<Const>,
    const_index: BTreeMap<ConstKey, i64>,
    accessors: Vec<Accessor>,
    accessor_index: BTreeMap<(String, bool), i64>,
    scopes: Vec<Vec<(String, i64)>>,
    loops: Vec<LoopLabels>,
    next_reg: i64,
}

fn unsupported(what: &str) -> ObfuscateError {
    ObfuscateError::Internal(format!("virtualizer reached unsupported {}", what))
}

fn arith(op: BinOp) -> Option<Op> {
    Some(match op {
        BinOp::Add => Op::Add,
        BinOp::Sub => Op::Sub,
        BinOp::Mul => Op::Mul,
        BinOp::Div => Op::Div,
        BinOp::Mod => Op::Mod,
        BinOp::Pow => Op::Pow,
        BinOp::Concat => Op::Concat,
        BinOp::Eq => Op::Eq,
        BinOp::Ne => Op::Ne,
        BinOp::Lt => Op::Lt,
        BinOp::Le => Op::Le,
        BinOp::Gt => Op::Gt,
        BinOp::Ge => Op::Ge,
        BinOp::IDiv | BinOp::And | BinOp::Or => return None,
    })
}

impl<'a> Compiler<'a> {
    fn new(outer: &'a BTreeSet<String>) -> Self {
        Self {
            outer,
            code: Vec::new(),
            consts: Vec::new(),
            const_index: BTreeMap::new(),
            accessors: Vec::new(),
            accessor_index: BTreeMap::new(),
            scopes: vec![Vec::new()],
            loops: Vec::new(),
            next_reg: 1,
        }
    }

    fn emit(&mut self, op: Op, a: i64) -> usize {
        self.emit3(op, a, 0, 0)
    }

    fn emit3(&mut self, op: Op, a: i64, b: i64, c: i64) -> usize {
        self.code.push(Instr { op, a, b, c });
        self.code.len() - 1
    }

    fn here(&self) -> i64 {
        self.code.len() as i64
    }

    /// Point the jump operand of instruction `at` to `target`
    fn patch(&mut self, at: usize, target: i64) {
        let instr = &mut self.code[at];
        match instr.op {
            Op::ForPrep | Op::ForLoop => instr.b = target,
            Op::TForCall => instr.c = target,
            _ => instr.a = target,
        }
    }

    fn constant(&mut self, value: Const) -> i64 {
        let key = match &value {
            Const::Number(n) => ConstKey::Number(n.to_bits()),
            Const::Str(s) => ConstKey::Str(s.clone()),
        };
        if let Some(index) = self.const_index.get(&key) {
            return *index;
        }
        self.consts.push(value);
        let index = self.consts.len() as i64;
        self.const_index.insert(key, index);
        index
    }

    fn string(&mut self, text: &[u8]) -> i64 {
        self.constant(Const::Str(text.to_vec()))
    }

    fn accessor(&mut self, ident: &str, setter: bool) -> i64 {
        let key = (ident.to_string(), setter);
        if let Some(index) = self.accessor_index.get(&key) {
            return *index;
        }
        self.accessors.push(Accessor {
            ident: ident.to_string(),
            setter,
        });
        let index = self.accessors.len() as i64;
        self.accessor_index.insert(key, index);
        index
    }

    fn registers(&mut self, count: i64) -> i64 {
        let base = self.next_reg;
        self.next_reg += count;
        base
    }

    fn declare(&mut self, ident: &str, reg: i64) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.push((ident.to_string(), reg));
        }
    }

    fn register_of(&self, ident: &str) -> Option<i64> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|(name, _)| name == ident)
            .map(|(_, reg)| *reg)
    }

    fn is_outer_local(&self, name: &Name) -> bool {
        name.binding.is_some() || self.outer.contains(&name.ident)
    }

    fn load(&mut self, name: &Name) {
        if let Some(reg) = self.register_of(&name.ident) {
            self.emit(Op::GetR, reg);
        } else if self.is_outer_local(name) {
            let slot = self.accessor(&name.ident, false);
            self.emit(Op::GetU, slot);
        } else {
            let k = self.string(name.ident.as_bytes());
            self.emit(Op::GetG, k);
        }
    }

    fn store(&mut self, name: &Name) {
        if let Some(reg) = self.register_of(&name.ident) {
            self.emit(Op::SetR, reg);
        } else if self.is_outer_local(name) {
            let slot = self.accessor(&name.ident, true);
            self.emit(Op::SetU, slot);
        } else {
            let k = self.string(name.ident.as_bytes());
            self.emit(Op::SetG, k);
        }
    }

    fn scoped(&mut self, block: &Block) -> ObfuscateResult<()> {
        self.scopes.push(Vec::new());
        self.stmts(&block.stmts)?;
        self.scopes.pop();
        Ok(())
    }

    fn stmts(&mut self, stmts: &[Stmt]) -> ObfuscateResult<()> {
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    /// Push exactly `count` values from an expression list
    fn values(&mut self, exprs: &[Expr], count: usize) -> ObfuscateResult<()> {
        if exprs.len() == count {
            for expr in exprs {
                self.expr(expr)?;
            }
            return Ok(());
        }
        self.emit(Op::Mark, 0);
        self.list(exprs)?;
        self.emit(Op::Adj, count as i64);
        Ok(())
    }

    /// Push every value of a list, expanding a trailing call
    fn list(&mut self, exprs: &[Expr]) -> ObfuscateResult<()> {
        for (i, expr) in exprs.iter().enumerate() {
            if i + 1 == exprs.len() {
                self.multi(expr)?;
            } else {
                self.expr(expr)?;
            }
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> ObfuscateResult<()> {
        match stmt {
            Stmt::Local { names, exprs } => {
                self.values(exprs, names.len())?;
                let base = self.registers(names.len() as i64);
                for i in (0..names.len()).rev() {
                    self.emit(Op::SetR, base + i as i64);
                }
                for (i, name) in names.iter().enumerate() {
                    self.declare(&name.ident, base + i as i64);
                }
            }
            Stmt::Assign { targets, exprs } => match targets.as_slice() {
                [Expr::Index { obj, key }] => {
                    self.expr(obj)?;
                    self.expr(key)?;
                    self.values(exprs, 1)?;
                    self.emit(Op::SetT, 0);
                }
                _ => {
                    self.values(exprs, targets.len())?;
                    for target in targets.iter().rev() {
                        let Expr::Name(name) = target else {
                            return Err(unsupported("assignment target"));
                        };
                        self.store(name);
                    }
                }
            },
            Stmt::CompoundAssign { op, target, value } => {
                let Expr::Name(name) = target else {
                    return Err(unsupported("compound assignment target"));
                };
                let op = arith(*op).ok_or_else(|| unsupported("compound operator"))?;
                self.load(name);
                self.expr(value)?;
                self.emit(op, 0);
                self.store(name);
            }
            Stmt::Call(call) => self.call(call, 1)?,
            Stmt::Do(block) => self.scoped(block)?,
            Stmt::While { cond, body } => {
                let start = self.here();
                self.expr(cond)?;
                let exit = self.emit(Op::JmpF, 0);
                self.loops.push(LoopLabels::default());
                self.scoped(body)?;
                self.emit(Op::Jmp, start);
                let labels = self.loops.pop().unwrap_or_default();
                let end = self.here();
                self.patch(exit, end);
                self.close_loop(labels, end, start);
            }
            Stmt::Repeat { body, cond } => {
                let start = self.here();
                self.loops.push(LoopLabels::default());
                self.scopes.push(Vec::new());
                self.stmts(&body.stmts)?;
                self.expr(cond)?;
                self.scopes.pop();
                self.emit(Op::JmpF, start);
                let labels = self.loops.pop().unwrap_or_default();
                let end = self.here();
                self.close_loop(labels, end, start);
            }
            Stmt::If {
                clauses,
                else_block,
            } => {
                let mut ends = Vec::new();
                for (i, clause) in clauses.iter().enumerate() {
                    self.expr(&clause.cond)?;
                    let skip = self.emit(Op::JmpF, 0);
                    self.scoped(&clause.body)?;
                    if i + 1 < clauses.len() || else_block.is_some() {
                        ends.push(self.emit(Op::Jmp, 0));
                    }
                    let next = self.here();
                    self.patch(skip, next);
                }
                if let Some(block) = else_block {
                    self.scoped(block)?;
                }
                let end = self.here();
                for at in ends {
                    self.patch(at, end);
                }
            }
            Stmt::NumericFor {
                var,
                start,
                limit,
                step,
                body,
            } => {
                let base = self.registers(4);
                self.expr(start)?;
                self.emit(Op::SetR, base);
                self.expr(limit)?;
                self.emit(Op::SetR, base + 1);
                match step {
                    Some(step) => self.expr(step)?,
                    None => {
                        let one = self.constant(Const::Number(1.0));
                        self.emit(Op::PushK, one);
                    }
                }
                self.emit(Op::SetR, base + 2);
                let prep = self.emit3(Op::ForPrep, base, 0, 0);
                let body_start = self.here();
                self.loops.push(LoopLabels::default());
                self.scopes.push(vec![(var.ident.clone(), base + 3)]);
                self.stmts(&body.stmts)?;
                self.scopes.pop();
                let step_at = self.here();
                self.emit3(Op::ForLoop, base, body_start, 0);
                let labels = self.loops.pop().unwrap_or_default();
                let end = self.here();
                self.patch(prep, end);
                self.close_loop(labels, end, step_at);
            }
            Stmt::GenericFor { names, exprs, body } => {
                let base = self.registers(3 + names.len() as i64);
                self.values(exprs, 3)?;
                self.emit(Op::TForPrep, base);
                let call_at = self.emit3(Op::TForCall, base, names.len() as i64, 0);
                self.loops.push(LoopLabels::default());
                let vars = names
                    .iter()
                    .enumerate()
                    .map(|(i, n)| (n.ident.clone(), base + 3 + i as i64))
                    .collect();
                self.scopes.push(vars);
                self.stmts(&body.stmts)?;
                self.scopes.pop();
                self.emit(Op::Jmp, call_at as i64);
                let labels = self.loops.pop().unwrap_or_default();
                let end = self.here();
                self.patch(call_at, end);
                self.close_loop(labels, end, call_at as i64);
            }
            Stmt::Break => {
                let at = self.emit(Op::Jmp, 0);
                self.loops
                    .last_mut()
                    .ok_or_else(|| unsupported("break outside a loop"))?
                    .breaks
                    .push(at);
            }
            Stmt::Continue => {
                let at = self.emit(Op::Jmp, 0);
                self.loops
                    .last_mut()
                    .ok_or_else(|| unsupported("continue outside a loop"))?
                    .continues
                    .push(at);
            }
            Stmt::LocalFunction { .. } | Stmt::Return(_) => return Err(unsupported("statement")),
        }
        Ok(())
    }

    fn close_loop(&mut self, labels: LoopLabels, end: i64, again: i64) {
        for at in labels.breaks {
            self.patch(at, end);
        }
        for at in labels.continues {
            self.patch(at, again);
        }
    }

    /// Compile a call leaving `results - 1` values, or all of them when `results` is 0
    fn call(&mut self, expr: &Expr, results: i64) -> ObfuscateResult<()> {
        self.emit(Op::Mark, 0);
        match expr {
            Expr::Call { func, args } => {
                self.expr(func)?;
                self.list(args)?;
            }
            Expr::Method { obj, method, args } => {
                self.expr(obj)?;
                let k = self.string(method.as_bytes());
                self.emit(Op::SelfK, k);
                self.list(args)?;
            }
            _ => return Err(unsupported("call shape")),
        }
        self.emit(Op::Call, results);
        Ok(())
    }

    /// Push all values of an expression
    fn multi(&mut self, expr: &Expr) -> ObfuscateResult<()> {
        match expr {
            Expr::Call { .. } | Expr::Method { .. } => self.call(expr, 0),
            _ => self.expr(expr),
        }
    }

    /// Push exactly one value
    fn expr(&mut self, expr: &Expr) -> ObfuscateResult<()> {
        match expr {
            Expr::Nil => {
                self.emit(Op::LoadV, 0);
            }
            Expr::True => {
                self.emit(Op::LoadV, 1);
            }
            Expr::False => {
                self.emit(Op::LoadV, 2);
            }
            Expr::Number(n) => {
                let k = self.constant(Const::Number(*n));
                self.emit(Op::PushK, k);
            }
            Expr::Str(bytes) => {
                let k = self.string(bytes);
                self.emit(Op::PushK, k);
            }
            Expr::Name(name) => self.load(name),
            Expr::Index { obj, key } => {
                self.expr(obj)?;
                self.expr(key)?;
                self.emit(Op::GetT, 0);
            }
            Expr::Call { .. } | Expr::Method { .. } => self.call(expr, 2)?,
            Expr::Table(fields) => self.table(fields)?,
            Expr::Binary {
                op: op @ (BinOp::And | BinOp::Or),
                lhs,
                rhs,
            } => {
                self.expr(lhs)?;
                let test = if *op == BinOp::And { Op::TestF } else { Op::TestT };
                let skip = self.emit(test, 0);
                self.emit(Op::Pop, 0);
                self.expr(rhs)?;
                let end = self.here();
                self.patch(skip, end);
            }
            Expr::Binary { op, lhs, rhs } => {
                let op = arith(*op).ok_or_else(|| unsupported("operator"))?;
                self.expr(lhs)?;
                self.expr(rhs)?;
                self.emit(op, 0);
            }
            Expr::Unary { op, operand } => {
                self.expr(operand)?;
                let op = match op {
                    UnOp::Neg => Op::Unm,
                    UnOp::Not => Op::Not,
                    UnOp::Len => Op::Len,
                };
                self.emit(op, 0);
            }
            Expr::Paren(inner) => self.expr(inner)?,
            Expr::IfElse { clauses, else_expr } => {
                let mut ends = Vec::new();
                for (cond, value) in clauses {
                    self.expr(cond)?;
                    let skip = self.emit(Op::JmpF, 0);
                    self.expr(value)?;
                    ends.push(self.emit(Op::Jmp, 0));
                    let next = self.here();
                    self.patch(skip, next);
                }
                self.expr(else_expr)?;
                let end = self.here();
                for at in ends {
                    self.patch(at, end);
                }
            }
            Expr::Vararg | Expr::Interp(_) | Expr::Function(_) => {
                return Err(unsupported("expression"))
            }
        }
        Ok(())
    }

    fn table(&mut self, fields: &[TableField]) -> ObfuscateResult<()> {
        self.emit(Op::NewT, 0);
        let mut position = 1;
        for (i, field) in fields.iter().enumerate() {
            match field {
                TableField::Positional(value) if i + 1 == fields.len() && value.is_multi_valued() => {
                    self.emit(Op::Mark, 0);
                    self.multi(value)?;
                    self.emit(Op::TAppendM, position);
                }
                TableField::Positional(value) => {
                    self.expr(value)?;
                    self.emit(Op::TAppend, position);
                    position += 1;
                }
                TableField::Named(name, value) => {
                    let k = self.string(name.as_bytes());
                    self.emit(Op::PushK, k);
                    self.expr(value)?;
                    self.emit(Op::TSetK, 0);
                }
                TableField::Keyed(key, value) => {
                    self.expr(key)?;
                    self.expr(value)?;
                    self.emit(Op::TSetK, 0);
                }
            }
        }
        Ok(())
    }

    /// Top-level locals of the region, last declaration of each identifier
    fn exports(&self) -> Vec<(String, i64)> {
        let mut exports: Vec<(String, i64)> = Vec::new();
        for (ident, reg) in self.scopes.first().into_iter().flatten() {
            exports.retain(|(name, _)| name != ident);
            exports.push((ident.clone(), *reg));
        }
        exports
    }
}

/// Assign slots and encode every word
fn layout(code: &[Instr], isa: &Isa, rng: &mut Entropy) -> (Vec<i64>, i64) {
    let n = code.len();
    let mut slots: Vec<i64> = (1..=n as i64).collect();
    if isa.permute_slots {
        rng.shuffle(&mut slots);
    }
    let target = |index: i64| -> i64 {
        usize::try_from(index)
            .ok()
            .and_then(|i| slots.get(i).copied())
            .unwrap_or(0)
    };

    let mut words = vec![0; n * WORDS_PER_SLOT];
    for (i, instr) in code.iter().enumerate() {
        let slot = slots[i];
        let (mut a, mut b, mut c) = (instr.a, instr.b, instr.c);
        match instr.op {
            Op::Jmp | Op::JmpF | Op::TestF | Op::TestT => a = target(a),
            Op::ForPrep | Op::ForLoop => b = target(b),
            Op::TForCall => c = target(c),
            _ => {}
        }
        let next = target(i as i64 + 1);
        let raw = [isa.code(instr.op), a, b, c, next];
        let base = (slot as usize - 1) * WORDS_PER_SLOT;
        for (offset, word) in raw.into_iter().enumerate() {
            words[base + offset] = isa.word_key.encode(word, slot, offset as i64);
        }
    }
    (words, target(0))
}

/// Compile a region against one instruction set
pub fn compile(
    stmts: &[Stmt],
    isa: &Isa,
    outer: &BTreeSet<String>,
    rng: &mut Entropy,
) -> ObfuscateResult<Compiled> {
    let mut compiler = Compiler::new(outer);
    compiler.stmts(stmts)?;
    let exports = compiler.exports();
    let (words, entry) = layout(&compiler.code, isa, rng);
    Ok(Compiled {
        program: Program {
            words,
            consts: compiler.consts,
            exports: exports.iter().map(|(_, reg)| *reg).collect(),
            entry,
        },
        accessors: compiler.accessors,
        exports: exports.into_iter().map(|(ident, _)| ident).collect(),
    })
}
