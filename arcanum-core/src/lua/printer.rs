//! Render an AST back to Lua source
//!
//! Output is compact: one statement per line, no indentation, every string
//! literal double-quoted with decimal escapes for anything outside printable
//! ASCII. Parentheses are inserted wherever the tree shape would otherwise
//! be re-parsed differently.

use std::collections::BTreeSet;

use super::ast::*;
use super::token::Token;

/// Emission options
#[derive(Debug, Clone, Default)]
pub struct PrintOptions {
    /// String literals written with every byte as a decimal escape
    pub escaped: BTreeSet<Vec<u8>>,
}

/// Render a whole chunk
pub fn print_chunk(chunk: &Chunk) -> String {
    print_chunk_with(chunk, &PrintOptions::default())
}

pub fn print_chunk_with(chunk: &Chunk, options: &PrintOptions) -> String {
    let mut printer = Printer::new(options);
    printer.block(&chunk.block);
    printer.out
}

/// Render a single expression (used by tests and diagnostics)
pub fn print_expr(expr: &Expr) -> String {
    let options = PrintOptions::default();
    let mut printer = Printer::new(&options);
    printer.expr(expr);
    printer.out
}

/// Whether `text` can be written as a bare identifier
pub fn is_identifier(text: &[u8]) -> bool {
    let Some((&first, rest)) = text.split_first() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return false;
    }
    if !rest.iter().all(|c| c.is_ascii_alphanumeric() || *c == b'_') {
        return false;
    }
    std::str::from_utf8(text).is_ok_and(|word| !Token::is_reserved(word))
}

/// Quote bytes as a Lua string literal using decimal escapes
pub fn quote_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\{:03}", b)),
        }
    }
    out.push('"');
    out
}

/// Quote bytes with every byte written as a decimal escape
pub fn quote_escaped(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4 + 2);
    out.push('"');
    for &b in bytes {
        out.push_str(&format!("\\{}", b));
    }
    out.push('"');
    out
}

/// Format a number so that Lua reads back exactly the same double
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "(0/0)".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "(1/0)" } else { "(-1/0)" }.to_string();
    }
    if n == 0.0 && n.is_sign_negative() {
        return "(-0)".to_string();
    }
    let text = if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        format!("{}", n as i64)
    } else {
        format!("{:?}", n)
    };
    if n < 0.0 {
        format!("({})", text)
    } else {
        text
    }
}

struct Printer<'a> {
    out: String,
    options: &'a PrintOptions,
}

/// How tightly an expression binds on its right edge
fn right_binding(expr: &Expr) -> u8 {
    match expr {
        Expr::Binary { op, .. } => op.precedence().1,
        Expr::Unary { .. } => UNARY_PRIORITY,
        Expr::IfElse { .. } => 0,
        _ => u8::MAX,
    }
}

/// How tightly an expression binds on its left edge
fn left_binding(expr: &Expr) -> u8 {
    match expr {
        Expr::Binary { op, .. } => op.precedence().0,
        Expr::IfElse { .. } => 0,
        _ => u8::MAX,
    }
}

fn is_prefix(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Name(_) | Expr::Index { .. } | Expr::Call { .. } | Expr::Method { .. } | Expr::Paren(_)
    )
}

impl<'a> Printer<'a> {
    fn new(options: &'a PrintOptions) -> Self {
        Self {
            out: String::new(),
            options,
        }
    }

    /// Append text, separating tokens that would otherwise merge
    fn push(&mut self, text: &str) {
        if let (Some(last), Some(first)) = (self.out.chars().last(), text.chars().next()) {
            let word = |c: char| c.is_ascii_alphanumeric() || c == '_';
            if (word(last) && word(first)) || (last == '-' && first == '-') {
                self.out.push(' ');
            }
        }
        self.out.push_str(text);
    }

    fn block(&mut self, block: &Block) {
        for (i, stmt) in block.stmts.iter().enumerate() {
            if !self.out.is_empty() && !self.out.ends_with('\n') {
                self.out.push('\n');
            }
            let start = self.out.len();
            self.stmt(stmt);
            // `a = b\n(f)()` would read as a call of `b`
            if i > 0 && self.out[start..].starts_with('(') {
                self.out.insert(start - 1, ';');
            }
        }
        if !block.stmts.is_empty() {
            self.out.push('\n');
        }
    }

    fn names(&mut self, names: &[Name]) {
        for (i, name) in names.iter().enumerate() {
            if i > 0 {
                self.push(",");
            }
            self.push(&name.ident);
        }
    }

    fn expr_list(&mut self, exprs: &[Expr]) {
        for (i, expr) in exprs.iter().enumerate() {
            if i > 0 {
                self.push(",");
            }
            self.expr(expr);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Local { names, exprs } => {
                self.push("local");
                self.names(names);
                if !exprs.is_empty() {
                    self.push("=");
                    self.expr_list(exprs);
                }
            }
            Stmt::LocalFunction { name, func } => {
                self.push("local function");
                self.push(&name.ident);
                self.function_tail(func);
            }
            Stmt::Assign { targets, exprs } => {
                self.expr_list(targets);
                self.push("=");
                self.expr_list(exprs);
            }
            Stmt::CompoundAssign { op, target, value } => {
                self.expr(target);
                self.push(" ");
                self.push(op.symbol());
                self.push("= ");
                self.expr(value);
            }
            Stmt::Call(call) => self.expr(call),
            Stmt::Do(body) => {
                self.push("do");
                self.nested(body);
                self.push("end");
            }
            Stmt::While { cond, body } => {
                self.push("while");
                self.expr(cond);
                self.push("do");
                self.nested(body);
                self.push("end");
            }
            Stmt::Repeat { body, cond } => {
                self.push("repeat");
                self.nested(body);
                self.push("until");
                self.expr(cond);
            }
            Stmt::If {
                clauses,
                else_block,
            } => {
                for (i, clause) in clauses.iter().enumerate() {
                    self.push(if i == 0 { "if" } else { "elseif" });
                    self.expr(&clause.cond);
                    self.push("then");
                    self.nested(&clause.body);
                }
                if let Some(body) = else_block {
                    self.push("else");
                    self.nested(body);
                }
                self.push("end");
            }
            Stmt::NumericFor {
                var,
                start,
                limit,
                step,
                body,
            } => {
                self.push("for");
                self.push(&var.ident);
                self.push("=");
                self.expr(start);
                self.push(",");
                self.expr(limit);
                if let Some(step) = step {
                    self.push(",");
                    self.expr(step);
                }
                self.push("do");
                self.nested(body);
                self.push("end");
            }
            Stmt::GenericFor { names, exprs, body } => {
                self.push("for");
                self.names(names);
                self.push("in");
                self.expr_list(exprs);
                self.push("do");
                self.nested(body);
                self.push("end");
            }
            Stmt::Return(exprs) => {
                self.push("return");
                self.expr_list(exprs);
            }
            Stmt::Break => self.push("break"),
            Stmt::Continue => self.push("continue"),
        }
    }

    fn nested(&mut self, body: &Block) {
        self.out.push('\n');
        self.block(body);
    }

    fn function_tail(&mut self, func: &FunctionBody) {
        self.push("(");
        self.names(&func.params);
        if func.is_vararg {
            if !func.params.is_empty() {
                self.push(",");
            }
            self.push("...");
        }
        self.push(")");
        self.nested(&func.body);
        self.push("end");
    }

    fn operand(&mut self, expr: &Expr, parens: bool) {
        if parens {
            self.push("(");
            self.expr(expr);
            self.push(")");
        } else {
            self.expr(expr);
        }
    }

    fn prefix(&mut self, expr: &Expr) {
        let parens = !is_prefix(expr);
        self.operand(expr, parens);
    }

    fn args(&mut self, args: &[Expr]) {
        self.push("(");
        self.expr_list(args);
        self.push(")");
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Nil => self.push("nil"),
            Expr::True => self.push("true"),
            Expr::False => self.push("false"),
            Expr::Vararg => self.push("..."),
            Expr::Number(n) => self.push(&format_number(*n)),
            Expr::Str(bytes) if self.options.escaped.contains(bytes) => {
                self.push(&quote_escaped(bytes))
            }
            Expr::Str(bytes) => self.push(&quote_string(bytes)),
            Expr::Interp(parts) => self.interpolation(parts),
            Expr::Function(func) => {
                self.push("function");
                self.function_tail(func);
            }
            Expr::Name(name) => self.push(&name.ident),
            Expr::Index { obj, key } => {
                self.prefix(obj);
                match &**key {
                    Expr::Str(bytes)
                        if is_identifier(bytes) && !self.options.escaped.contains(bytes) =>
                    {
                        self.push(".");
                        self.push(&String::from_utf8_lossy(bytes));
                    }
                    other => {
                        self.push("[");
                        self.expr(other);
                        self.push("]");
                    }
                }
            }
            Expr::Call { func, args } => {
                self.prefix(func);
                self.args(args);
            }
            Expr::Method { obj, method, args } => {
                self.prefix(obj);
                self.push(":");
                self.push(method);
                self.args(args);
            }
            Expr::Table(fields) => {
                self.push("{");
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        self.push(",");
                    }
                    match field {
                        TableField::Positional(value) => self.expr(value),
                        TableField::Named(key, value)
                            if self.options.escaped.contains(key.as_bytes()) =>
                        {
                            self.push("[");
                            self.push(&quote_escaped(key.as_bytes()));
                            self.push("]=");
                            self.expr(value);
                        }
                        TableField::Named(key, value) => {
                            self.push(key);
                            self.push("=");
                            self.expr(value);
                        }
                        TableField::Keyed(key, value) => {
                            self.push("[");
                            self.expr(key);
                            self.push("]=");
                            self.expr(value);
                        }
                    }
                }
                self.push("}");
            }
            Expr::Binary { op, lhs, rhs } => {
                let (left, right) = op.precedence();
                let lhs_parens = matches!(**lhs, Expr::IfElse { .. }) || left > right_binding(lhs);
                let rhs_parens = matches!(**rhs, Expr::IfElse { .. }) || left_binding(rhs) <= right;
                self.operand(lhs, lhs_parens);
                self.push(" ");
                self.push(op.symbol());
                self.push(" ");
                self.operand(rhs, rhs_parens);
            }
            Expr::Unary { op, operand } => {
                self.push(op.symbol());
                let parens = match &**operand {
                    Expr::Binary { op, .. } => op.precedence().0 <= UNARY_PRIORITY,
                    Expr::IfElse { .. } => true,
                    _ => false,
                };
                self.operand(operand, parens);
            }
            Expr::Paren(inner) => {
                self.push("(");
                self.expr(inner);
                self.push(")");
            }
            Expr::IfElse {
                clauses,
                else_expr,
            } => {
                for (i, (cond, value)) in clauses.iter().enumerate() {
                    self.push(if i == 0 { "if" } else { "elseif" });
                    self.expr(cond);
                    self.push("then");
                    self.expr(value);
                }
                self.push("else");
                self.expr(else_expr);
            }
        }
    }

    fn interpolation(&mut self, parts: &[InterpPart]) {
        self.push("`");
        for part in parts {
            match part {
                InterpPart::Text(bytes) => {
                    for &b in bytes {
                        match b {
                            b'`' | b'{' | b'\\' => {
                                self.out.push('\\');
                                self.out.push(b as char);
                            }
                            0x20..=0x7e => self.out.push(b as char),
                            _ => self.out.push_str(&format!("\\{:03}", b)),
                        }
                    }
                }
                InterpPart::Expr(expr) => {
                    self.out.push('{');
                    self.expr(expr);
                    self.out.push('}');
                }
            }
        }
        self.out.push('`');
    }
}
