//! Abstract syntax tree for Lua 5.1 / Luau
//!
//! Luau type annotations are dropped by the parser and never appear here.
//! `function a.b:c() end` statements are lowered to plain assignments, so
//! the tree only carries constructs with distinct runtime meaning.

/// Identity of one declared variable, assigned by the scope resolver
pub type BindingId = u32;

/// An identifier occurrence; `binding` is `None` for globals or before resolution
#[derive(Debug, Clone, PartialEq)]
pub struct Name {
    pub ident: String,
    pub binding: Option<BindingId>,
}

impl Name {
    pub fn new(ident: impl Into<String>) -> Self {
        Self {
            ident: ident.into(),
            binding: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    /// Made up by the engine rather than parsed; passes that add code in
    /// proportion to what they find leave such blocks alone
    pub synthetic: bool,
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.stmts == other.stmts
    }
}

impl Block {
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self {
            stmts,
            synthetic: false,
        }
    }

    pub fn synthetic(stmts: Vec<Stmt>) -> Self {
        Self {
            stmts,
            synthetic: true,
        }
    }

    /// Whether the block ends in a statement that must stay last
    pub fn ends_with_terminator(&self) -> bool {
        matches!(
            self.stmts.last(),
            Some(Stmt::Return(_) | Stmt::Break | Stmt::Continue)
        )
    }

    /// Index before which new statements may be inserted at the end
    pub fn insertion_limit(&self) -> usize {
        if self.ends_with_terminator() {
            self.stmts.len() - 1
        } else {
            self.stmts.len()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionBody {
    pub params: Vec<Name>,
    pub is_vararg: bool,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfClause {
    pub cond: Expr,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Local {
        names: Vec<Name>,
        exprs: Vec<Expr>,
    },
    LocalFunction {
        name: Name,
        func: FunctionBody,
    },
    Assign {
        targets: Vec<Expr>,
        exprs: Vec<Expr>,
    },
    /// Luau `target op= value`
    CompoundAssign {
        op: BinOp,
        target: Expr,
        value: Expr,
    },
    /// A call used as a statement (`Expr::Call` or `Expr::Method`)
    Call(Expr),
    Do(Block),
    While {
        cond: Expr,
        body: Block,
    },
    Repeat {
        body: Block,
        cond: Expr,
    },
    If {
        clauses: Vec<IfClause>,
        else_block: Option<Block>,
    },
    NumericFor {
        var: Name,
        start: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Block,
    },
    GenericFor {
        names: Vec<Name>,
        exprs: Vec<Expr>,
        body: Block,
    },
    Return(Vec<Expr>),
    Break,
    Continue,
}

impl Stmt {
    /// Whether every block the statement carries was made up by the engine
    pub fn is_synthetic(&self) -> bool {
        match self {
            Stmt::Do(body) | Stmt::While { body, .. } => body.synthetic,
            Stmt::LocalFunction { func, .. } => func.body.synthetic,
            Stmt::If {
                clauses,
                else_block,
            } => {
                clauses.iter().all(|c| c.body.synthetic)
                    && else_block.as_ref().map_or(true, |b| b.synthetic)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::IDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "^",
            BinOp::Concat => "..",
            BinOp::Eq => "==",
            BinOp::Ne => "~=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }

    /// Left and right binding power, as in the reference Lua parser
    pub fn precedence(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 1),
            BinOp::And => (2, 2),
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => (3, 3),
            BinOp::Concat => (9, 8),
            BinOp::Add | BinOp::Sub => (10, 10),
            BinOp::Mul | BinOp::Div | BinOp::IDiv | BinOp::Mod => (11, 11),
            BinOp::Pow => (14, 13),
        }
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::IDiv | BinOp::Mod | BinOp::Pow
        )
    }
}

/// Binding power of unary operators
pub const UNARY_PRIORITY: u8 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnOp {
    Neg,
    Not,
    Len,
}

impl UnOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Not => "not ",
            UnOp::Len => "#",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableField {
    Positional(Expr),
    Named(String, Expr),
    Keyed(Expr, Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InterpPart {
    Text(Vec<u8>),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Nil,
    True,
    False,
    Vararg,
    Number(f64),
    Str(Vec<u8>),
    /// Luau backtick string
    Interp(Vec<InterpPart>),
    Function(Box<FunctionBody>),
    Name(Name),
    Index {
        obj: Box<Expr>,
        key: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
    },
    Method {
        obj: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    Table(Vec<TableField>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    /// Explicit parentheses; they truncate multiple results to one
    Paren(Box<Expr>),
    /// Luau `if c then a elseif d then b else e`
    IfElse {
        clauses: Vec<(Expr, Expr)>,
        else_expr: Box<Expr>,
    },
}

impl Expr {
    pub fn name(ident: impl Into<String>) -> Self {
        Expr::Name(Name::new(ident))
    }

    pub fn string(text: &str) -> Self {
        Expr::Str(text.as_bytes().to_vec())
    }

    pub fn field(obj: Expr, key: &str) -> Self {
        Expr::Index {
            obj: Box::new(obj),
            key: Box::new(Expr::string(key)),
        }
    }

    pub fn index(obj: Expr, key: Expr) -> Self {
        Expr::Index {
            obj: Box::new(obj),
            key: Box::new(key),
        }
    }

    pub fn call(func: Expr, args: Vec<Expr>) -> Self {
        Expr::Call {
            func: Box::new(func),
            args,
        }
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn unary(op: UnOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn paren(inner: Expr) -> Self {
        Expr::Paren(Box::new(inner))
    }

    /// Calls and `...` may produce any number of values
    pub fn is_multi_valued(&self) -> bool {
        matches!(self, Expr::Call { .. } | Expr::Method { .. } | Expr::Vararg)
    }

    /// Evaluating this expression can neither fail nor run user code
    pub fn is_pure(&self) -> bool {
        match self {
            Expr::Nil | Expr::True | Expr::False | Expr::Number(_) | Expr::Str(_) => true,
            Expr::Name(name) => name.binding.is_some(),
            Expr::Paren(inner) => inner.is_pure(),
            _ => false,
        }
    }
}

/// A whole source file
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Chunk {
    pub block: Block,
}

// ---------------------------------------------------------------------------
// Traversal
// ---------------------------------------------------------------------------

/// Mutable traversal; override a method and call the matching `walk_*` to recurse
pub trait VisitMut {
    fn visit_block(&mut self, block: &mut Block) {
        walk_block_mut(self, block);
    }

    fn visit_stmt(&mut self, stmt: &mut Stmt) {
        walk_stmt_mut(self, stmt);
    }

    fn visit_expr(&mut self, expr: &mut Expr) {
        walk_expr_mut(self, expr);
    }

    fn visit_function(&mut self, func: &mut FunctionBody) {
        walk_function_mut(self, func);
    }

    fn visit_name(&mut self, _name: &mut Name) {}
}

pub fn walk_block_mut<V: VisitMut + ?Sized>(v: &mut V, block: &mut Block) {
    for stmt in &mut block.stmts {
        v.visit_stmt(stmt);
    }
}

pub fn walk_function_mut<V: VisitMut + ?Sized>(v: &mut V, func: &mut FunctionBody) {
    for param in &mut func.params {
        v.visit_name(param);
    }
    v.visit_block(&mut func.body);
}

pub fn walk_stmt_mut<V: VisitMut + ?Sized>(v: &mut V, stmt: &mut Stmt) {
    match stmt {
        Stmt::Local { names, exprs } => {
            for expr in exprs {
                v.visit_expr(expr);
            }
            for name in names {
                v.visit_name(name);
            }
        }
        Stmt::LocalFunction { name, func } => {
            v.visit_name(name);
            v.visit_function(func);
        }
        Stmt::Assign { targets, exprs } => {
            for expr in exprs {
                v.visit_expr(expr);
            }
            for target in targets {
                v.visit_expr(target);
            }
        }
        Stmt::CompoundAssign { target, value, .. } => {
            v.visit_expr(target);
            v.visit_expr(value);
        }
        Stmt::Call(call) => v.visit_expr(call),
        Stmt::Do(block) => v.visit_block(block),
        Stmt::While { cond, body } => {
            v.visit_expr(cond);
            v.visit_block(body);
        }
        Stmt::Repeat { body, cond } => {
            v.visit_block(body);
            v.visit_expr(cond);
        }
        Stmt::If {
            clauses,
            else_block,
        } => {
            for clause in clauses {
                v.visit_expr(&mut clause.cond);
                v.visit_block(&mut clause.body);
            }
            if let Some(block) = else_block {
                v.visit_block(block);
            }
        }
        Stmt::NumericFor {
            var,
            start,
            limit,
            step,
            body,
        } => {
            v.visit_expr(start);
            v.visit_expr(limit);
            if let Some(step) = step {
                v.visit_expr(step);
            }
            v.visit_name(var);
            v.visit_block(body);
        }
        Stmt::GenericFor { names, exprs, body } => {
            for expr in exprs {
                v.visit_expr(expr);
            }
            for name in names {
                v.visit_name(name);
            }
            v.visit_block(body);
        }
        Stmt::Return(exprs) => {
            for expr in exprs {
                v.visit_expr(expr);
            }
        }
        Stmt::Break | Stmt::Continue => {}
    }
}

pub fn walk_expr_mut<V: VisitMut + ?Sized>(v: &mut V, expr: &mut Expr) {
    match expr {
        Expr::Nil
        | Expr::True
        | Expr::False
        | Expr::Vararg
        | Expr::Number(_)
        | Expr::Str(_) => {}
        Expr::Interp(parts) => {
            for part in parts {
                if let InterpPart::Expr(e) = part {
                    v.visit_expr(e);
                }
            }
        }
        Expr::Function(func) => v.visit_function(func),
        Expr::Name(name) => v.visit_name(name),
        Expr::Index { obj, key } => {
            v.visit_expr(obj);
            v.visit_expr(key);
        }
        Expr::Call { func, args } => {
            v.visit_expr(func);
            for arg in args {
                v.visit_expr(arg);
            }
        }
        Expr::Method { obj, args, .. } => {
            v.visit_expr(obj);
            for arg in args {
                v.visit_expr(arg);
            }
        }
        Expr::Table(fields) => {
            for field in fields {
                match field {
                    TableField::Positional(value) | TableField::Named(_, value) => {
                        v.visit_expr(value)
                    }
                    TableField::Keyed(key, value) => {
                        v.visit_expr(key);
                        v.visit_expr(value);
                    }
                }
            }
        }
        Expr::Binary { lhs, rhs, .. } => {
            v.visit_expr(lhs);
            v.visit_expr(rhs);
        }
        Expr::Unary { operand, .. } => v.visit_expr(operand),
        Expr::Paren(inner) => v.visit_expr(inner),
        Expr::IfElse {
            clauses,
            else_expr,
        } => {
            for (cond, value) in clauses {
                v.visit_expr(cond);
                v.visit_expr(value);
            }
            v.visit_expr(else_expr);
        }
    }
}

/// Read-only traversal, mirroring [`VisitMut`]
pub trait Visit {
    fn visit_block(&mut self, block: &Block) {
        walk_block(self, block);
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        walk_expr(self, expr);
    }

    fn visit_function(&mut self, func: &FunctionBody) {
        walk_function(self, func);
    }

    fn visit_name(&mut self, _name: &Name) {}
}

pub fn walk_block<V: Visit + ?Sized>(v: &mut V, block: &Block) {
    for stmt in &block.stmts {
        v.visit_stmt(stmt);
    }
}

pub fn walk_function<V: Visit + ?Sized>(v: &mut V, func: &FunctionBody) {
    for param in &func.params {
        v.visit_name(param);
    }
    v.visit_block(&func.body);
}

pub fn walk_stmt<V: Visit + ?Sized>(v: &mut V, stmt: &Stmt) {
    match stmt {
        Stmt::Local { names, exprs } => {
            for expr in exprs {
                v.visit_expr(expr);
            }
            for name in names {
                v.visit_name(name);
            }
        }
        Stmt::LocalFunction { name, func } => {
            v.visit_name(name);
            v.visit_function(func);
        }
        Stmt::Assign { targets, exprs } => {
            for expr in exprs {
                v.visit_expr(expr);
            }
            for target in targets {
                v.visit_expr(target);
            }
        }
        Stmt::CompoundAssign { target, value, .. } => {
            v.visit_expr(target);
            v.visit_expr(value);
        }
        Stmt::Call(call) => v.visit_expr(call),
        Stmt::Do(block) => v.visit_block(block),
        Stmt::While { cond, body } => {
            v.visit_expr(cond);
            v.visit_block(body);
        }
        Stmt::Repeat { body, cond } => {
            v.visit_block(body);
            v.visit_expr(cond);
        }
        Stmt::If {
            clauses,
            else_block,
        } => {
            for clause in clauses {
                v.visit_expr(&clause.cond);
                v.visit_block(&clause.body);
            }
            if let Some(block) = else_block {
                v.visit_block(block);
            }
        }
        Stmt::NumericFor {
            var,
            start,
            limit,
            step,
            body,
        } => {
            v.visit_expr(start);
            v.visit_expr(limit);
            if let Some(step) = step {
                v.visit_expr(step);
            }
            v.visit_name(var);
            v.visit_block(body);
        }
        Stmt::GenericFor { names, exprs, body } => {
            for expr in exprs {
                v.visit_expr(expr);
            }
            for name in names {
                v.visit_name(name);
            }
            v.visit_block(body);
        }
        Stmt::Return(exprs) => {
            for expr in exprs {
                v.visit_expr(expr);
            }
        }
        Stmt::Break | Stmt::Continue => {}
    }
}

pub fn walk_expr<V: Visit + ?Sized>(v: &mut V, expr: &Expr) {
    match expr {
        Expr::Nil
        | Expr::True
        | Expr::False
        | Expr::Vararg
        | Expr::Number(_)
        | Expr::Str(_) => {}
        Expr::Interp(parts) => {
            for part in parts {
                if let InterpPart::Expr(e) = part {
                    v.visit_expr(e);
                }
            }
        }
        Expr::Function(func) => v.visit_function(func),
        Expr::Name(name) => v.visit_name(name),
        Expr::Index { obj, key } => {
            v.visit_expr(obj);
            v.visit_expr(key);
        }
        Expr::Call { func, args } => {
            v.visit_expr(func);
            for arg in args {
                v.visit_expr(arg);
            }
        }
        Expr::Method { obj, args, .. } => {
            v.visit_expr(obj);
            for arg in args {
                v.visit_expr(arg);
            }
        }
        Expr::Table(fields) => {
            for field in fields {
                match field {
                    TableField::Positional(value) | TableField::Named(_, value) => {
                        v.visit_expr(value)
                    }
                    TableField::Keyed(key, value) => {
                        v.visit_expr(key);
                        v.visit_expr(value);
                    }
                }
            }
        }
        Expr::Binary { lhs, rhs, .. } => {
            v.visit_expr(lhs);
            v.visit_expr(rhs);
        }
        Expr::Unary { operand, .. } => v.visit_expr(operand),
        Expr::Paren(inner) => v.visit_expr(inner),
        Expr::IfElse {
            clauses,
            else_expr,
        } => {
            for (cond, value) in clauses {
                v.visit_expr(cond);
                v.visit_expr(value);
            }
            v.visit_expr(else_expr);
        }
    }
}

/// Collect every identifier spelled anywhere in a block
pub fn collect_identifiers(block: &Block) -> std::collections::BTreeSet<String> {
    struct Collector(std::collections::BTreeSet<String>);
    impl Visit for Collector {
        fn visit_name(&mut self, name: &Name) {
            self.0.insert(name.ident.clone());
        }
    }
    let mut collector = Collector(Default::default());
    collector.visit_block(block);
    collector.0
}

/// Whether a block (including nested functions) contains a function literal
pub fn contains_function(block: &Block) -> bool {
    struct Finder(bool);
    impl Visit for Finder {
        fn visit_function(&mut self, _func: &FunctionBody) {
            self.0 = true;
        }
    }
    let mut finder = Finder(false);
    finder.visit_block(block);
    finder.0
}

/// Whether `break`/`continue` escape this block to an enclosing loop
pub fn has_loop_exit(block: &Block) -> bool {
    block.stmts.iter().any(|stmt| match stmt {
        Stmt::Break | Stmt::Continue => true,
        Stmt::Do(inner) => has_loop_exit(inner),
        Stmt::If {
            clauses,
            else_block,
        } => {
            clauses.iter().any(|c| has_loop_exit(&c.body))
                || else_block.as_ref().is_some_and(has_loop_exit)
        }
        _ => false,
    })
}

/// Whether a block contains a `return` outside nested functions
pub fn has_return(block: &Block) -> bool {
    block.stmts.iter().any(|stmt| match stmt {
        Stmt::Return(_) => true,
        Stmt::Do(inner) => has_return(inner),
        Stmt::While { body, .. } | Stmt::Repeat { body, .. } => has_return(body),
        Stmt::NumericFor { body, .. } | Stmt::GenericFor { body, .. } => has_return(body),
        Stmt::If {
            clauses,
            else_block,
        } => {
            clauses.iter().any(|c| has_return(&c.body))
                || else_block.as_ref().is_some_and(has_return)
        }
        _ => false,
    })
}
