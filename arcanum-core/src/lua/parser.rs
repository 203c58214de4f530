//! Recursive-descent parser for Lua 5.1 with the Luau extensions seen in practice
//!
//! Type annotations, casts, generic parameter lists and `type` declarations
//! are consumed and discarded; they carry no runtime meaning.

use super::ast::*;
use super::lexer::Lexer;
use super::token::{InterpSegment, Spanned, Token};
use crate::error::SyntaxError;

/// Parse a complete source file
pub fn parse(source: &str) -> Result<Chunk, SyntaxError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser::new(tokens);
    let block = parser.block()?;
    parser.expect_eof()?;
    Ok(Chunk { block })
}

/// Parse a single expression (used for interpolated string segments)
pub fn parse_expression_at(source: &str, line: u32, column: u32) -> Result<Expr, SyntaxError> {
    let tokens = Lexer::with_position(source, line, column).tokenize()?;
    let mut parser = Parser::new(tokens);
    let expr = parser.expr()?;
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Spanned>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn current(&self) -> &Spanned {
        // The token stream always ends with Eof, and we never advance past it
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &Token {
        &self.current().token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let index = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[index].token
    }

    fn advance(&mut self) -> Token {
        let token = self.current().token.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn accept(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_here(&self, message: impl Into<String>) -> SyntaxError {
        let at = self.current();
        SyntaxError::new(at.line, at.column, message)
    }

    fn unexpected(&self) -> SyntaxError {
        self.error_here(format!("unexpected symbol near {}", self.peek()))
    }

    fn expect(&mut self, token: Token) -> Result<(), SyntaxError> {
        if self.accept(&token) {
            Ok(())
        } else {
            Err(self.error_here(format!("{} expected near {}", token, self.peek())))
        }
    }

    fn expect_closing(&mut self, token: Token, opener: &str, line: u32) -> Result<(), SyntaxError> {
        if self.accept(&token) {
            return Ok(());
        }
        let message = if self.current().line == line {
            format!("{} expected near {}", token, self.peek())
        } else {
            format!(
                "{} expected (to close '{}' at line {}) near {}",
                token,
                opener,
                line,
                self.peek()
            )
        };
        Err(self.error_here(message))
    }

    fn expect_eof(&mut self) -> Result<(), SyntaxError> {
        if self.check(&Token::Eof) {
            Ok(())
        } else {
            Err(self.error_here(format!("end of input expected near {}", self.peek())))
        }
    }

    fn expect_name(&mut self) -> Result<String, SyntaxError> {
        match self.peek().clone() {
            Token::Name(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error_here(format!("name expected near {}", other))),
        }
    }

    fn is_name(&self, word: &str) -> bool {
        matches!(self.peek(), Token::Name(n) if n == word)
    }

    fn block_follows(&self) -> bool {
        matches!(
            self.peek(),
            Token::Eof | Token::End | Token::Else | Token::Elseif | Token::Until
        )
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn block(&mut self) -> Result<Block, SyntaxError> {
        let mut stmts = Vec::new();
        loop {
            if self.block_follows() {
                break;
            }
            if self.accept(&Token::Semi) {
                continue;
            }
            if self.check(&Token::Return) {
                self.advance();
                let exprs = if self.block_follows() || self.check(&Token::Semi) {
                    Vec::new()
                } else {
                    self.expr_list()?
                };
                self.accept(&Token::Semi);
                stmts.push(Stmt::Return(exprs));
                if !self.block_follows() {
                    return Err(self.error_here(format!(
                        "'end' expected after return near {}",
                        self.peek()
                    )));
                }
                break;
            }
            if let Some(stmt) = self.statement()? {
                let terminal = matches!(stmt, Stmt::Break | Stmt::Continue);
                stmts.push(stmt);
                if terminal {
                    self.accept(&Token::Semi);
                    if !self.block_follows() {
                        return Err(self.error_here(format!(
                            "'end' expected after loop exit near {}",
                            self.peek()
                        )));
                    }
                    break;
                }
            }
        }
        Ok(Block::new(stmts))
    }

    /// Parse one statement; `None` for declarations with no runtime effect
    fn statement(&mut self) -> Result<Option<Stmt>, SyntaxError> {
        let line = self.current().line;
        let stmt = match self.peek() {
            Token::If => self.if_stmt(line)?,
            Token::While => {
                self.advance();
                let cond = self.expr()?;
                self.expect(Token::Do)?;
                let body = self.block()?;
                self.expect_closing(Token::End, "while", line)?;
                Stmt::While { cond, body }
            }
            Token::Do => {
                self.advance();
                let body = self.block()?;
                self.expect_closing(Token::End, "do", line)?;
                Stmt::Do(body)
            }
            Token::For => self.for_stmt(line)?,
            Token::Repeat => {
                self.advance();
                let body = self.block()?;
                self.expect_closing(Token::Until, "repeat", line)?;
                let cond = self.expr()?;
                Stmt::Repeat { body, cond }
            }
            Token::Function => self.function_stmt(line)?,
            Token::Local => {
                self.advance();
                if self.accept(&Token::Function) {
                    let name = Name::new(self.expect_name()?);
                    let func = self.function_body(line, false)?;
                    Stmt::LocalFunction { name, func }
                } else {
                    self.local_stmt()?
                }
            }
            Token::Break => {
                self.advance();
                Stmt::Break
            }
            Token::Name(word) if word == "continue" && self.continue_follows() => {
                self.advance();
                Stmt::Continue
            }
            Token::Name(word) if word == "type" && self.type_alias_follows(1) => {
                self.advance();
                self.skip_type_alias()?;
                return Ok(None);
            }
            Token::Name(word)
                if word == "export"
                    && matches!(self.peek_at(1), Token::Name(n) if n == "type")
                    && self.type_alias_follows(2) =>
            {
                self.advance();
                self.advance();
                self.skip_type_alias()?;
                return Ok(None);
            }
            _ => self.expr_stmt()?,
        };
        Ok(Some(stmt))
    }

    fn continue_follows(&self) -> bool {
        !matches!(
            self.peek_at(1),
            Token::LParen
                | Token::Dot
                | Token::LBracket
                | Token::Colon
                | Token::Assign
                | Token::Comma
                | Token::Str(_)
                | Token::Interp(_)
                | Token::LBrace
                | Token::PlusAssign
                | Token::MinusAssign
                | Token::StarAssign
                | Token::SlashAssign
                | Token::DoubleSlashAssign
                | Token::PercentAssign
                | Token::CaretAssign
                | Token::ConcatAssign
        )
    }

    fn type_alias_follows(&self, offset: usize) -> bool {
        matches!(self.peek_at(offset), Token::Name(_))
            && matches!(self.peek_at(offset + 1), Token::Assign | Token::Lt)
    }

    fn skip_type_alias(&mut self) -> Result<(), SyntaxError> {
        self.expect_name()?;
        if self.check(&Token::Lt) {
            self.skip_balanced(Token::Lt, Token::Gt)?;
        }
        self.expect(Token::Assign)?;
        self.skip_type()
    }

    fn if_stmt(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        self.advance();
        let mut clauses = Vec::new();
        let cond = self.expr()?;
        self.expect(Token::Then)?;
        let body = self.block()?;
        clauses.push(IfClause { cond, body });
        let mut else_block = None;
        loop {
            if self.accept(&Token::Elseif) {
                let cond = self.expr()?;
                self.expect(Token::Then)?;
                let body = self.block()?;
                clauses.push(IfClause { cond, body });
            } else if self.accept(&Token::Else) {
                else_block = Some(self.block()?);
                self.expect_closing(Token::End, "if", line)?;
                break;
            } else {
                self.expect_closing(Token::End, "if", line)?;
                break;
            }
        }
        Ok(Stmt::If {
            clauses,
            else_block,
        })
    }

    fn for_stmt(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        self.advance();
        let first = Name::new(self.expect_name()?);
        self.skip_optional_annotation()?;
        if self.accept(&Token::Assign) {
            let start = self.expr()?;
            self.expect(Token::Comma)?;
            let limit = self.expr()?;
            let step = if self.accept(&Token::Comma) {
                Some(self.expr()?)
            } else {
                None
            };
            self.expect(Token::Do)?;
            let body = self.block()?;
            self.expect_closing(Token::End, "for", line)?;
            return Ok(Stmt::NumericFor {
                var: first,
                start,
                limit,
                step,
                body,
            });
        }
        let mut names = vec![first];
        while self.accept(&Token::Comma) {
            names.push(Name::new(self.expect_name()?));
            self.skip_optional_annotation()?;
        }
        self.expect(Token::In)?;
        let exprs = self.expr_list()?;
        self.expect(Token::Do)?;
        let body = self.block()?;
        self.expect_closing(Token::End, "for", line)?;
        Ok(Stmt::GenericFor { names, exprs, body })
    }

    fn function_stmt(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        self.advance();
        let mut target = Expr::name(self.expect_name()?);
        let mut is_method = false;
        loop {
            if self.accept(&Token::Dot) {
                let key = self.expect_name()?;
                target = Expr::field(target, &key);
            } else if self.accept(&Token::Colon) {
                let key = self.expect_name()?;
                target = Expr::field(target, &key);
                is_method = true;
                break;
            } else {
                break;
            }
        }
        let func = self.function_body(line, is_method)?;
        Ok(Stmt::Assign {
            targets: vec![target],
            exprs: vec![Expr::Function(Box::new(func))],
        })
    }

    fn local_stmt(&mut self) -> Result<Stmt, SyntaxError> {
        let mut names = Vec::new();
        loop {
            names.push(Name::new(self.expect_name()?));
            self.skip_optional_annotation()?;
            if !self.accept(&Token::Comma) {
                break;
            }
        }
        let exprs = if self.accept(&Token::Assign) {
            self.expr_list()?
        } else {
            Vec::new()
        };
        Ok(Stmt::Local { names, exprs })
    }

    fn expr_stmt(&mut self) -> Result<Stmt, SyntaxError> {
        let first = self.suffixed_expr()?;
        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            let mut targets = vec![first];
            while self.accept(&Token::Comma) {
                targets.push(self.suffixed_expr()?);
            }
            self.expect(Token::Assign)?;
            for target in &targets {
                if !matches!(target, Expr::Name(_) | Expr::Index { .. }) {
                    return Err(self.error_here("syntax error near '=': cannot assign to this expression"));
                }
            }
            let exprs = self.expr_list()?;
            return Ok(Stmt::Assign { targets, exprs });
        }
        let compound = match self.peek() {
            Token::PlusAssign => Some(BinOp::Add),
            Token::MinusAssign => Some(BinOp::Sub),
            Token::StarAssign => Some(BinOp::Mul),
            Token::SlashAssign => Some(BinOp::Div),
            Token::DoubleSlashAssign => Some(BinOp::IDiv),
            Token::PercentAssign => Some(BinOp::Mod),
            Token::CaretAssign => Some(BinOp::Pow),
            Token::ConcatAssign => Some(BinOp::Concat),
            _ => None,
        };
        if let Some(op) = compound {
            if !matches!(first, Expr::Name(_) | Expr::Index { .. }) {
                return Err(self.error_here("cannot assign to this expression"));
            }
            self.advance();
            let value = self.expr()?;
            return Ok(Stmt::CompoundAssign {
                op,
                target: first,
                value,
            });
        }
        match first {
            Expr::Call { .. } | Expr::Method { .. } => Ok(Stmt::Call(first)),
            _ => Err(self.error_here(format!("syntax error near {}", self.peek()))),
        }
    }

    // -----------------------------------------------------------------------
    // Functions
    // -----------------------------------------------------------------------

    fn function_body(&mut self, line: u32, is_method: bool) -> Result<FunctionBody, SyntaxError> {
        if self.check(&Token::Lt) {
            self.skip_balanced(Token::Lt, Token::Gt)?;
        }
        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        if is_method {
            params.push(Name::new("self"));
        }
        let mut is_vararg = false;
        if !self.check(&Token::RParen) {
            loop {
                if self.accept(&Token::Ellipsis) {
                    is_vararg = true;
                    self.skip_optional_annotation()?;
                    break;
                }
                params.push(Name::new(self.expect_name()?));
                self.skip_optional_annotation()?;
                if !self.accept(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        self.skip_optional_annotation()?;
        let body = self.block()?;
        self.expect_closing(Token::End, "function", line)?;
        Ok(FunctionBody {
            params,
            is_vararg,
            body,
        })
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn expr_list(&mut self) -> Result<Vec<Expr>, SyntaxError> {
        let mut exprs = vec![self.expr()?];
        while self.accept(&Token::Comma) {
            exprs.push(self.expr()?);
        }
        Ok(exprs)
    }

    fn expr(&mut self) -> Result<Expr, SyntaxError> {
        self.subexpr(0)
    }

    fn binary_op(&self) -> Option<BinOp> {
        let op = match self.peek() {
            Token::Plus => BinOp::Add,
            Token::Minus => BinOp::Sub,
            Token::Star => BinOp::Mul,
            Token::Slash => BinOp::Div,
            Token::DoubleSlash => BinOp::IDiv,
            Token::Percent => BinOp::Mod,
            Token::Caret => BinOp::Pow,
            Token::Concat => BinOp::Concat,
            Token::EqEq => BinOp::Eq,
            Token::NotEq => BinOp::Ne,
            Token::Lt => BinOp::Lt,
            Token::LtEq => BinOp::Le,
            Token::Gt => BinOp::Gt,
            Token::GtEq => BinOp::Ge,
            Token::And => BinOp::And,
            Token::Or => BinOp::Or,
            _ => return None,
        };
        Some(op)
    }

    fn subexpr(&mut self, limit: u8) -> Result<Expr, SyntaxError> {
        let unary = match self.peek() {
            Token::Minus => Some(UnOp::Neg),
            Token::Not => Some(UnOp::Not),
            Token::Hash => Some(UnOp::Len),
            _ => None,
        };
        let mut lhs = if let Some(op) = unary {
            self.advance();
            let operand = self.subexpr(UNARY_PRIORITY)?;
            Expr::unary(op, operand)
        } else {
            self.simple_expr()?
        };
        while let Some(op) = self.binary_op() {
            let (left, right) = op.precedence();
            if left <= limit {
                break;
            }
            self.advance();
            let rhs = self.subexpr(right)?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn simple_expr(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.current().line;
        let expr = match self.peek().clone() {
            Token::Number(n) => {
                self.advance();
                Expr::Number(n)
            }
            Token::Str(bytes) => {
                self.advance();
                Expr::Str(bytes)
            }
            Token::Interp(segments) => {
                self.advance();
                self.interpolation(segments)?
            }
            Token::Nil => {
                self.advance();
                Expr::Nil
            }
            Token::True => {
                self.advance();
                Expr::True
            }
            Token::False => {
                self.advance();
                Expr::False
            }
            Token::Ellipsis => {
                self.advance();
                Expr::Vararg
            }
            Token::LBrace => self.table()?,
            Token::Function => {
                self.advance();
                Expr::Function(Box::new(self.function_body(line, false)?))
            }
            Token::If => self.if_expr()?,
            _ => self.suffixed_expr()?,
        };
        if self.accept(&Token::DoubleColon) {
            self.skip_type()?;
        }
        Ok(expr)
    }

    fn if_expr(&mut self) -> Result<Expr, SyntaxError> {
        self.advance();
        let mut clauses = Vec::new();
        let cond = self.expr()?;
        self.expect(Token::Then)?;
        let value = self.expr()?;
        clauses.push((cond, value));
        while self.accept(&Token::Elseif) {
            let cond = self.expr()?;
            self.expect(Token::Then)?;
            let value = self.expr()?;
            clauses.push((cond, value));
        }
        self.expect(Token::Else)?;
        let else_expr = self.expr()?;
        Ok(Expr::IfElse {
            clauses,
            else_expr: Box::new(else_expr),
        })
    }

    fn interpolation(&mut self, segments: Vec<InterpSegment>) -> Result<Expr, SyntaxError> {
        let mut parts = Vec::with_capacity(segments.len());
        for segment in segments {
            match segment {
                InterpSegment::Text(bytes) => parts.push(InterpPart::Text(bytes)),
                InterpSegment::Expr {
                    source,
                    line,
                    column,
                } => parts.push(InterpPart::Expr(parse_expression_at(&source, line, column)?)),
            }
        }
        Ok(Expr::Interp(parts))
    }

    fn primary_expr(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.current().line;
        match self.peek().clone() {
            Token::Name(name) => {
                self.advance();
                Ok(Expr::name(name))
            }
            Token::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.expect_closing(Token::RParen, "(", line)?;
                Ok(Expr::paren(inner))
            }
            _ => Err(self.unexpected()),
        }
    }

    fn suffixed_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.primary_expr()?;
        loop {
            match self.peek().clone() {
                Token::Dot => {
                    self.advance();
                    let key = self.expect_name()?;
                    expr = Expr::field(expr, &key);
                }
                Token::LBracket => {
                    self.advance();
                    let key = self.expr()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::index(expr, key);
                }
                Token::Colon => {
                    self.advance();
                    let method = self.expect_name()?;
                    let args = self.call_args()?;
                    expr = Expr::Method {
                        obj: Box::new(expr),
                        method,
                        args,
                    };
                }
                Token::LParen | Token::Str(_) | Token::LBrace | Token::Interp(_) => {
                    let args = self.call_args()?;
                    expr = Expr::call(expr, args);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, SyntaxError> {
        let line = self.current().line;
        match self.peek().clone() {
            Token::Str(bytes) => {
                self.advance();
                Ok(vec![Expr::Str(bytes)])
            }
            Token::Interp(segments) => {
                self.advance();
                Ok(vec![self.interpolation(segments)?])
            }
            Token::LBrace => Ok(vec![self.table()?]),
            Token::LParen => {
                self.advance();
                if self.accept(&Token::RParen) {
                    return Ok(Vec::new());
                }
                let args = self.expr_list()?;
                self.expect_closing(Token::RParen, "(", line)?;
                Ok(args)
            }
            _ => Err(self.error_here(format!("function arguments expected near {}", self.peek()))),
        }
    }

    fn table(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.current().line;
        self.expect(Token::LBrace)?;
        let mut fields = Vec::new();
        while !self.check(&Token::RBrace) {
            let field = match self.peek().clone() {
                Token::LBracket => {
                    self.advance();
                    let key = self.expr()?;
                    self.expect(Token::RBracket)?;
                    self.expect(Token::Assign)?;
                    TableField::Keyed(key, self.expr()?)
                }
                Token::Name(name) if self.peek_at(1) == &Token::Assign => {
                    self.advance();
                    self.advance();
                    TableField::Named(name, self.expr()?)
                }
                _ => TableField::Positional(self.expr()?),
            };
            fields.push(field);
            if !self.accept(&Token::Comma) && !self.accept(&Token::Semi) {
                break;
            }
        }
        self.expect_closing(Token::RBrace, "{", line)?;
        Ok(Expr::Table(fields))
    }

    // -----------------------------------------------------------------------
    // Luau types (skipped)
    // -----------------------------------------------------------------------

    fn skip_optional_annotation(&mut self) -> Result<(), SyntaxError> {
        if self.accept(&Token::Colon) {
            self.skip_type()?;
        }
        Ok(())
    }

    fn skip_balanced(&mut self, open: Token, close: Token) -> Result<(), SyntaxError> {
        let line = self.current().line;
        self.expect(open.clone())?;
        let mut depth = 1usize;
        while depth > 0 {
            let token = self.advance();
            if token == open {
                depth += 1;
            } else if token == close {
                depth -= 1;
            } else if token == Token::Eof {
                return Err(self.error_here(format!(
                    "{} expected (to close {} at line {})",
                    close, open, line
                )));
            }
        }
        Ok(())
    }

    fn skip_type(&mut self) -> Result<(), SyntaxError> {
        self.accept(&Token::Pipe);
        self.accept(&Token::Amp);
        self.skip_simple_type()?;
        while self.accept(&Token::Pipe) || self.accept(&Token::Amp) {
            self.skip_simple_type()?;
        }
        Ok(())
    }

    fn skip_simple_type(&mut self) -> Result<(), SyntaxError> {
        match self.peek().clone() {
            Token::Lt => {
                self.skip_balanced(Token::Lt, Token::Gt)?;
                self.skip_balanced(Token::LParen, Token::RParen)?;
                self.expect(Token::Arrow)?;
                self.skip_type()?;
            }
            Token::LParen => {
                self.skip_balanced(Token::LParen, Token::RParen)?;
                if self.accept(&Token::Arrow) {
                    self.skip_type()?;
                }
            }
            Token::LBrace => self.skip_balanced(Token::LBrace, Token::RBrace)?,
            Token::Ellipsis => {
                self.advance();
                self.skip_simple_type()?;
            }
            Token::Str(_) | Token::Nil | Token::True | Token::False => {
                self.advance();
            }
            Token::Function => {
                // Not a valid type, but never loop on it
                return Err(self.unexpected());
            }
            Token::Name(name) => {
                self.advance();
                if name == "typeof" && self.check(&Token::LParen) {
                    self.skip_balanced(Token::LParen, Token::RParen)?;
                } else {
                    while self.accept(&Token::Dot) {
                        self.expect_name()?;
                    }
                    if self.check(&Token::Lt) {
                        self.skip_balanced(Token::Lt, Token::Gt)?;
                    }
                }
            }
            _ => return Err(self.error_here(format!("type expected near {}", self.peek()))),
        }
        while self.accept(&Token::Question) {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_and_call() {
        let chunk = parse("local x = 1 + 2; print(x)").unwrap();
        assert_eq!(chunk.block.stmts.len(), 2);
        assert!(matches!(chunk.block.stmts[0], Stmt::Local { .. }));
        assert!(matches!(chunk.block.stmts[1], Stmt::Call(_)));
    }

    #[test]
    fn test_precedence() {
        let chunk = parse("x = 1 + 2 * 3 ^ 2").unwrap();
        match &chunk.block.stmts[0] {
            Stmt::Assign { exprs, .. } => match &exprs[0] {
                Expr::Binary { op, rhs, .. } => {
                    assert_eq!(*op, BinOp::Add);
                    assert!(matches!(**rhs, Expr::Binary { op: BinOp::Mul, .. }));
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_concat_and_pow_are_right_associative() {
        let chunk = parse("x = a .. b .. c").unwrap();
        match &chunk.block.stmts[0] {
            Stmt::Assign { exprs, .. } => {
                assert!(matches!(&exprs[0], Expr::Binary { op: BinOp::Concat, rhs, .. }
                    if matches!(**rhs, Expr::Binary { op: BinOp::Concat, .. })));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_method_function_gets_self() {
        let chunk = parse("function obj.inner:method(a) return self end").unwrap();
        match &chunk.block.stmts[0] {
            Stmt::Assign { exprs, .. } => match &exprs[0] {
                Expr::Function(func) => {
                    assert_eq!(func.params[0].ident, "self");
                    assert_eq!(func.params[1].ident, "a");
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_luau_types_are_stripped() {
        let source = r#"
            export type Point = { x: number, y: number }
            type Callback<T> = (T) -> ()
            local function add<T>(a: number, b: number?): number
                return (a + (b or 0)) :: number
            end
            local p: Point = { x = 1, y = 2 }
            for i: number = 1, 3 do end
        "#;
        let chunk = parse(source).unwrap();
        assert_eq!(chunk.block.stmts.len(), 3);
    }

    #[test]
    fn test_type_is_still_a_function_name() {
        let chunk = parse("print(type(5)) local type = 3").unwrap();
        assert_eq!(chunk.block.stmts.len(), 2);
    }

    #[test]
    fn test_continue_and_compound_assignment() {
        let chunk = parse("for i = 1, 3 do if i == 2 then continue end x += i end").unwrap();
        match &chunk.block.stmts[0] {
            Stmt::NumericFor { body, .. } => {
                assert!(matches!(body.stmts[1], Stmt::CompoundAssign { op: BinOp::Add, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
        // `continue` as an ordinary identifier
        assert!(parse("continue = 1").is_ok());
        assert!(parse("continue()").is_ok());
    }

    #[test]
    fn test_if_expression_and_interpolation() {
        let chunk = parse("local s = if a then `v={a}` else 'none'").unwrap();
        match &chunk.block.stmts[0] {
            Stmt::Local { exprs, .. } => {
                assert!(matches!(exprs[0], Expr::IfElse { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_interpolation_segment_with_length() {
        let chunk = parse("print(`{#a} of {#b + 1}`)").unwrap();
        let Stmt::Call(Expr::Call { args, .. }) = &chunk.block.stmts[0] else {
            panic!("unexpected {:?}", chunk.block.stmts[0]);
        };
        let Expr::Interp(parts) = &args[0] else {
            panic!("unexpected {:?}", args[0]);
        };
        assert!(matches!(
            &parts[0],
            InterpPart::Expr(Expr::Unary { op: UnOp::Len, .. })
        ));
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn test_malformed_local_reports_location() {
        let err = parse("local x = ").unwrap_err();
        assert_eq!(err.line, 1);
        assert_eq!(err.column, 11);
        assert!(err.message.contains("unexpected symbol"));
    }

    #[test]
    fn test_return_must_be_last() {
        let err = parse("return 1 print(2)").unwrap_err();
        assert!(err.message.contains("expected"));
    }

    #[test]
    fn test_unclosed_block_mentions_opener() {
        let err = parse("while true do\n x = 1\n").unwrap_err();
        assert!(err.message.contains("to close 'while' at line 1"));
    }
}
