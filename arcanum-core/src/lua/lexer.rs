//! Lua 5.1 / Luau lexer
//!
//! Comments are discarded here, so nothing downstream ever sees them.

use super::token::{InterpSegment, Spanned, Token};
use crate::error::SyntaxError;

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
    /// Only a whole source may open with a shebang line
    shebang: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            shebang: true,
            ..Self::with_position(source, 1, 1)
        }
    }

    /// Lex a fragment that starts at a known position of an enclosing source
    pub fn with_position(source: &'a str, line: u32, column: u32) -> Self {
        Self {
            src: source.as_bytes(),
            pos: 0,
            line,
            column,
            shebang: false,
        }
    }

    /// Tokenize the whole input, always ending with `Token::Eof`
    pub fn tokenize(mut self) -> Result<Vec<Spanned>, SyntaxError> {
        if self.shebang && self.src.starts_with(b"#") {
            while let Some(c) = self.peek() {
                if c == b'\n' {
                    break;
                }
                self.bump();
            }
        }

        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let (line, column) = (self.line, self.column);
            let token = match self.peek() {
                None => Token::Eof,
                Some(c) => self.lex_token(c)?,
            };
            let done = token == Token::Eof;
            tokens.push(Spanned {
                token,
                line,
                column,
            });
            if done {
                return Ok(tokens);
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.src.get(self.pos).copied()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(self.line, self.column, message)
    }

    fn skip_trivia(&mut self) -> Result<(), SyntaxError> {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n' | 0x0b | 0x0c) => {
                    self.bump();
                }
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    self.bump();
                    self.bump();
                    if self.peek() == Some(b'[') {
                        if let Some(level) = self.long_bracket_level() {
                            self.read_long_bracket(level)?;
                            continue;
                        }
                    }
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// If positioned on `[=*[`, return the number of `=` signs
    fn long_bracket_level(&self) -> Option<usize> {
        let mut offset = 1;
        while self.peek_at(offset) == Some(b'=') {
            offset += 1;
        }
        if self.peek_at(offset) == Some(b'[') {
            Some(offset - 1)
        } else {
            None
        }
    }

    fn read_long_bracket(&mut self, level: usize) -> Result<Vec<u8>, SyntaxError> {
        let (line, column) = (self.line, self.column);
        for _ in 0..level + 2 {
            self.bump();
        }
        // A newline directly after the opening bracket is skipped
        if self.peek() == Some(b'\r') {
            self.bump();
        }
        if self.peek() == Some(b'\n') {
            self.bump();
        }
        let mut content = Vec::new();
        loop {
            match self.peek() {
                None => {
                    return Err(SyntaxError::new(
                        line,
                        column,
                        "unfinished long string or comment",
                    ))
                }
                Some(b']') => {
                    let mut offset = 1;
                    while self.peek_at(offset) == Some(b'=') {
                        offset += 1;
                    }
                    if offset - 1 == level && self.peek_at(offset) == Some(b']') {
                        for _ in 0..level + 2 {
                            self.bump();
                        }
                        return Ok(content);
                    }
                    content.push(b']');
                    self.bump();
                }
                Some(c) => {
                    content.push(c);
                    self.bump();
                }
            }
        }
    }

    fn lex_token(&mut self, c: u8) -> Result<Token, SyntaxError> {
        if c.is_ascii_alphabetic() || c == b'_' {
            let start = self.pos;
            while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
                self.bump();
            }
            let word = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
            return Ok(Token::keyword(&word).unwrap_or(Token::Name(word)));
        }
        if c.is_ascii_digit() || (c == b'.' && matches!(self.peek_at(1), Some(d) if d.is_ascii_digit())) {
            return self.lex_number();
        }

        let next = self.peek_at(1);
        let token = match c {
            b'"' | b'\'' => return self.lex_quoted(c).map(Token::Str),
            b'`' => return self.lex_interpolated(),
            b'[' => {
                if let Some(level) = self.long_bracket_level() {
                    return self.read_long_bracket(level).map(Token::Str);
                }
                self.bump();
                return Ok(Token::LBracket);
            }
            b'+' if next == Some(b'=') => (Token::PlusAssign, 2),
            b'+' => (Token::Plus, 1),
            b'-' if next == Some(b'=') => (Token::MinusAssign, 2),
            b'-' if next == Some(b'>') => (Token::Arrow, 2),
            b'-' => (Token::Minus, 1),
            b'*' if next == Some(b'=') => (Token::StarAssign, 2),
            b'*' => (Token::Star, 1),
            b'/' if next == Some(b'/') => {
                if self.peek_at(2) == Some(b'=') {
                    (Token::DoubleSlashAssign, 3)
                } else {
                    (Token::DoubleSlash, 2)
                }
            }
            b'/' if next == Some(b'=') => (Token::SlashAssign, 2),
            b'/' => (Token::Slash, 1),
            b'%' if next == Some(b'=') => (Token::PercentAssign, 2),
            b'%' => (Token::Percent, 1),
            b'^' if next == Some(b'=') => (Token::CaretAssign, 2),
            b'^' => (Token::Caret, 1),
            b'#' => (Token::Hash, 1),
            b'=' if next == Some(b'=') => (Token::EqEq, 2),
            b'=' => (Token::Assign, 1),
            b'~' if next == Some(b'=') => (Token::NotEq, 2),
            b'<' if next == Some(b'=') => (Token::LtEq, 2),
            b'<' => (Token::Lt, 1),
            b'>' if next == Some(b'=') => (Token::GtEq, 2),
            b'>' => (Token::Gt, 1),
            b'(' => (Token::LParen, 1),
            b')' => (Token::RParen, 1),
            b'{' => (Token::LBrace, 1),
            b'}' => (Token::RBrace, 1),
            b']' => (Token::RBracket, 1),
            b';' => (Token::Semi, 1),
            b':' if next == Some(b':') => (Token::DoubleColon, 2),
            b':' => (Token::Colon, 1),
            b',' => (Token::Comma, 1),
            b'.' if next == Some(b'.') => {
                if self.peek_at(2) == Some(b'.') {
                    (Token::Ellipsis, 3)
                } else if self.peek_at(2) == Some(b'=') {
                    (Token::ConcatAssign, 3)
                } else {
                    (Token::Concat, 2)
                }
            }
            b'.' => (Token::Dot, 1),
            b'?' => (Token::Question, 1),
            b'|' => (Token::Pipe, 1),
            b'&' => (Token::Amp, 1),
            other => {
                return Err(self.error(format!("unexpected symbol near '{}'", other as char)))
            }
        };
        for _ in 0..token.1 {
            self.bump();
        }
        Ok(token.0)
    }

    fn lex_number(&mut self) -> Result<Token, SyntaxError> {
        let start = self.pos;
        let radix_prefix = self.peek() == Some(b'0')
            && matches!(self.peek_at(1), Some(b'x' | b'X' | b'b' | b'B'));

        if radix_prefix {
            self.bump();
            let radix = match self.bump() {
                Some(b'x' | b'X') => 16,
                _ => 2,
            };
            let mut digits = String::new();
            while let Some(c) = self.peek() {
                if c == b'_' {
                    self.bump();
                } else if (c as char).is_digit(radix) {
                    digits.push(c as char);
                    self.bump();
                } else {
                    break;
                }
            }
            if digits.is_empty() {
                return Err(self.error("malformed number"));
            }
            // Lua wraps oversized hex literals; accumulate in floating point instead
            let value = digits
                .chars()
                .filter_map(|d| d.to_digit(radix))
                .fold(0f64, |acc, d| acc * radix as f64 + d as f64);
            self.reject_trailing_alnum()?;
            return Ok(Token::Number(value));
        }

        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == b'.' {
                text.push(c as char);
                self.bump();
            } else if c == b'_' {
                self.bump();
            } else if c == b'e' || c == b'E' {
                text.push('e');
                self.bump();
                if let Some(sign @ (b'+' | b'-')) = self.peek() {
                    text.push(sign as char);
                    self.bump();
                }
            } else {
                break;
            }
        }
        self.reject_trailing_alnum()?;
        text.parse::<f64>().map(Token::Number).map_err(|_| {
            let raw = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
            self.error(format!("malformed number near '{}'", raw))
        })
    }

    fn reject_trailing_alnum(&self) -> Result<(), SyntaxError> {
        match self.peek() {
            Some(c) if c.is_ascii_alphanumeric() || c == b'_' => {
                Err(self.error("malformed number"))
            }
            _ => Ok(()),
        }
    }

    /// Decode one backslash escape (the backslash is already consumed)
    fn lex_escape(&mut self, out: &mut Vec<u8>) -> Result<(), SyntaxError> {
        let c = self
            .bump()
            .ok_or_else(|| self.error("unfinished string"))?;
        match c {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'\\' | b'"' | b'\'' | b'`' | b'{' | b'}' => out.push(c),
            b'\n' => out.push(b'\n'),
            b'\r' => {
                if self.peek() == Some(b'\n') {
                    self.bump();
                }
                out.push(b'\n');
            }
            b'x' => {
                let mut value = 0u32;
                for _ in 0..2 {
                    let d = self
                        .bump()
                        .and_then(|d| (d as char).to_digit(16))
                        .ok_or_else(|| self.error("hexadecimal digit expected"))?;
                    value = value * 16 + d;
                }
                out.push(value as u8);
            }
            b'z' => {
                while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n' | 0x0b | 0x0c)) {
                    self.bump();
                }
            }
            b'u' => {
                if self.bump() != Some(b'{') {
                    return Err(self.error("missing '{' in \\u{xxxx}"));
                }
                let mut value = 0u32;
                while let Some(d) = self.peek().and_then(|d| (d as char).to_digit(16)) {
                    value = value.saturating_mul(16).saturating_add(d);
                    self.bump();
                }
                if self.bump() != Some(b'}') {
                    return Err(self.error("missing '}' in \\u{xxxx}"));
                }
                let ch = char::from_u32(value).ok_or_else(|| self.error("UTF-8 value too large"))?;
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
            d if d.is_ascii_digit() => {
                let mut value = (d - b'0') as u32;
                for _ in 0..2 {
                    match self.peek() {
                        Some(d) if d.is_ascii_digit() => {
                            value = value * 10 + (d - b'0') as u32;
                            self.bump();
                        }
                        _ => break,
                    }
                }
                if value > 255 {
                    return Err(self.error("decimal escape too large"));
                }
                out.push(value as u8);
            }
            other => {
                return Err(self.error(format!("invalid escape sequence '\\{}'", other as char)))
            }
        }
        Ok(())
    }

    fn lex_quoted(&mut self, quote: u8) -> Result<Vec<u8>, SyntaxError> {
        self.bump();
        let mut out = Vec::new();
        loop {
            match self.bump() {
                None | Some(b'\n') => return Err(self.error("unfinished string")),
                Some(b'\\') => self.lex_escape(&mut out)?,
                Some(c) if c == quote => return Ok(out),
                Some(c) => out.push(c),
            }
        }
    }

    fn lex_interpolated(&mut self) -> Result<Token, SyntaxError> {
        self.bump();
        let mut segments = Vec::new();
        let mut text = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unfinished interpolated string")),
                Some(b'`') => {
                    self.bump();
                    break;
                }
                Some(b'\\') => {
                    self.bump();
                    self.lex_escape(&mut text)?;
                }
                Some(b'{') => {
                    self.bump();
                    if !text.is_empty() {
                        segments.push(InterpSegment::Text(std::mem::take(&mut text)));
                    }
                    let (line, column) = (self.line, self.column);
                    let start = self.pos;
                    let mut depth = 0usize;
                    loop {
                        match self.peek() {
                            None => return Err(self.error("unfinished interpolated string")),
                            Some(b'}') if depth == 0 => break,
                            Some(b'}') => depth -= 1,
                            Some(b'{') => depth += 1,
                            Some(q @ (b'"' | b'\'')) => {
                                self.lex_quoted(q)?;
                                continue;
                            }
                            _ => {}
                        }
                        self.bump();
                    }
                    let source = std::str::from_utf8(&self.src[start..self.pos])
                        .map_err(|_| {
                            SyntaxError::new(line, column, "invalid UTF-8 in interpolated expression")
                        })?
                        .to_string();
                    self.bump();
                    segments.push(InterpSegment::Expr {
                        source,
                        line,
                        column,
                    });
                }
                Some(c) => {
                    text.push(c);
                    self.bump();
                }
            }
        }
        if !text.is_empty() || segments.is_empty() {
            segments.push(InterpSegment::Text(text));
        }
        Ok(Token::Interp(segments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_keywords_and_names() {
        assert_eq!(
            kinds("local x = nil"),
            vec![
                Token::Local,
                Token::Name("x".into()),
                Token::Assign,
                Token::Nil,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(kinds("0xFF")[0], Token::Number(255.0));
        assert_eq!(kinds("1e3")[0], Token::Number(1000.0));
        assert_eq!(kinds(".5")[0], Token::Number(0.5));
        assert_eq!(kinds("1_000")[0], Token::Number(1000.0));
        assert_eq!(kinds("0b101")[0], Token::Number(5.0));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(kinds(r#""a\tb\65\x42""#)[0], Token::Str(b"a\tbAB".to_vec()));
        assert_eq!(kinds("[[\nline]]")[0], Token::Str(b"line".to_vec()));
        assert_eq!(kinds("[==[a]]b]==]")[0], Token::Str(b"a]]b".to_vec()));
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("-- comment\n--[[ block\n comment ]] x"),
            vec![Token::Name("x".into()), Token::Eof]
        );
    }

    #[test]
    fn test_compound_operators() {
        assert_eq!(
            kinds("x += 1 y ..= 'a' z //= 2"),
            vec![
                Token::Name("x".into()),
                Token::PlusAssign,
                Token::Number(1.0),
                Token::Name("y".into()),
                Token::ConcatAssign,
                Token::Str(b"a".to_vec()),
                Token::Name("z".into()),
                Token::DoubleSlashAssign,
                Token::Number(2.0),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_interpolated_string() {
        let tokens = kinds("`hi {name}!`");
        match &tokens[0] {
            Token::Interp(segments) => {
                assert_eq!(segments.len(), 3);
                assert_eq!(segments[0], InterpSegment::Text(b"hi ".to_vec()));
                assert!(matches!(&segments[1], InterpSegment::Expr { source, .. } if source == "name"));
            }
            other => panic!("expected interpolation, got {:?}", other),
        }
    }

    #[test]
    fn test_fragment_may_start_with_length_operator() {
        let tokens = Lexer::with_position("#t", 1, 9).tokenize().unwrap();
        assert_eq!(tokens[0].token, Token::Hash);
        assert_eq!(tokens[0].column, 9);
        // a real shebang is still skipped
        assert_eq!(kinds("#!/usr/bin/lua\nx"), vec![Token::Name("x".into()), Token::Eof]);
    }

    #[test]
    fn test_interpolated_fragment_keeps_multibyte_text() {
        match &kinds("`{\"héllo\"}`")[0] {
            Token::Interp(segments) => assert!(matches!(
                &segments[0],
                InterpSegment::Expr { source, .. } if source == "\"héllo\""
            )),
            other => panic!("expected interpolation, got {:?}", other),
        }
    }

    #[test]
    fn test_unfinished_string_position() {
        let err = Lexer::new("local s = \"abc").tokenize().unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("unfinished string"));
    }
}
