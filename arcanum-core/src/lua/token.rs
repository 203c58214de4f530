//! Token definitions for the Lua/Luau lexer

use std::fmt;

/// One segment of an interpolated (backtick) string
#[derive(Debug, Clone, PartialEq)]
pub enum InterpSegment {
    /// Literal bytes between expressions
    Text(Vec<u8>),
    /// Raw source of an embedded `{expr}` plus its position
    Expr {
        source: String,
        line: u32,
        column: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Name(String),
    Number(f64),
    Str(Vec<u8>),
    Interp(Vec<InterpSegment>),

    // Keywords
    And,
    Break,
    Do,
    Else,
    Elseif,
    End,
    False,
    For,
    Function,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Then,
    True,
    Until,
    While,

    // Operators and punctuation
    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    Caret,
    Hash,
    EqEq,
    NotEq,
    LtEq,
    GtEq,
    Lt,
    Gt,
    Assign,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semi,
    Colon,
    DoubleColon,
    Comma,
    Dot,
    Concat,
    Ellipsis,
    Arrow,
    Question,
    Pipe,
    Amp,

    // Luau compound assignment
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    DoubleSlashAssign,
    PercentAssign,
    CaretAssign,
    ConcatAssign,

    Eof,
}

impl Token {
    /// Map a bare word to its keyword token, if it is one
    pub fn keyword(word: &str) -> Option<Token> {
        let token = match word {
            "and" => Token::And,
            "break" => Token::Break,
            "do" => Token::Do,
            "else" => Token::Else,
            "elseif" => Token::Elseif,
            "end" => Token::End,
            "false" => Token::False,
            "for" => Token::For,
            "function" => Token::Function,
            "if" => Token::If,
            "in" => Token::In,
            "local" => Token::Local,
            "nil" => Token::Nil,
            "not" => Token::Not,
            "or" => Token::Or,
            "repeat" => Token::Repeat,
            "return" => Token::Return,
            "then" => Token::Then,
            "true" => Token::True,
            "until" => Token::Until,
            "while" => Token::While,
            _ => return None,
        };
        Some(token)
    }

    /// Whether a word is reserved and can never be used as an identifier
    pub fn is_reserved(word: &str) -> bool {
        Self::keyword(word).is_some()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Token::Name(name) => return write!(f, "'{}'", name),
            Token::Number(n) => return write!(f, "number {}", n),
            Token::Str(_) => "string literal",
            Token::Interp(_) => "interpolated string",
            Token::And => "'and'",
            Token::Break => "'break'",
            Token::Do => "'do'",
            Token::Else => "'else'",
            Token::Elseif => "'elseif'",
            Token::End => "'end'",
            Token::False => "'false'",
            Token::For => "'for'",
            Token::Function => "'function'",
            Token::If => "'if'",
            Token::In => "'in'",
            Token::Local => "'local'",
            Token::Nil => "'nil'",
            Token::Not => "'not'",
            Token::Or => "'or'",
            Token::Repeat => "'repeat'",
            Token::Return => "'return'",
            Token::Then => "'then'",
            Token::True => "'true'",
            Token::Until => "'until'",
            Token::While => "'while'",
            Token::Plus => "'+'",
            Token::Minus => "'-'",
            Token::Star => "'*'",
            Token::Slash => "'/'",
            Token::DoubleSlash => "'//'",
            Token::Percent => "'%'",
            Token::Caret => "'^'",
            Token::Hash => "'#'",
            Token::EqEq => "'=='",
            Token::NotEq => "'~='",
            Token::LtEq => "'<='",
            Token::GtEq => "'>='",
            Token::Lt => "'<'",
            Token::Gt => "'>'",
            Token::Assign => "'='",
            Token::LParen => "'('",
            Token::RParen => "')'",
            Token::LBrace => "'{'",
            Token::RBrace => "'}'",
            Token::LBracket => "'['",
            Token::RBracket => "']'",
            Token::Semi => "';'",
            Token::Colon => "':'",
            Token::DoubleColon => "'::'",
            Token::Comma => "','",
            Token::Dot => "'.'",
            Token::Concat => "'..'",
            Token::Ellipsis => "'...'",
            Token::Arrow => "'->'",
            Token::Question => "'?'",
            Token::Pipe => "'|'",
            Token::Amp => "'&'",
            Token::PlusAssign => "'+='",
            Token::MinusAssign => "'-='",
            Token::StarAssign => "'*='",
            Token::SlashAssign => "'/='",
            Token::DoubleSlashAssign => "'//='",
            Token::PercentAssign => "'%='",
            Token::CaretAssign => "'^='",
            Token::ConcatAssign => "'..='",
            Token::Eof => "end of input",
        };
        f.write_str(text)
    }
}

/// A token with the position of its first character (1-based)
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: u32,
    pub column: u32,
}
