//! Lua/Luau front end: tokens, syntax tree, parser and source printer

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod printer;
pub mod token;

pub use ast::Chunk;
pub use parser::parse;
pub use printer::print_chunk;
