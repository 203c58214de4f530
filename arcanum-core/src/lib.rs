//! Arcanum Core Library
//!
//! A Lua 5.1 / Luau obfuscation engine. One call takes source text and a
//! [`Settings`] value and returns the transformed source, a chronological
//! log and size statistics:
//! - Lexer, parser and emitter for the Lua/Luau surface
//! - Scope resolution (locals, upvalues, globals)
//! - AST transform passes driven by a table of pass descriptors
//! - Virtualization into seeded stack-machine bytecode
//! - Runtime guards and watermarking
//! - An optional remote rewrite step behind the [`Rewriter`] trait

pub mod config;
pub mod engine;
pub mod error;
pub mod guards;
pub mod lua;
pub mod passes;
pub mod report;
pub mod resolve;
pub mod rewrite;
pub mod rng;
pub mod runtime;
pub mod vm;

// Re-export commonly used types
pub use config::Settings;
pub use engine::{local_obfuscate, Engine, ObfuscationResult};
pub use error::{Diagnostic, ObfuscateError, ObfuscateResult, ObfuscationFailure, SyntaxError};
pub use lua::{parse, print_chunk};
pub use report::Stats;
pub use rewrite::{obfuscate_with_rewriter, NoRewriter, RewriteError, Rewriter};
