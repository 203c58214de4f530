//! Error and diagnostic types for the obfuscation engine

use std::fmt;

use thiserror::Error;

/// Malformed input, reported with the 1-based position of the offending token
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("syntax error at line {line}, column {column}: {message}")]
pub struct SyntaxError {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl SyntaxError {
    pub fn new(line: u32, column: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

/// Fatal errors of a single engine invocation
#[derive(Debug, Error)]
pub enum ObfuscateError {
    /// Input could not be parsed; the pipeline aborts
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error while loading configuration
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal invariant was violated (generated code failed to re-parse)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for engine operations
pub type ObfuscateResult<T> = Result<T, ObfuscateError>;

/// An aborted run: the error plus every log line written before the abort
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ObfuscationFailure {
    #[source]
    pub error: ObfuscateError,
    pub logs: Vec<String>,
}

/// Recoverable conditions; each is surfaced as one log line and processing continues
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A pass declined to rewrite a node it could not prove safe
    UnsafeTransformSkipped { pass: &'static str, node: usize },
    /// More unsafe sites were skipped than are logged individually
    UnsafeSitesElided { pass: &'static str, count: usize },
    /// Nested virtualization hit the fixed depth bound
    VirtualizationDepthExceeded { requested: usize, cap: usize },
    /// A program or the whole bank hit its word budget; later code is
    /// lowered at a shallower depth or not at all
    VirtualizationBudgetExceeded { scope: &'static str, cap: usize },
    /// The optional remote rewrite step failed; the original input is used
    CollaboratorFailure(String),
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::UnsafeTransformSkipped { pass, node } => {
                write!(f, "[{}] pass skipped at node {}: unsafe", pass, node)
            }
            Diagnostic::UnsafeSitesElided { pass, count } => {
                write!(f, "[{}] {} further unsafe sites skipped", pass, count)
            }
            Diagnostic::VirtualizationDepthExceeded { requested, cap } => write!(
                f,
                "[virtualize] warning: nesting depth {} requested, capped at {}",
                requested, cap
            ),
            Diagnostic::VirtualizationBudgetExceeded { scope, cap } => write!(
                f,
                "[virtualize] warning: {} budget of {} words reached, lowering shallower",
                scope, cap
            ),
            Diagnostic::CollaboratorFailure(reason) => {
                write!(f, "[ai-rewrite] failure, building from original input: {}", reason)
            }
        }
    }
}
