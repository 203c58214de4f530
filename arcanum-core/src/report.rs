//! Transformation log and size statistics

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Diagnostic;

/// Before/after sizes of one run, in bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub original_size: usize,
    pub new_size: usize,
    /// Present only when the output is actually smaller, e.g. `"12.5%"`
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reduction: Option<String>,
}

impl Stats {
    pub fn measure(original: &str, code: &str) -> Self {
        let original_size = original.len();
        let new_size = code.len();
        let reduction = (new_size < original_size).then(|| {
            let saved = (original_size - new_size) as f64 / original_size as f64;
            format!("{:.1}%", saved * 100.0)
        });
        Self {
            original_size,
            new_size,
            reduction,
        }
    }
}

/// Chronological log of a run; every line is also emitted as a tracing event
#[derive(Debug, Default)]
pub struct Report {
    lines: Vec<String>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `[tag] message`
    pub fn log(&mut self, tag: &str, message: impl AsRef<str>) {
        let line = format!("[{}] {}", tag, message.as_ref());
        debug!("{}", line);
        self.lines.push(line);
    }

    pub fn diagnostic(&mut self, diagnostic: &Diagnostic) {
        let line = diagnostic.to_string();
        warn!("{}", line);
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}
