//! Optional remote rewrite step
//!
//! A [`Rewriter`] turns source text into a candidate source text before the
//! engine runs. Whatever the cause of a failure, the caller logs it and
//! builds from the original input.

use thiserror::Error;

use crate::config::Settings;
use crate::engine::{Engine, ObfuscationResult};
use crate::error::{Diagnostic, ObfuscationFailure};
use crate::lua::parse;
use crate::report::Report;

/// Why a rewrite produced no usable candidate
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("rejected by the service: {0}")]
    Rejected(String),

    #[error("rewriter unavailable: {0}")]
    Unavailable(String),
}

/// Text-to-text rewrite capability
#[allow(async_fn_in_trait)]
pub trait Rewriter {
    async fn rewrite(&self, source: &str, settings: &Settings) -> Result<String, RewriteError>;
}

/// Rewriter that always fails; stands in when no service is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRewriter;

impl Rewriter for NoRewriter {
    async fn rewrite(&self, _source: &str, _settings: &Settings) -> Result<String, RewriteError> {
        Err(RewriteError::Unavailable("no rewrite service configured".to_string()))
    }
}

/// Run the rewrite step when `use_ai` is set, then obfuscate.
///
/// A candidate that fails to parse counts as a failed rewrite. Sizes are
/// always reported against `source`.
pub async fn obfuscate_with_rewriter<R: Rewriter>(
    source: &str,
    settings: &Settings,
    rewriter: &R,
) -> Result<ObfuscationResult, ObfuscationFailure> {
    let engine = Engine::new(settings.clone());
    let mut report = Report::new();
    if !engine.settings().use_ai {
        return engine.obfuscate(source);
    }

    let candidate = match rewriter.rewrite(source, engine.settings()).await {
        Ok(candidate) => match parse(&candidate) {
            Ok(_) => Some(candidate),
            Err(e) => {
                report.diagnostic(&Diagnostic::CollaboratorFailure(format!(
                    "candidate does not parse: {}",
                    e
                )));
                None
            }
        },
        Err(e) => {
            report.diagnostic(&Diagnostic::CollaboratorFailure(e.to_string()));
            None
        }
    };

    match candidate {
        Some(candidate) => {
            report.log("ai-rewrite", format!("accepted candidate of {} bytes", candidate.len()));
            engine.run(&candidate, source, report)
        }
        None => engine.run(source, source, report),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    impl Rewriter for Fixed {
        async fn rewrite(&self, _source: &str, _settings: &Settings) -> Result<String, RewriteError> {
            Ok(self.0.to_string())
        }
    }

    fn settings(use_ai: bool) -> Settings {
        Settings {
            use_ai,
            ..Settings::all_disabled().with_watermark("")
        }
    }

    #[tokio::test]
    async fn test_rewriter_not_called_without_flag() {
        let result = obfuscate_with_rewriter("print(1)", &settings(false), &Fixed("print(2)"))
            .await
            .unwrap();
        assert_eq!(result.code, "print(1)\n");
    }

    #[tokio::test]
    async fn test_candidate_replaces_input() {
        let result = obfuscate_with_rewriter("print(1)", &settings(true), &Fixed("print(2)"))
            .await
            .unwrap();
        assert_eq!(result.code, "print(2)\n");
        assert_eq!(result.logs[0], "[ai-rewrite] accepted candidate of 8 bytes");
        assert_eq!(result.stats.original_size, 8);
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_original() {
        let result = obfuscate_with_rewriter("print(1)", &settings(true), &NoRewriter)
            .await
            .unwrap();
        assert_eq!(result.code, "print(1)\n");
        assert_eq!(
            result.logs[0],
            "[ai-rewrite] failure, building from original input: rewriter unavailable: no rewrite service configured"
        );
    }

    #[tokio::test]
    async fn test_unparseable_candidate_is_rejected() {
        let result = obfuscate_with_rewriter("print(1)", &settings(true), &Fixed("print(("))
            .await
            .unwrap();
        assert_eq!(result.code, "print(1)\n");
        assert!(result.logs[0].contains("candidate does not parse"));
    }
}
