//! The rewrite step is swappable and never fatal

mod common;

use arcanum_core::{obfuscate_with_rewriter, RewriteError, Rewriter, Settings};
use common::run_lua;

/// Appends a statement so the candidate is observably different
struct Appending;

impl Rewriter for Appending {
    async fn rewrite(&self, source: &str, _settings: &Settings) -> Result<String, RewriteError> {
        Ok(format!("{}\nprint('rewritten')", source))
    }
}

struct Timeout;

impl Rewriter for Timeout {
    async fn rewrite(&self, _source: &str, _settings: &Settings) -> Result<String, RewriteError> {
        tokio::task::yield_now().await;
        Err(RewriteError::Request("operation timed out".to_string()))
    }
}

fn settings() -> Settings {
    Settings {
        use_ai: true,
        ..Settings::default().with_seed("AI")
    }
}

#[tokio::test]
async fn test_candidate_goes_through_full_pipeline() {
    let result = obfuscate_with_rewriter("print('original')", &settings(), &Appending)
        .await
        .unwrap();
    assert_eq!(
        run_lua(&result.code).unwrap(),
        vec!["original".to_string(), "rewritten".to_string()]
    );
    assert_eq!(result.stats.original_size, "print('original')".len());
}

#[tokio::test]
async fn test_failure_is_logged_and_recovered() {
    let result = obfuscate_with_rewriter("print('original')", &settings(), &Timeout)
        .await
        .unwrap();
    assert_eq!(
        result.logs[0],
        "[ai-rewrite] failure, building from original input: request failed: operation timed out"
    );
    assert_eq!(run_lua(&result.code).unwrap(), vec!["original".to_string()]);
}
