//! Gemini-backed rewrite step

use arcanum_core::{RewriteError, Rewriter, Settings};
use serde::Deserialize;

const DEFAULT_MODEL: &str = "gemini-1.5-flash";
const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// HTTP client for the Gemini `generateContent` endpoint
#[derive(Debug, Clone)]
pub struct GeminiRewriter {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl GeminiRewriter {
    /// Configured from `GEMINI_API_KEY` and, optionally, `GEMINI_MODEL`
    pub fn from_env() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: std::env::var("GEMINI_API_KEY").ok().filter(|k| !k.is_empty()),
            model: std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
        }
    }
}

fn prompt(source: &str, settings: &Settings) -> String {
    let language = if settings.language == "ru" { "Russian" } else { "English" };
    format!(
        "Rewrite the following Lua/Luau script so that it behaves identically but \
         is harder to read: restructure expressions, reorder independent \
         statements and rename locals. Keep every global and every printed value \
         unchanged. Reply with the script only, inside one ```lua block. Write any \
         explanation in {}.\n\n```lua\n{}\n```",
        language, source
    )
}

/// The body of the first fenced block, or the whole reply when there is none
pub fn strip_fences(reply: &str) -> String {
    let trimmed = reply.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after = &trimmed[open + 3..];
    // skip the info string (`lua`, `luau`, ...)
    let body = match after.find('\n') {
        Some(newline) => &after[newline + 1..],
        None => after,
    };
    match body.find("```") {
        Some(close) => body[..close].trim_end().to_string(),
        None => body.trim_end().to_string(),
    }
}

impl Rewriter for GeminiRewriter {
    async fn rewrite(&self, source: &str, settings: &Settings) -> Result<String, RewriteError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| RewriteError::Unavailable("GEMINI_API_KEY is not set".to_string()))?;

        tracing::info!("Requesting rewrite from {}", self.model);
        let response = self
            .client
            .post(format!("{}/{}:generateContent", API_BASE, self.model))
            .query(&[("key", api_key)])
            .json(&serde_json::json!({
                "contents": [{ "parts": [{ "text": prompt(source, settings) }] }]
            }))
            .send()
            .await
            .map_err(|e| RewriteError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RewriteError::Rejected(format!("{}: {}", status, body.trim())));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| RewriteError::Malformed(e.to_string()))?;
        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| RewriteError::Malformed("no candidates".to_string()))?;
        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            let reason = candidate.finish_reason.unwrap_or_else(|| "empty reply".to_string());
            return Err(RewriteError::Rejected(reason));
        }
        Ok(strip_fences(&text))
    }
}
