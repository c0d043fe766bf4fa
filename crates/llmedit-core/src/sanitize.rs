//! Post-processing of raw model output.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

static THINK_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("static pattern is valid"));

/// Removes reasoning spans emitted by "thinking" models and trims the rest.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    span: Regex,
}

impl Sanitizer {
    /// Strip spans delimited by custom markers instead of `<think>`/`</think>`.
    pub fn with_markers(open: &str, close: &str) -> Result<Self, regex::Error> {
        let pattern = format!("(?s){}.*?{}", regex::escape(open), regex::escape(close));
        Ok(Self {
            span: Regex::new(&pattern)?,
        })
    }

    /// Delete every delimited span (non-greedy, across newlines), then trim.
    pub fn sanitize(&self, raw: &str) -> String {
        if raw.is_empty() {
            return String::new();
        }
        let stripped = self.span.replace_all(raw, "");
        let cleaned = stripped.trim().to_owned();
        debug!(raw_len = raw.len(), clean_len = cleaned.len(), "response sanitized");
        cleaned
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self {
            span: THINK_SPAN.clone(),
        }
    }
}
