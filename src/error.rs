//! Error taxonomy for the ingestion pipeline.
//!
//! Domain logic returns [`IngestError`], matched on by callers that need to
//! tell a transient failure from a fatal one. Binary entry points and
//! one-shot operational code use `anyhow::Result` instead, per the
//! convention of typed errors for logic and `anyhow` at the edges.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Network error, 5xx, or upstream rate-limit signal. Retried with
    /// backoff by the caller; after the retry budget is exhausted this
    /// escalates to a partition failure.
    #[error("transient adapter failure: {0}")]
    Transient(String),

    /// The local rate limiter could not grant a token within `max_wait_ms`.
    #[error("rate limit timeout after {waited_ms}ms")]
    RateLimitTimeout { waited_ms: u64 },

    /// The rate limiter was shut down while a caller was waiting.
    #[error("rate limiter destroyed")]
    RateLimiterDestroyed,

    /// Invalid feed id, schema mismatch, or other misconfiguration. Fails
    /// fast at the edge; never touches persisted run/partition state.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The heatmap scan could not complete because a non-recoverable
    /// adapter error was returned after exhausting retries.
    #[error("scan aborted: {0}")]
    ScanAborted(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    /// Truncates a human-readable reason to the 1000-character cap for
    /// persisted error messages, so callers never have to remember to do
    /// it themselves.
    pub fn capped_message(&self) -> String {
        cap_error_message(&self.to_string())
    }
}

/// Caps an error message at 1000 characters before it is persisted,
/// bounding database row size regardless of how verbose the upstream
/// error was.
pub fn cap_error_message(message: &str) -> String {
    const MAX_LEN: usize = 1000;
    if message.len() <= MAX_LEN {
        message.to_string()
    } else {
        let mut truncated = message.chars().take(MAX_LEN).collect::<String>();
        truncated.push('\u{2026}');
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_long_messages() {
        let long = "x".repeat(2000);
        let capped = cap_error_message(&long);
        assert!(capped.chars().count() <= 1001);
        assert!(capped.ends_with('\u{2026}'));
    }

    #[test]
    fn leaves_short_messages_untouched() {
        let short = "boom";
        assert_eq!(cap_error_message(short), "boom");
    }
}
