use std::time::Duration;

use thiserror::Error;

/// Maximum length for upstream bodies quoted in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Substring the upstream server uses to signal a rejected session.
/// Case-sensitive.
pub const PERMISSION_MARKER: &str = "permission";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Upstream error (HTTP {status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl GatewayError {
    /// True when the upstream server rejected the session and a fresh login
    /// may help.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, GatewayError::PermissionDenied(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::Timeout { .. })
    }

    /// Map a reqwest failure, keeping timeouts distinct from other transport errors.
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
        } else if err.is_decode() {
            GatewayError::InvalidResponse(err.to_string())
        } else {
            GatewayError::Transport(err)
        }
    }

    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..end],
                body.len()
            )
        }
    }
}

/// Extract the upstream `error` text from a decoded body, if any.
pub(crate) fn error_text(body: &serde_json::Value) -> Option<&str> {
    body.get("error").and_then(|e| e.as_str())
}

/// Whether the upstream error text reports a permission problem.
pub fn is_permission_error(text: &str) -> bool {
    text.contains(PERMISSION_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_match_is_case_sensitive() {
        assert!(is_permission_error("permission denied"));
        assert!(is_permission_error("no permission for command"));
        assert!(!is_permission_error("Permission denied"));
        assert!(!is_permission_error("printer offline"));
    }

    #[test]
    fn test_error_text() {
        let body = serde_json::json!({ "error": "permission denied" });
        assert_eq!(error_text(&body), Some("permission denied"));
        assert_eq!(error_text(&serde_json::json!({ "ok": true })), None);
        assert_eq!(error_text(&serde_json::json!({ "error": 3 })), None);
    }

    #[test]
    fn test_truncate_body() {
        let short = "short body";
        assert_eq!(GatewayError::truncate_body(short), short);

        let long = "é".repeat(400);
        let truncated = GatewayError::truncate_body(&long);
        assert!(truncated.contains("truncated, 800 total bytes"));
    }

    #[test]
    fn test_classification() {
        assert!(GatewayError::PermissionDenied("x".into()).is_permission_denied());
        assert!(GatewayError::Timeout { timeout_ms: 10_000 }.is_timeout());
        assert!(
            !GatewayError::Upstream {
                status: 500,
                message: "boom".into()
            }
            .is_permission_denied()
        );
    }
}
