//! Failure classification for agent process errors
//!
//! The agent reports failures as free-form stderr text (often a Node stack
//! trace) plus an exit code. This module maps that text onto the small error
//! taxonomy exposed to OpenAI clients using an ordered rule table: the first
//! matching rule wins, so the table order is part of the behavior.
//!
//! Capacity and rate-limit traces from the Gemini backend regularly mention
//! "authentication" in passing, which is why rate limiting is checked first and
//! the auth rule carries an exclusion list.

use axum::http::StatusCode;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

const MAX_DETAIL_CHARS: usize = 500;
const GENERIC_FAILURE: &str = "The agent process failed without diagnostic output";

const RATE_LIMIT_PATTERNS: &[&str] = &[
    r"(?i)rate[\s_-]?limit",
    r"(?i)too many requests",
    r"(?i)resource[\s_-]?exhausted",
    r"(?i)quota",
    r"(?i)capacity",
    r"(?i)overloaded",
    r"\b429\b",
];

/// Failure phrasing only; the agent logs benign lines such as
/// "Loaded cached credentials." on every run.
const AUTH_PATTERNS: &[&str] = &[
    r"(?i)\b(invalid|missing|expired|revoked|no)\s+(credentials?|api[\s_-]?key|auth(entication)?\s+method)",
    r"(?i)api[\s_-]?key\s+(is\s+)?(not\s+(valid|found|set)|invalid)",
    r"(?i)failed to (login|log in|authenticate)",
    r"(?i)authentication (failed|required|error)",
    r"(?i)unauthori[sz]ed",
    r"(?i)please (re-?)?(login|log in|authenticate)",
    r"(?i)set an auth method",
    r"\b401\b",
];

const CONTEXT_OVERFLOW_PATTERNS: &[&str] = &[
    r"(?i)context[\s_-]?(length|window)",
    r"(?i)token limit",
    r"(?i)too many tokens",
    r"(?i)maximum.*tokens",
    r"(?i)(prompt|input) is too long",
];

const BINARY_NOT_FOUND_PATTERNS: &[&str] = &[
    r"ENOENT",
    r"(?i)no such file or directory",
    r"(?i)command not found",
    r"(?i)os error 2\b",
];

const TIMEOUT_PATTERNS: &[&str] = &[
    r"(?i)timed?[\s_-]?out",
    r"(?i)deadline exceeded",
    r"\bSIG(TERM|KILL)\b",
    r"(?i)\bkilled\b",
];

/// User-facing error category, serialized as the OpenAI error `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    InvalidRequest,
    RateLimit,
    AuthError,
    ContextOverflow,
    BinaryNotFound,
    Timeout,
    ParseError,
    ServerError,
    NotFound,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::RateLimit => "rate_limit",
            Self::AuthError => "auth_error",
            Self::ContextOverflow => "context_overflow",
            Self::BinaryNotFound => "binary_not_found",
            Self::Timeout => "timeout",
            Self::ParseError => "parse_error",
            Self::ServerError => "server_error",
            Self::NotFound => "not_found",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest | Self::ContextOverflow => StatusCode::BAD_REQUEST,
            Self::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            Self::AuthError => StatusCode::UNAUTHORIZED,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::ParseError => StatusCode::BAD_GATEWAY,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::BinaryNotFound | Self::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn summary(&self) -> &'static str {
        match self {
            Self::RateLimit => "The agent backend is rate limited or out of capacity, retry later",
            Self::AuthError => "The agent process is not authenticated",
            Self::ContextOverflow => "The conversation exceeds the model context window",
            Self::BinaryNotFound => "The agent binary could not be found",
            Self::Timeout => "The agent process timed out",
            Self::ParseError => "The agent produced output that could not be parsed",
            Self::InvalidRequest => "Invalid request",
            Self::NotFound => "Not found",
            Self::ServerError => GENERIC_FAILURE,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of classifying a failure. Derived on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub status: StatusCode,
    pub message: String,
}

impl ErrorClassification {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            status: category.status(),
            message: message.into(),
        }
    }

    /// Category summary followed by the (truncated) raw detail, if any.
    pub fn with_detail(category: ErrorCategory, detail: &str) -> Self {
        let detail = truncate_detail(detail);
        let message = if detail.is_empty() {
            category.summary().to_string()
        } else {
            format!("{}: {}", category.summary(), detail)
        };
        Self::new(category, message)
    }
}

struct Rule {
    category: ErrorCategory,
    patterns: Vec<Regex>,
    unless: Vec<Regex>,
}

impl Rule {
    fn new(category: ErrorCategory, patterns: &[&str], unless: &[&str]) -> Self {
        Self {
            category,
            patterns: compile(patterns),
            unless: compile(unless),
        }
    }

    fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(text))
            && !self.unless.iter().any(|p| p.is_match(text))
    }
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("classifier pattern must compile"))
        .collect()
}

lazy_static! {
    static ref RULES: Vec<Rule> = vec![
        Rule::new(ErrorCategory::RateLimit, RATE_LIMIT_PATTERNS, &[]),
        Rule::new(ErrorCategory::AuthError, AUTH_PATTERNS, RATE_LIMIT_PATTERNS),
        Rule::new(ErrorCategory::ContextOverflow, CONTEXT_OVERFLOW_PATTERNS, &[]),
        Rule::new(ErrorCategory::BinaryNotFound, BINARY_NOT_FOUND_PATTERNS, &[]),
        Rule::new(ErrorCategory::Timeout, TIMEOUT_PATTERNS, &[]),
    ];
}

/// Match `text` against the rule table, returning the first matching category.
pub fn match_category(text: &str) -> Option<ErrorCategory> {
    RULES
        .iter()
        .find(|rule| rule.matches(text))
        .map(|rule| rule.category)
}

/// Classify the combined spawn-error message and stderr text of a failed run.
pub fn classify_failure(text: &str) -> ErrorClassification {
    match match_category(text) {
        Some(category) => ErrorClassification::with_detail(category, text),
        None => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                ErrorClassification::new(ErrorCategory::ServerError, GENERIC_FAILURE)
            } else {
                ErrorClassification::new(ErrorCategory::ServerError, truncate_detail(trimmed))
            }
        }
    }
}

fn truncate_detail(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX_DETAIL_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX_DETAIL_CHARS).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_wins_over_authentication() {
        let err = classify_failure(
            "Error: model is at capacity\n    at handleAuthentication (auth.js:12)\nauthentication retry failed",
        );
        assert_eq!(err.category, ErrorCategory::RateLimit);
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_auth_error() {
        let err = classify_failure("Failed to login. Please check your credentials.");
        assert_eq!(err.category, ErrorCategory::AuthError);
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_rate_limit_variants() {
        for text in [
            "429 Too Many Requests",
            "RESOURCE_EXHAUSTED: quota exceeded for metric",
            "rate limit hit",
        ] {
            assert_eq!(match_category(text), Some(ErrorCategory::RateLimit), "{text}");
        }
    }

    #[test]
    fn test_context_overflow() {
        let err = classify_failure("The input token count exceeds the maximum number of tokens allowed");
        assert_eq!(err.category, ErrorCategory::ContextOverflow);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_binary_not_found() {
        let err = classify_failure("failed to spawn gemini: No such file or directory (os error 2)");
        assert_eq!(err.category, ErrorCategory::BinaryNotFound);
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_credentials_banner_is_not_an_auth_failure() {
        assert_eq!(match_category("Loaded cached credentials."), None);
        assert_eq!(match_category("Using cached OAuth credentials for user@example.com"), None);
        for text in [
            "Error: invalid credentials",
            "Please set an Auth method in your settings.json",
            "GEMINI_API_KEY is not set: missing API key",
            "Authentication failed: token expired",
        ] {
            assert_eq!(match_category(text), Some(ErrorCategory::AuthError), "{text}");
        }
    }

    #[test]
    fn test_unknown_model_is_not_binary_not_found() {
        let err = classify_failure("[API Error: models/gemini-9-ultra is not found for API version v1beta]");
        assert_ne!(err.category, ErrorCategory::BinaryNotFound);
        assert_eq!(match_category("sh: 1: gemini: command not found"), Some(ErrorCategory::BinaryNotFound));
    }

    #[test]
    fn test_timeout() {
        let err = classify_failure("request timed out after 30000ms");
        assert_eq!(err.category, ErrorCategory::Timeout);
        assert_eq!(err.status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_default_keeps_trimmed_raw_text() {
        let err = classify_failure("  something odd happened\n");
        assert_eq!(err.category, ErrorCategory::ServerError);
        assert_eq!(err.message, "something odd happened");
    }

    #[test]
    fn test_default_without_text_uses_generic_message() {
        let err = classify_failure("   ");
        assert_eq!(err.category, ErrorCategory::ServerError);
        assert_eq!(err.message, GENERIC_FAILURE);
    }

    #[test]
    fn test_detail_is_truncated() {
        let long = format!("quota {}", "x".repeat(2000));
        let err = classify_failure(&long);
        assert_eq!(err.category, ErrorCategory::RateLimit);
        assert!(err.message.ends_with("..."));
        assert!(err.message.chars().count() < 700);
    }
}
