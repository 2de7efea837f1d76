//! Error taxonomy for the indexer engine
//!
//! Library components return [`IndexerError`]; the binary and the manager wrap
//! these in `anyhow` at the application edge.

use std::time::Duration;

use thiserror::Error;

use super::definitions::ValidationIssue;
use super::regex_cache;

/// Errors raised while evaluating a selector block
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectorError {
    /// Required selector did not match anything and no default was given
    #[error("selector did not match: {selector}")]
    NoMatch { selector: String },

    /// The selector itself could not be parsed
    #[error("invalid selector '{selector}': {reason}")]
    Invalid { selector: String, reason: String },
}

impl SelectorError {
    pub fn no_match(selector: impl Into<String>) -> Self {
        Self::NoMatch {
            selector: selector.into(),
        }
    }

    pub fn invalid(selector: impl Into<String>, reason: impl ToString) -> Self {
        Self::Invalid {
            selector: selector.into(),
            reason: reason.to_string(),
        }
    }
}

/// Reasons a login attempt can fail
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoginError {
    #[error("login rejected with HTTP 401")]
    Unauthorized,

    #[error("login redirected to another host ({host})")]
    CrossHostRedirect { host: String },

    #[error("login failed: {message}")]
    SiteError { message: String },

    #[error("login test selector did not match; session is not authenticated")]
    TestFailed,

    #[error("login page requires a captcha")]
    CaptchaRequired,

    #[error("login form not found: {selector}")]
    FormNotFound { selector: String },

    #[error("missing credential setting '{name}'")]
    MissingCredential { name: String },

    #[error("login method '{method}' is not supported")]
    UnsupportedMethod { method: String },
}

/// Top-level error for every engine operation
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("definition is invalid: {}", format_issues(.errors))]
    DefinitionValidation { errors: Vec<ValidationIssue> },

    #[error("failed to parse definition: {0}")]
    DefinitionParse(String),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Login(#[from] LoginError),

    #[error("anti-bot challenge detected at {host}")]
    AntiBotDetected { host: String },

    #[error("anti-bot bypass failed for {host}: {reason}")]
    AntiBotBypassFailed { host: String, reason: String },

    #[error("HTTP {status} from {host}")]
    Http {
        status: u16,
        host: String,
        retry_after: Option<Duration>,
    },

    #[error("network error contacting {host}: {message}")]
    Network {
        host: String,
        message: String,
        timeout: bool,
    },

    #[error("rate limit wait of {waited:?} exceeds the allowed maximum")]
    RateLimitWaitExceeded { waited: Duration },

    #[error("browser pool exhausted: no worker became available within {timeout:?}")]
    BrowserPoolExhausted { timeout: Duration },

    #[error("browser pool is shut down")]
    BrowserPoolClosed,

    #[error("download selectors did not match: {0}")]
    DownloadResolution(String),

    #[error("all {count} search requests failed: {errors}")]
    AllRequestsFailed { count: usize, errors: String },

    #[error("no search request could be built for this query")]
    NoRequests,

    #[error("invalid URL '{0}'")]
    InvalidUrl(String),

    #[error("response could not be parsed: {0}")]
    Parse(String),

    #[error("api error returned by site: {0}")]
    Api(String),

    #[error("storage unavailable: {0}")]
    Storage(String),
}

pub type IndexerResult<T> = std::result::Result<T, IndexerError>;

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl IndexerError {
    /// Build a network error from a reqwest failure, keeping only the host
    pub fn from_reqwest(host: &str, err: &reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            "request timed out".to_string()
        } else if err.is_connect() {
            "connection failed".to_string()
        } else if err.is_body() || err.is_decode() {
            "response body could not be read".to_string()
        } else {
            "request failed".to_string()
        };
        Self::Network {
            host: host.to_string(),
            message,
            timeout: err.is_timeout(),
        }
    }

    /// Whether the error signals that the session is no longer authenticated
    pub fn is_login_failure(&self) -> bool {
        matches!(
            self,
            IndexerError::Login(_) | IndexerError::Http { status: 401, .. }
        )
    }

    /// Concise, non-sensitive message suitable for showing to a user.
    ///
    /// Never includes URLs or query parameters.
    pub fn user_facing_message(&self) -> String {
        match self {
            IndexerError::Network { timeout: true, .. } => {
                "The indexer did not respond in time".to_string()
            }
            IndexerError::Network { .. } => {
                "Unable to connect to the indexer (DNS or connection failure)".to_string()
            }
            IndexerError::Login(LoginError::CaptchaRequired) => {
                "The indexer requires a captcha to log in".to_string()
            }
            IndexerError::Login(LoginError::MissingCredential { name }) => {
                format!("Missing required setting: {}", name)
            }
            IndexerError::Login(_) | IndexerError::Http { status: 401, .. } => {
                "Authentication failed; check your credentials".to_string()
            }
            IndexerError::Http { status: 403, .. }
            | IndexerError::AntiBotDetected { .. }
            | IndexerError::AntiBotBypassFailed { .. } => {
                "The indexer is blocking automated access (anti-bot protection)".to_string()
            }
            IndexerError::Http { status: 429, .. } | IndexerError::RateLimitWaitExceeded { .. } => {
                "The indexer is rate limiting requests; try again later".to_string()
            }
            IndexerError::Http { status, .. } => {
                format!("The indexer returned an HTTP {} error", status)
            }
            IndexerError::Api(message) => {
                format!("The indexer API returned an error: {}", truncate(&scrub(message), 120))
            }
            IndexerError::BrowserPoolExhausted { .. } | IndexerError::BrowserPoolClosed => {
                "No browser was available to solve the anti-bot challenge".to_string()
            }
            IndexerError::NoRequests => {
                "No search request could be built for this indexer".to_string()
            }
            IndexerError::AllRequestsFailed { .. } => {
                "Every search request to the indexer failed".to_string()
            }
            IndexerError::Selector(_) | IndexerError::Parse(_) => {
                "The indexer returned a page that could not be parsed".to_string()
            }
            IndexerError::DownloadResolution(_) => {
                "The download link could not be resolved".to_string()
            }
            IndexerError::DefinitionValidation { .. } | IndexerError::DefinitionParse(_) => {
                "The indexer definition is invalid".to_string()
            }
            IndexerError::InvalidUrl(_) => "The indexer URL is invalid".to_string(),
            IndexerError::Storage(_) => "Session storage is unavailable".to_string(),
        }
    }
}

/// Strip links and `key=value` secrets from text a tracker sent back
fn scrub(message: &str) -> String {
    let mut out = message.to_string();
    if let Some(urls) = regex_cache::compile(r"(?i)\b[a-z][a-z0-9+.-]*://\S+") {
        out = urls.replace_all(&out, "[url]").into_owned();
    }
    if let Some(secrets) = regex_cache::compile(
        r"(?i)\b(api[_-]?key|passkey|password|pass|token|secret|auth)(\s*[=:]\s*)[^\s&;,]+",
    ) {
        out = secrets.replace_all(&out, "${1}${2}[REDACTED]").into_owned();
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_facing_message_hides_urls() {
        let err = IndexerError::Http {
            status: 500,
            host: "tracker.example".to_string(),
            retry_after: None,
        };
        let msg = err.user_facing_message();
        assert!(!msg.contains("tracker.example"));
        assert!(msg.contains("500"));
    }

    #[test]
    fn test_login_failure_detection() {
        assert!(IndexerError::Login(LoginError::TestFailed).is_login_failure());
        assert!(
            IndexerError::Http {
                status: 401,
                host: "x".into(),
                retry_after: None
            }
            .is_login_failure()
        );
        assert!(!IndexerError::NoRequests.is_login_failure());
    }

    #[test]
    fn test_api_message_is_scrubbed() {
        let err = IndexerError::Api(
            "Invalid request https://tracker.example/api?t=search&apikey=S3CRET (passkey=abc123; token: xyz)"
                .to_string(),
        );
        let msg = err.user_facing_message();
        assert!(!msg.contains("tracker.example"));
        assert!(!msg.contains("S3CRET"));
        assert!(!msg.contains("abc123"));
        assert!(!msg.contains("xyz"));
        assert!(msg.contains("[url]"));
        assert!(msg.contains("passkey=[REDACTED]"));
        assert!(msg.contains("Invalid request"));
    }

    #[test]
    fn test_api_message_truncated() {
        let err = IndexerError::Api("x".repeat(500));
        assert!(err.user_facing_message().len() < 200);
    }
}
