//! Error types for E2E testing

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Playwright not found. Install with: npx playwright install")]
    PlaywrightNotFound,

    #[error("Browser bridge error: {0}")]
    Bridge(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    /// The bank answered with its internal-error page during a login-dependent step
    #[error("ParaBank server unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Skipped: {0}")]
    Skipped(String),

    #[error("Scenario parse error: {0}")]
    ScenarioParse(String),

    #[error("Step failed: {step} - {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Config error: {0}")]
    Config(#[from] parabank_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl E2eError {
    /// Whether the error is a timeout, either by type or by message.
    ///
    /// Only timeouts qualify for retry-with-reload.
    pub fn is_timeout(&self) -> bool {
        match self {
            E2eError::Timeout(_) => true,
            E2eError::Browser(msg) | E2eError::Bridge(msg) => mentions_timeout(msg),
            E2eError::StepFailed { reason, .. } => mentions_timeout(reason),
            E2eError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }

    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, E2eError::ServiceUnavailable(_))
    }
}

fn mentions_timeout(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.contains("timeout") || lower.contains("timed out")
}

pub type E2eResult<T> = Result<T, E2eError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(E2eError::Timeout("#amount".into()).is_timeout());
        assert!(E2eError::Browser("locator.click: Timeout 3000ms exceeded.".into()).is_timeout());
        assert!(E2eError::Bridge("request timed out".into()).is_timeout());
        assert!(!E2eError::Browser("element is not attached to the DOM".into()).is_timeout());
        assert!(!E2eError::AssertionFailed("Timeout label missing".into()).is_timeout());
        assert!(!E2eError::ServiceUnavailable("Error!".into()).is_timeout());
    }

    #[test]
    fn test_wrapped_timeout_is_still_a_timeout() {
        let wrapped = E2eError::StepFailed {
            step: "click:#transfer".into(),
            reason: E2eError::Timeout("#transfer".into()).to_string(),
        };
        assert!(wrapped.is_timeout());
        assert!(!wrapped.is_service_unavailable());
    }
}
