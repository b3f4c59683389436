//! Stability helpers for the ParaBank demo server
//!
//! The public demo instance is slow and intermittently answers with an
//! "internal error" page under load. These helpers absorb exactly two kinds
//! of flakiness:
//! - transient unresponsiveness (timeouts), retried after a page reload
//! - the known internal-error page, which only gets amnesty on
//!   login-dependent steps
//!
//! Every other failure propagates untouched.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use parabank_common::config::TimeoutConfig;

use crate::driver::{ClickOptions, LoadState, Page, Selector, WaitState};
use crate::error::{E2eError, E2eResult};

/// Heading the bank renders on its error page
pub const ERROR_HEADING: &str = "h1.title";
pub const ERROR_HEADING_TEXT: &str = "Error!";
/// Paragraph carrying the error description
pub const ERROR_PARAGRAPH: &str = "p.error";

/// Both spellings appear on the live site
const INTERNAL_ERROR_PHRASES: [&str; 2] = [
    "internal error has occurred",
    "internal error has occured",
];

const CONTENT_FALLBACK_MESSAGE: &str = "Internal Error detected - server is experiencing issues";

/// Retry and timeout budget applied around a single action
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub visible_timeout: Duration,
    pub click_timeout: Duration,
    pub force_click_timeout: Duration,
    pub reload_timeout: Duration,
    /// Pause after a reload before the next attempt
    pub reload_pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_timeouts(&TimeoutConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_timeouts(timeouts: &TimeoutConfig) -> Self {
        Self {
            max_retries: timeouts.max_retries,
            visible_timeout: Duration::from_millis(timeouts.visible_ms),
            click_timeout: Duration::from_millis(timeouts.click_ms),
            force_click_timeout: Duration::from_millis(timeouts.force_click_ms),
            reload_timeout: Duration::from_millis(timeouts.reload_ms),
            reload_pause: Duration::from_millis(timeouts.reload_pause_ms),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A detected internal-error page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalErrorSignal {
    pub message: String,
    pub requires_login: bool,
}

impl InternalErrorSignal {
    pub fn into_error(self) -> E2eError {
        E2eError::ServiceUnavailable(self.message)
    }
}

/// Whether raw page content carries the internal-error phrase
pub fn page_text_indicates_internal_error(content: &str) -> bool {
    let normalized = content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    INTERNAL_ERROR_PHRASES.iter().any(|p| normalized.contains(p))
}

/// The error heading alone is not enough: rejected credentials render it too
fn error_text_is_internal(text: &str) -> bool {
    text.to_lowercase().contains("internal error")
}

/// Look for the bank's internal-error page.
///
/// Checks the error heading and paragraph with a short timeout, then falls
/// back to scanning the page content. Failed checks count as "no signal".
pub async fn detect_internal_error(page: &dyn Page, check_timeout: Duration) -> Option<InternalErrorSignal> {
    let heading = Selector::css(ERROR_HEADING).with_text(ERROR_HEADING_TEXT);
    let paragraph = Selector::css(ERROR_PARAGRAPH);

    let heading_visible = page.is_visible(&heading, check_timeout).await.unwrap_or(false);
    let paragraph_visible = page.is_visible(&paragraph, check_timeout).await.unwrap_or(false);

    if heading_visible || paragraph_visible {
        let mut parts = Vec::new();
        for (visible, selector) in [(heading_visible, &heading), (paragraph_visible, &paragraph)] {
            if !visible {
                continue;
            }
            match page.inner_text(selector, check_timeout).await {
                Ok(text) => parts.push(text.trim().to_string()),
                Err(e) => debug!("Could not read {}: {}", selector, e),
            }
        }
        let text = parts.join(" ");
        if error_text_is_internal(&text) {
            return Some(InternalErrorSignal {
                message: text.trim().to_string(),
                requires_login: false,
            });
        }
    }

    match page.content().await {
        Ok(content) if page_text_indicates_internal_error(&content) => Some(InternalErrorSignal {
            message: CONTENT_FALLBACK_MESSAGE.to_string(),
            requires_login: false,
        }),
        Ok(_) => None,
        Err(e) => {
            debug!("Internal-error check could not read page content: {}", e);
            None
        }
    }
}

/// React to an internal-error page.
///
/// Login-dependent steps turn a detected error into
/// [`E2eError::ServiceUnavailable`]; other steps only log it so their own
/// assertions still decide the outcome.
pub async fn handle_internal_error(
    page: &dyn Page,
    requires_login: bool,
    check_timeout: Duration,
) -> E2eResult<Option<InternalErrorSignal>> {
    let Some(mut signal) = detect_internal_error(page, check_timeout).await else {
        return Ok(None);
    };
    signal.requires_login = requires_login;

    if requires_login {
        warn!("ParaBank internal error on a login-dependent step: {}", signal.message);
        return Err(signal.into_error());
    }

    warn!("ParaBank internal error ignored (no login required): {}", signal.message);
    Ok(Some(signal))
}

/// Run `action`, reloading the page and retrying on timeouts.
///
/// Non-timeout errors propagate immediately. After `max_retries` reloads, or
/// when a reload itself fails, the action's last timeout error is returned.
pub async fn retry_with_reload<T, F, Fut>(page: &dyn Page, policy: &RetryPolicy, mut action: F) -> E2eResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = E2eResult<T>>,
{
    let attempts = policy.max_retries + 1;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match action().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_timeout() && attempt < attempts => {
                warn!("Timeout on attempt {}, reloading page and retrying: {}", attempt, e);
                if let Err(reload_err) = page.reload(LoadState::DomContentLoaded, policy.reload_timeout).await {
                    error!("Reload after attempt {} failed, giving up: {}", attempt, reload_err);
                    return Err(e);
                }
                page.wait_for_timeout(policy.reload_pause).await;
            }
            Err(e) => {
                if e.is_timeout() {
                    error!("All {} attempts failed", attempts);
                }
                return Err(e);
            }
        }
    }
}

async fn click_once(page: &dyn Page, target: &Selector, policy: &RetryPolicy) -> E2eResult<()> {
    page.wait_for(target, WaitState::Visible, policy.visible_timeout).await?;

    match page.click(target, ClickOptions::new(policy.click_timeout)).await {
        Ok(()) => Ok(()),
        Err(e) => {
            // Intercepted clicks and slow hydration
            debug!("Click on {} failed ({}), forcing", target, e);
            page.click(target, ClickOptions::forced(policy.force_click_timeout)).await
        }
    }
}

/// Click once the element is visible, forcing the click if a normal one fails.
///
/// With `retry_on_timeout` the attempt runs under [`retry_with_reload`].
/// Flows with side effects (registration, payments) pass `false` so a
/// timeout never triggers a stray reload.
pub async fn safe_click(
    page: &dyn Page,
    target: &Selector,
    retry_on_timeout: bool,
    policy: &RetryPolicy,
) -> E2eResult<()> {
    if retry_on_timeout {
        retry_with_reload(page, policy, || click_once(page, target, policy)).await
    } else {
        click_once(page, target, policy).await
    }
}

/// Option labels that represent real choices
pub fn usable_options(labels: &[String]) -> Vec<String> {
    labels
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.to_lowercase().contains("loading"))
        .map(str::to_string)
        .collect()
}

/// Poll a script-populated dropdown until it offers `min_options` choices.
///
/// Returns the usable labels, or [`E2eError::Timeout`] once `timeout` is spent.
pub async fn wait_for_options(
    page: &dyn Page,
    dropdown: &Selector,
    min_options: usize,
    timeout: Duration,
    poll_interval: Duration,
) -> E2eResult<Vec<String>> {
    let deadline = Instant::now() + timeout;

    loop {
        let labels = match page.option_labels(dropdown).await {
            Ok(labels) => labels,
            Err(e) => {
                debug!("Dropdown {} not readable yet: {}", dropdown, e);
                Vec::new()
            }
        };
        let ready = usable_options(&labels);
        if ready.len() >= min_options {
            return Ok(ready);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(E2eError::Timeout(format!(
                "{} to offer {} option(s) within {} ms (saw {})",
                dropdown,
                min_options,
                timeout.as_millis(),
                ready.len()
            )));
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}
