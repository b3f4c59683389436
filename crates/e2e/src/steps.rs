//! Scenario step execution
//!
//! Steps run strictly in order on one page. Every browser action goes
//! through the stability helpers, so timeouts get their reload-and-retry and
//! the internal-error page is detected where a step depends on a login.
//!
//! Placeholders expanded in string fields:
//! - `{{username}}` / `{{password}}`: credentials of the worker's test user
//! - `{{new_username}}` / `{{new_password}}`: customer from the last `register` step
//! - `{{unique}}`: a token unique to this scenario run

use regex::Regex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use parabank_common::{Credentials, Settings, UserFactory};

use crate::driver::{Page, SelectBy, Selector, WaitState};
use crate::error::{E2eError, E2eResult};
use crate::pages::home::selectors as home_selectors;
use crate::pages::{HomePage, RegisterPage};
use crate::scenario::Step;
use crate::session::AuthStateManager;
use crate::stability::{handle_internal_error, retry_with_reload, safe_click, wait_for_options, RetryPolicy};

/// Pick the dropdown label matching `wanted`.
///
/// Exact (case-insensitive) matches win; otherwise either string may be a
/// prefix of the other, so "SAVING" finds "SAVINGS".
pub fn resolve_label(options: &[String], wanted: &str) -> Option<String> {
    let wanted_lower = wanted.trim().to_lowercase();
    if let Some(exact) = options.iter().find(|o| o.to_lowercase() == wanted_lower) {
        return Some(exact.clone());
    }
    options
        .iter()
        .find(|o| {
            let lower = o.to_lowercase();
            lower.starts_with(&wanted_lower) || wanted_lower.starts_with(&lower)
        })
        .cloned()
}

pub struct StepExecutor<'a> {
    page: &'a dyn Page,
    session: &'a mut AuthStateManager,
    settings: &'a Settings,
    policy: RetryPolicy,
    requires_login: bool,
    /// The page was seeded with the worker's stored session
    restored: bool,
    vars: HashMap<&'static str, String>,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        page: &'a dyn Page,
        session: &'a mut AuthStateManager,
        settings: &'a Settings,
        policy: RetryPolicy,
        requires_login: bool,
        restored: bool,
    ) -> Self {
        let mut vars = HashMap::new();
        vars.insert("unique", chrono::Utc::now().format("%H%M%S%3f").to_string());
        Self {
            page,
            session,
            settings,
            policy,
            requires_login,
            restored,
            vars,
        }
    }

    /// Expand `{{...}}` placeholders
    pub fn render(&self, input: &str) -> String {
        if !input.contains("{{") {
            return input.to_string();
        }
        let credentials = self.session.credentials();
        let mut out = input
            .replace("{{username}}", &credentials.username)
            .replace("{{password}}", &credentials.password);
        for (key, value) in &self.vars {
            out = out.replace(&format!("{{{{{}}}}}", key), value);
        }
        out
    }

    fn timeout_or(&self, timeout_ms: Option<u64>, fallback: Duration) -> Duration {
        timeout_ms.map(Duration::from_millis).unwrap_or(fallback)
    }

    fn selector(&self, css: &str, has_text: Option<&String>) -> Selector {
        let selector = Selector::css(self.render(css));
        match has_text {
            Some(text) => selector.with_text(self.render(text)),
            None => selector,
        }
    }

    /// Run every step; the first failure stops the scenario.
    ///
    /// Server faults and skips propagate unchanged so the hooks can
    /// classify them; everything else is tagged with the failing step.
    pub async fn run(mut self, steps: &[Step]) -> E2eResult<()> {
        for (index, step) in steps.iter().enumerate() {
            debug!("Step {}: {}", index + 1, step.describe());
            if let Err(e) = self.execute(step).await {
                return Err(match e {
                    E2eError::ServiceUnavailable(_) | E2eError::Skipped(_) | E2eError::StepFailed { .. } => e,
                    other => E2eError::StepFailed {
                        step: step.describe(),
                        reason: other.to_string(),
                    },
                });
            }
        }
        Ok(())
    }

    async fn execute(&mut self, step: &Step) -> E2eResult<()> {
        let settings = self.settings;
        let timeouts = &settings.timeouts;
        match step {
            Step::Navigate {
                url,
                wait_until,
                wait_for_selector,
            } => {
                let url = self.render(url);
                let target = if url.starts_with("http://") || url.starts_with("https://") {
                    url
                } else {
                    settings.url(&url)
                };
                let page = self.page;
                let wait_until = *wait_until;
                retry_with_reload(page, &self.policy, || page.goto(&target, wait_until, timeouts.navigation()))
                    .await?;
                if self.requires_login {
                    handle_internal_error(page, true, timeouts.error_check()).await?;
                }
                if let Some(css) = wait_for_selector {
                    let selector = self.selector(css, None);
                    page.wait_for(&selector, WaitState::Visible, timeouts.visible()).await?;
                }
                Ok(())
            }

            Step::UserLogin => self.session.user_login(self.page, self.restored).await,

            Step::Login {
                username,
                password,
                expect_success,
            } => {
                let defaults = self.session.credentials().clone();
                let credentials = Credentials {
                    username: username
                        .as_deref()
                        .map(|u| self.render(u))
                        .unwrap_or(defaults.username),
                    password: password
                        .as_deref()
                        .map(|p| self.render(p))
                        .unwrap_or(defaults.password),
                };
                let home = HomePage::new(self.page, self.settings);
                if *expect_success {
                    return home.login(&credentials).await;
                }

                home.submit_credentials(&credentials).await?;
                let error = Selector::css(home_selectors::LOGIN_ERROR);
                if self.page.is_visible(&error, timeouts.visible()).await? {
                    info!("Login as {} rejected as expected", credentials.username);
                    Ok(())
                } else {
                    Err(E2eError::AssertionFailed(format!(
                        "login as {} was expected to fail",
                        credentials.username
                    )))
                }
            }

            Step::Register { username_prefix } => {
                let factory = match username_prefix {
                    Some(prefix) => UserFactory::new(self.render(prefix)),
                    None => UserFactory::default(),
                };
                let user = factory.create_user();
                let register = RegisterPage::new(self.page, self.settings);
                register.open().await?;
                register.register(&user).await?;
                register.verify_success(&user).await?;
                self.vars.insert("new_username", user.username);
                self.vars.insert("new_password", user.password);
                Ok(())
            }

            Step::Click {
                selector,
                has_text,
                retry_on_timeout,
            } => {
                let selector = self.selector(selector, has_text.as_ref());
                safe_click(self.page, &selector, *retry_on_timeout, &self.policy).await
            }

            Step::Fill { selector, value } => {
                let selector = self.selector(selector, None);
                let value = self.render(value);
                self.page.fill(&selector, &value, timeouts.visible()).await
            }

            Step::Select {
                selector,
                label,
                value,
                index,
                min_options,
            } => {
                let selector = self.selector(selector, None);
                let options = wait_for_options(
                    self.page,
                    &selector,
                    *min_options,
                    timeouts.dropdown(),
                    timeouts.dropdown_poll(),
                )
                .await?;

                let choice = match (label, value, index) {
                    (Some(label), _, _) => {
                        let wanted = self.render(label);
                        let resolved = resolve_label(&options, &wanted).ok_or_else(|| {
                            E2eError::AssertionFailed(format!(
                                "{} has no option like '{}' (options: {})",
                                selector,
                                wanted,
                                options.join(", ")
                            ))
                        })?;
                        SelectBy::Label(resolved)
                    }
                    (None, Some(value), _) => SelectBy::Value(self.render(value)),
                    (None, None, Some(i)) => {
                        let label = options.get(*i).ok_or_else(|| {
                            E2eError::AssertionFailed(format!(
                                "{} has {} option(s), index {} requested",
                                selector,
                                options.len(),
                                i
                            ))
                        })?;
                        SelectBy::Label(label.clone())
                    }
                    (None, None, None) => match options.first() {
                        Some(first) => SelectBy::Label(first.clone()),
                        None => {
                            return Err(E2eError::AssertionFailed(format!("{} has no options", selector)))
                        }
                    },
                };
                debug!("Selecting {:?} in {}", choice, selector);
                self.page.select_option(&selector, &choice, timeouts.visible()).await
            }

            Step::WaitForOptions {
                selector,
                min_options,
                timeout_ms,
            } => {
                let selector = self.selector(selector, None);
                let options = wait_for_options(
                    self.page,
                    &selector,
                    *min_options,
                    self.timeout_or(*timeout_ms, timeouts.dropdown()),
                    timeouts.dropdown_poll(),
                )
                .await?;
                debug!("{} ready with {} option(s)", selector, options.len());
                Ok(())
            }

            Step::Wait {
                selector,
                has_text,
                state,
                timeout_ms,
            } => {
                let selector = self.selector(selector, has_text.as_ref());
                self.page
                    .wait_for(&selector, *state, self.timeout_or(*timeout_ms, timeouts.visible()))
                    .await
            }

            Step::Assert {
                selector,
                has_text,
                visible,
                text,
                text_contains,
                timeout_ms,
            } => {
                let selector = self.selector(selector, has_text.as_ref());
                let timeout = self.timeout_or(*timeout_ms, timeouts.visible());

                if *visible == Some(false) {
                    return self
                        .page
                        .wait_for(&selector, WaitState::Hidden, timeout)
                        .await
                        .map_err(|_| E2eError::AssertionFailed(format!("{} is still visible", selector)));
                }

                if !self.page.is_visible(&selector, timeout).await? {
                    return Err(E2eError::AssertionFailed(format!("{} is not visible", selector)));
                }

                if text.is_some() || text_contains.is_some() {
                    let actual = self.page.inner_text(&selector, timeout).await?;
                    let actual = actual.trim();
                    if let Some(expected) = text {
                        let expected = self.render(expected);
                        if actual != expected.trim() {
                            return Err(E2eError::AssertionFailed(format!(
                                "{} text is '{}', expected '{}'",
                                selector, actual, expected
                            )));
                        }
                    }
                    if let Some(fragment) = text_contains {
                        let fragment = self.render(fragment);
                        if !actual.contains(&fragment) {
                            return Err(E2eError::AssertionFailed(format!(
                                "{} text '{}' does not contain '{}'",
                                selector, actual, fragment
                            )));
                        }
                    }
                }
                Ok(())
            }

            Step::AssertUrl { pattern, timeout_ms } => {
                let pattern = self.render(pattern);
                Regex::new(&pattern)
                    .map_err(|e| E2eError::ScenarioParse(format!("invalid url pattern '{}': {}", pattern, e)))?;
                let timeout = self.timeout_or(*timeout_ms, timeouts.login());
                match self.page.wait_for_url(&pattern, timeout).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_timeout() => {
                        let current = self.page.url().await.unwrap_or_default();
                        Err(E2eError::AssertionFailed(format!(
                            "url '{}' does not match '{}'",
                            current, pattern
                        )))
                    }
                    Err(e) => Err(e),
                }
            }

            Step::CheckInternalError { requires_login } => {
                let requires_login = requires_login.unwrap_or(self.requires_login);
                handle_internal_error(self.page, requires_login, timeouts.error_check()).await?;
                Ok(())
            }

            Step::Sleep { ms } => {
                self.page.wait_for_timeout(Duration::from_millis(*ms)).await;
                Ok(())
            }

            Step::Log { message } => {
                info!("{}", self.render(message));
                Ok(())
            }

            Step::Skip { reason } => Err(E2eError::Skipped(self.render(reason))),
        }
    }
}
