//! Home page with the login panel

use tracing::{debug, info};

use parabank_common::{Credentials, Settings};

use crate::driver::{LoadState, Page, Selector};
use crate::error::{E2eError, E2eResult};
use crate::stability::{handle_internal_error, safe_click, RetryPolicy};

pub mod selectors {
    pub const USERNAME: &str = r#"input[name="username"]"#;
    pub const PASSWORD: &str = r#"input[name="password"]"#;
    pub const LOG_IN_BUTTON: &str = "#loginPanel input.button";
    pub const FORGOT_LOGIN: &str = r#"#loginPanel a[href*="lookup.htm"]"#;
    pub const LOGIN_ERROR: &str = "#rightPanel p.error";
    /// Left-panel heading only rendered for a logged-in customer
    pub const ACCOUNT_SERVICES: &str = "#leftPanel h2";
    pub const LOG_OUT: &str = r#"#leftPanel a[href*="logout.htm"]"#;
}

pub const ACCOUNT_SERVICES_TEXT: &str = "Account Services";

/// Protected landing page reached after a successful login
pub const OVERVIEW_PATH: &str = "overview.htm";
pub const OVERVIEW_URL_PATTERN: &str = r"/overview\.htm";

pub struct HomePage<'a> {
    page: &'a dyn Page,
    settings: &'a Settings,
    policy: RetryPolicy,
}

impl<'a> HomePage<'a> {
    pub fn new(page: &'a dyn Page, settings: &'a Settings) -> Self {
        Self {
            page,
            settings,
            policy: RetryPolicy::from_timeouts(&settings.timeouts),
        }
    }

    pub fn login_marker() -> Selector {
        Selector::css(selectors::ACCOUNT_SERVICES).with_text(ACCOUNT_SERVICES_TEXT)
    }

    pub async fn load(&self) -> E2eResult<()> {
        debug!("Loading home page {}", self.settings.base_url);
        self.page
            .goto(&self.settings.base_url, LoadState::Load, self.settings.timeouts.navigation())
            .await
    }

    /// Fill the login panel and submit, without judging the result.
    ///
    /// An internal-error page after submitting is a server fault on a
    /// login-dependent step and surfaces as `ServiceUnavailable`.
    pub async fn submit_credentials(&self, credentials: &Credentials) -> E2eResult<()> {
        let visible = self.settings.timeouts.visible();
        self.page
            .fill(&Selector::css(selectors::USERNAME), &credentials.username, visible)
            .await?;
        self.page
            .fill(&Selector::css(selectors::PASSWORD), &credentials.password, visible)
            .await?;
        safe_click(self.page, &Selector::css(selectors::LOG_IN_BUTTON), false, &self.policy).await?;

        self.page.wait_for_timeout(self.settings.timeouts.login_settle()).await;
        handle_internal_error(self.page, true, self.settings.timeouts.error_check()).await?;
        Ok(())
    }

    /// Log in and verify the overview page with its logged-in marker
    pub async fn login(&self, credentials: &Credentials) -> E2eResult<()> {
        info!("Logging in as {}", credentials.username);
        self.submit_credentials(credentials).await?;

        let error = Selector::css(selectors::LOGIN_ERROR);
        if self.page.is_visible(&error, self.settings.timeouts.error_check()).await? {
            let message = self
                .page
                .inner_text(&error, self.settings.timeouts.error_check())
                .await
                .unwrap_or_default();
            return Err(E2eError::Auth(format!(
                "{} was rejected: {}",
                credentials.username,
                message.trim()
            )));
        }

        self.page
            .wait_for_url(OVERVIEW_URL_PATTERN, self.settings.timeouts.login())
            .await?;

        if !self.is_logged_in(self.settings.timeouts.visible()).await {
            return Err(E2eError::Auth(format!(
                "overview reached but '{}' marker missing for {}",
                ACCOUNT_SERVICES_TEXT, credentials.username
            )));
        }
        Ok(())
    }

    pub async fn is_logged_in(&self, timeout: std::time::Duration) -> bool {
        self.page
            .is_visible(&Self::login_marker(), timeout)
            .await
            .unwrap_or(false)
    }

    pub async fn open_forgot_login(&self) -> E2eResult<()> {
        safe_click(self.page, &Selector::css(selectors::FORGOT_LOGIN), true, &self.policy).await
    }

    pub async fn log_out(&self) -> E2eResult<()> {
        safe_click(self.page, &Selector::css(selectors::LOG_OUT), true, &self.policy).await
    }
}
