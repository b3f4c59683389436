//! Customer registration form

use tracing::{info, warn};

use parabank_common::{Settings, User};

use crate::driver::{LoadState, Page, Selector};
use crate::error::{E2eError, E2eResult};
use crate::pages::home::HomePage;
use crate::stability::{handle_internal_error, safe_click, RetryPolicy};

pub const REGISTER_PATH: &str = "register.htm";

pub mod selectors {
    pub const FIRST_NAME: &str = r#"input[id="customer.firstName"]"#;
    pub const LAST_NAME: &str = r#"input[id="customer.lastName"]"#;
    pub const ADDRESS: &str = r#"input[id="customer.address.street"]"#;
    pub const CITY: &str = r#"input[id="customer.address.city"]"#;
    pub const STATE: &str = r#"input[id="customer.address.state"]"#;
    pub const ZIP_CODE: &str = r#"input[id="customer.address.zipCode"]"#;
    pub const PHONE: &str = r#"input[id="customer.phoneNumber"]"#;
    pub const SSN: &str = r#"input[id="customer.ssn"]"#;
    pub const USERNAME: &str = r#"input[id="customer.username"]"#;
    pub const PASSWORD: &str = r#"input[id="customer.password"]"#;
    pub const CONFIRM_PASSWORD: &str = r#"input[id="repeatedPassword"]"#;
    pub const REGISTER_BUTTON: &str = r#"input[value="Register"]"#;
    pub const TITLE: &str = "#rightPanel h1.title";
    pub const USERNAME_ERROR: &str = r#"span[id="customer.username.errors"]"#;
}

pub struct RegisterPage<'a> {
    page: &'a dyn Page,
    settings: &'a Settings,
    policy: RetryPolicy,
}

impl<'a> RegisterPage<'a> {
    pub fn new(page: &'a dyn Page, settings: &'a Settings) -> Self {
        Self {
            page,
            settings,
            policy: RetryPolicy::from_timeouts(&settings.timeouts),
        }
    }

    pub async fn open(&self) -> E2eResult<()> {
        self.page
            .goto(
                &self.settings.url(REGISTER_PATH),
                LoadState::Load,
                self.settings.timeouts.navigation(),
            )
            .await
    }

    /// Fill the form and submit it once; never retried because a reload
    /// could submit the same customer twice
    pub async fn register(&self, user: &User) -> E2eResult<()> {
        info!("Registering user: {}", user.username);
        let visible = self.settings.timeouts.visible();
        let fields = [
            (selectors::FIRST_NAME, &user.first_name),
            (selectors::LAST_NAME, &user.last_name),
            (selectors::ADDRESS, &user.address),
            (selectors::CITY, &user.city),
            (selectors::STATE, &user.state),
            (selectors::ZIP_CODE, &user.zip_code),
            (selectors::PHONE, &user.phone),
            (selectors::SSN, &user.ssn),
            (selectors::USERNAME, &user.username),
            (selectors::PASSWORD, &user.password),
            (selectors::CONFIRM_PASSWORD, &user.password),
        ];
        for (selector, value) in fields {
            self.page.fill(&Selector::css(selector), value, visible).await?;
        }

        safe_click(self.page, &Selector::css(selectors::REGISTER_BUTTON), false, &self.policy).await
    }

    /// Confirm the welcome banner.
    ///
    /// The bank sometimes reports "already exists" for a customer it just
    /// created; in that case a login with the new credentials decides.
    pub async fn verify_success(&self, user: &User) -> E2eResult<()> {
        handle_internal_error(self.page, false, self.settings.timeouts.error_check()).await?;

        let welcome = Selector::css(selectors::TITLE).with_text(format!("Welcome {}", user.username));
        if self.page.is_visible(&welcome, self.settings.timeouts.login()).await? {
            info!("Registration successful for {}", user.username);
            return Ok(());
        }

        let duplicate = Selector::css(selectors::USERNAME_ERROR).with_text("already exists");
        if self.page.is_visible(&duplicate, self.settings.timeouts.error_check()).await? {
            warn!(
                "Possible false duplicate-username error for {}, verifying via login",
                user.username
            );
            return HomePage::new(self.page, self.settings)
                .login(&user.credentials())
                .await;
        }

        Err(E2eError::AssertionFailed(format!(
            "registration of {} did not show the welcome message",
            user.username
        )))
    }
}
