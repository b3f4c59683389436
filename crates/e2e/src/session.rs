//! Per-worker authentication state
//!
//! Each worker logs in once, saves the browser storage state to its own
//! file and hands that state to every test that needs a logged-in customer.
//! Tests exercising unauthenticated flows always start from a clean context.
//!
//! ```text
//! NoState ─► Authenticating ─► Authenticated
//!                 │
//!                 ▼
//!       AuthenticationFailed ─► RegistrationFallback ─► Authenticated
//!                                        │
//!                                        ▼
//!                                  Unauthenticated
//! ```

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use parabank_common::{Credentials, Settings, StorageState, User, UserFactory, WorkerId};

use crate::driver::{Browser, LoadState, Page};
use crate::error::{E2eError, E2eResult};
use crate::pages::home::OVERVIEW_PATH;
use crate::pages::{HomePage, RegisterPage};

/// Test-name fragments that mark a test as needing a stateless context
pub const UNAUTHENTICATED_KEYWORDS: [&str; 6] = [
    "login",
    "register",
    "registration",
    "home_page_ui",
    "forgot_login",
    "index",
];

/// Whether a test must start without any stored session
pub fn requires_fresh_context(test_name: &str) -> bool {
    let name = test_name.to_lowercase().replace('-', "_");
    UNAUTHENTICATED_KEYWORDS.iter().any(|k| name.contains(k))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    NoState,
    Authenticating,
    Authenticated,
    AuthenticationFailed,
    RegistrationFallback,
    /// No usable state; tests log in on their own
    Unauthenticated,
}

/// Owns one worker's auth-state file
pub struct AuthStateManager {
    settings: Settings,
    worker: WorkerId,
    credentials: Credentials,
    phase: AuthPhase,
    state_path: PathBuf,
    user_factory: UserFactory,
}

impl AuthStateManager {
    pub fn new(settings: &Settings, worker: WorkerId) -> Self {
        let state_path = Self::state_path_for(&settings.session.state_dir, &worker);
        Self {
            credentials: settings.credentials.clone(),
            settings: settings.clone(),
            worker,
            phase: AuthPhase::NoState,
            state_path,
            user_factory: UserFactory::new("user"),
        }
    }

    /// `<dir>/state.json` for the master, `<dir>/state_<worker>.json` otherwise
    pub fn state_path_for(dir: &Path, worker: &WorkerId) -> PathBuf {
        dir.join(worker.state_file_name())
    }

    pub fn phase(&self) -> AuthPhase {
        self.phase
    }

    /// Credentials the rest of the run uses; swapped after a registration fallback
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    fn transition(&mut self, next: AuthPhase) {
        debug!("[{}] auth state {:?} -> {:?}", self.worker, self.phase, next);
        self.phase = next;
    }

    fn remove_state_file(&self) -> E2eResult<()> {
        match std::fs::remove_file(&self.state_path) {
            Ok(()) => {
                debug!("Removed auth state {}", self.state_path.display());
                Ok(())
            }
            // A missing file, or a parent that is not a directory, leaves nothing to remove
            Err(e) if e.kind() == std::io::ErrorKind::NotFound || !self.state_path.exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Log in once for this worker and persist the resulting storage state.
    ///
    /// Falls back to registering a fresh customer when the known account
    /// cannot log in. Ends `Unauthenticated` when both fail; that is a
    /// degraded mode, not an error.
    pub async fn establish(&mut self, browser: &dyn Browser) -> E2eResult<AuthPhase> {
        // Never mix cookie sets from a previous attempt
        self.remove_state_file()?;

        if !self.settings.session.restore {
            info!("[{}] Session restore disabled, tests will log in individually", self.worker);
            self.transition(AuthPhase::Unauthenticated);
            return Ok(self.phase);
        }

        self.transition(AuthPhase::Authenticating);
        let credentials = self.credentials.clone();
        match self.login_and_capture(browser, &credentials).await {
            Ok(state) => {
                self.persist(&state);
                return Ok(self.phase);
            }
            Err(e) => {
                warn!("[{}] Login as {} failed: {}", self.worker, credentials.username, e);
                self.transition(AuthPhase::AuthenticationFailed);
            }
        }

        self.transition(AuthPhase::RegistrationFallback);
        let user = self.user_factory.create_user();
        match self.register_and_capture(browser, &user).await {
            Ok(state) => {
                self.persist(&state);
                if self.phase == AuthPhase::Authenticated {
                    info!("[{}] Switched test user to {}", self.worker, user.username);
                    self.credentials = user.credentials();
                }
            }
            Err(e) => {
                warn!("[{}] Registration fallback failed: {}", self.worker, e);
                self.transition(AuthPhase::Unauthenticated);
            }
        }
        Ok(self.phase)
    }

    fn persist(&mut self, state: &StorageState) {
        match state.save(&self.state_path) {
            Ok(()) => {
                info!("[{}] Saved auth state to {}", self.worker, self.state_path.display());
                self.transition(AuthPhase::Authenticated);
            }
            Err(e) => {
                warn!("[{}] Could not save auth state: {}", self.worker, e);
                if let Err(remove_err) = self.remove_state_file() {
                    warn!(
                        "[{}] Could not remove partial auth state {}: {}",
                        self.worker,
                        self.state_path.display(),
                        remove_err
                    );
                }
                self.transition(AuthPhase::Unauthenticated);
            }
        }
    }

    async fn login_and_capture(&self, browser: &dyn Browser, credentials: &Credentials) -> E2eResult<StorageState> {
        let page = browser.new_page(None).await?;
        let result = async {
            let home = HomePage::new(page.as_ref(), &self.settings);
            home.load().await?;
            home.login(credentials).await?;
            let state = page.storage_state().await?;
            state.validate()?;
            Ok::<_, E2eError>(state)
        }
        .await;
        close_quietly(page.as_ref()).await;
        result
    }

    async fn register_and_capture(&self, browser: &dyn Browser, user: &User) -> E2eResult<StorageState> {
        let page = browser.new_page(None).await?;
        let result = async {
            let register = RegisterPage::new(page.as_ref(), &self.settings);
            register.open().await?;
            register.register(user).await?;
            register.verify_success(user).await?;
            let state = page.storage_state().await?;
            state.validate()?;
            Ok::<_, E2eError>(state)
        }
        .await;
        close_quietly(page.as_ref()).await;
        result
    }

    /// Storage state to seed a test's context with.
    ///
    /// Always `None` for unauthenticated-required tests, even when a valid
    /// state file exists.
    pub fn context_for(&self, test_name: &str) -> Option<StorageState> {
        if requires_fresh_context(test_name) {
            debug!("{} requires a fresh context", test_name);
            return None;
        }
        if self.phase != AuthPhase::Authenticated {
            return None;
        }
        match StorageState::load(&self.state_path) {
            Ok(state) if state.has_live_session() => Some(state),
            Ok(_) => {
                warn!("Auth state {} has no live session cookie", self.state_path.display());
                None
            }
            Err(e) => {
                warn!("Could not read auth state {}: {}", self.state_path.display(), e);
                None
            }
        }
    }

    /// Make sure `page` is logged in.
    ///
    /// Visits the protected overview page and, if the logged-in marker is
    /// missing, performs one inline login. When `restored` says the page was
    /// seeded with the stored session, failing this check invalidates the
    /// worker's state file.
    pub async fn user_login(&mut self, page: &dyn Page, restored: bool) -> E2eResult<()> {
        let settings = self.settings.clone();
        let home = HomePage::new(page, &settings);

        page.goto(&settings.url(OVERVIEW_PATH), LoadState::Load, settings.timeouts.navigation())
            .await?;

        let expect_logged_in = restored && self.phase == AuthPhase::Authenticated;
        let wait = if expect_logged_in {
            settings.timeouts.visible()
        } else {
            settings.timeouts.error_check()
        };
        if home.is_logged_in(wait).await {
            debug!("Restored session accepted");
            return Ok(());
        }

        if expect_logged_in {
            warn!("[{}] Restored session rejected, invalidating auth state", self.worker);
            self.invalidate()?;
        }

        info!("[{}] Performing inline login as {}", self.worker, self.credentials.username);
        home.load().await?;
        home.login(&self.credentials).await
    }

    /// Forget the saved state; later tests log in on their own
    pub fn invalidate(&mut self) -> E2eResult<()> {
        self.remove_state_file()?;
        self.transition(AuthPhase::Unauthenticated);
        Ok(())
    }

    /// End-of-run cleanup, honouring the session-cleanup flag
    pub fn finish(&mut self) -> E2eResult<()> {
        if self.settings.session.cleanup {
            info!("[{}] Removing auth state {}", self.worker, self.state_path.display());
            self.remove_state_file()?;
        }
        Ok(())
    }
}

async fn close_quietly(page: &dyn Page) {
    if let Err(e) = page.close().await {
        debug!("Closing page failed: {}", e);
    }
}
