//! In-process fakes of the browser driver and the metrics gateway

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parabank_common::{Cookie, SameSite, Settings, StorageState, SESSION_COOKIE};
use parabank_e2e::driver::{Browser, ClickOptions, LoadState, Page, SelectBy, Selector, WaitState};
use parabank_e2e::error::{E2eError, E2eResult};
use parabank_e2e::pages::home::{selectors as home, ACCOUNT_SERVICES_TEXT};
use parabank_e2e::pages::register::selectors as register;
use parabank_e2e::pushgateway::{GroupingKey, MetricsSink};
use parabank_e2e::stability::{ERROR_HEADING, ERROR_PARAGRAPH};

pub const BASE_URL: &str = "http://parabank.test/parabank/";
pub const INTERNAL_ERROR_TEXT: &str = "An internal error has occurred and has been logged.";
pub const BAD_LOGIN_TEXT: &str = "The username and password could not be verified.";

pub fn settings_in(dir: &std::path::Path) -> Settings {
    let mut settings = Settings::default();
    settings.base_url = BASE_URL.to_string();
    settings.session.state_dir = dir.to_path_buf();
    settings.metrics.enabled = false;
    settings
}

fn has_text_matches(selector: &Selector, text: &str) -> bool {
    selector.has_text.as_deref().map(|t| text.contains(t)).unwrap_or(true)
}

// ---------------------------------------------------------------------------
// ScriptedPage
// ---------------------------------------------------------------------------

/// A page whose answers are scripted per test
#[derive(Default)]
pub struct ScriptedPage {
    /// CSS selectors currently visible
    pub visible: Mutex<HashSet<String>>,
    /// Inner text per CSS selector
    pub texts: Mutex<HashMap<String, String>>,
    pub content: Mutex<String>,
    /// Results handed out to successive clicks; `Ok` once drained
    pub click_results: Mutex<VecDeque<E2eResult<()>>>,
    /// Results handed out to successive reloads; `Ok` once drained
    pub reload_results: Mutex<VecDeque<E2eResult<()>>>,
    /// Successive `option_labels` answers; the last one repeats
    pub options: Mutex<VecDeque<Vec<String>>>,
    /// Everything the page was asked to do, in order
    pub log: Mutex<Vec<String>>,
}

impl ScriptedPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn show(&self, css: &str, text: Option<&str>) {
        self.visible.lock().insert(css.to_string());
        if let Some(text) = text {
            self.texts.lock().insert(css.to_string(), text.to_string());
        }
    }

    pub fn set_content(&self, html: &str) {
        *self.content.lock() = html.to_string();
    }

    pub fn script_clicks(&self, results: Vec<E2eResult<()>>) {
        self.click_results.lock().extend(results);
    }

    pub fn script_reloads(&self, results: Vec<E2eResult<()>>) {
        self.reload_results.lock().extend(results);
    }

    pub fn script_options(&self, answers: Vec<Vec<&str>>) {
        let mut options = self.options.lock();
        for answer in answers {
            options.push_back(answer.into_iter().map(String::from).collect());
        }
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log.lock().iter().filter(|l| l.starts_with(prefix)).count()
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn visible_now(&self, selector: &Selector) -> bool {
        if !self.visible.lock().contains(&selector.css) {
            return false;
        }
        let text = self.texts.lock().get(&selector.css).cloned().unwrap_or_default();
        has_text_matches(selector, &text)
    }
}

#[async_trait]
impl Page for ScriptedPage {
    async fn goto(&self, url: &str, _wait_until: LoadState, _timeout: Duration) -> E2eResult<()> {
        self.log.lock().push(format!("goto:{}", url));
        Ok(())
    }

    async fn reload(&self, wait_until: LoadState, _timeout: Duration) -> E2eResult<()> {
        self.log.lock().push(format!("reload:{}", wait_until.as_str()));
        if let Some(result) = self.reload_results.lock().pop_front() {
            return result;
        }
        Ok(())
    }

    async fn url(&self) -> E2eResult<String> {
        Ok(BASE_URL.to_string())
    }

    async fn content(&self) -> E2eResult<String> {
        Ok(self.content.lock().clone())
    }

    async fn wait_for_url(&self, pattern: &str, _timeout: Duration) -> E2eResult<()> {
        Err(E2eError::Timeout(format!("url {}", pattern)))
    }

    async fn is_visible(&self, selector: &Selector, _timeout: Duration) -> E2eResult<bool> {
        Ok(self.visible_now(selector))
    }

    async fn wait_for(&self, selector: &Selector, state: WaitState, _timeout: Duration) -> E2eResult<()> {
        let visible = self.visible_now(selector);
        let ok = match state {
            WaitState::Visible | WaitState::Attached => visible,
            WaitState::Hidden | WaitState::Detached => !visible,
        };
        if ok {
            Ok(())
        } else {
            Err(E2eError::Timeout(selector.to_string()))
        }
    }

    async fn inner_text(&self, selector: &Selector, _timeout: Duration) -> E2eResult<String> {
        self.texts
            .lock()
            .get(&selector.css)
            .cloned()
            .ok_or_else(|| E2eError::Timeout(selector.to_string()))
    }

    async fn click(&self, selector: &Selector, options: ClickOptions) -> E2eResult<()> {
        let kind = if options.force { "force_click" } else { "click" };
        self.log.lock().push(format!("{}:{}", kind, selector.css));
        self.click_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn fill(&self, selector: &Selector, value: &str, _timeout: Duration) -> E2eResult<()> {
        self.log.lock().push(format!("fill:{}={}", selector.css, value));
        Ok(())
    }

    async fn option_labels(&self, selector: &Selector) -> E2eResult<Vec<String>> {
        self.log.lock().push(format!("options:{}", selector.css));
        let mut options = self.options.lock();
        if options.len() > 1 {
            Ok(options.pop_front().unwrap_or_default())
        } else {
            Ok(options.front().cloned().unwrap_or_default())
        }
    }

    async fn select_option(&self, selector: &Selector, option: &SelectBy, _timeout: Duration) -> E2eResult<()> {
        self.log.lock().push(format!("select:{}={:?}", selector.css, option));
        Ok(())
    }

    async fn wait_for_timeout(&self, duration: Duration) {
        self.log.lock().push(format!("pause:{}", duration.as_millis()));
    }

    async fn storage_state(&self) -> E2eResult<StorageState> {
        Ok(StorageState::default())
    }

    async fn close(&self) -> E2eResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeBank
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    Blank,
    Home,
    Overview,
    LoginError,
    InternalError,
    RegisterForm,
    Welcome(String),
    Duplicate,
    Other(String),
}

/// Server-side state of the fake bank
#[derive(Default)]
pub struct BankState {
    pub users: HashMap<String, String>,
    pub sessions: HashSet<String>,
    next_session: u64,
    /// Every page renders the internal-error page
    pub internal_error: bool,
    /// Registration answers "already exists" while still creating the customer
    pub false_duplicate: bool,
    pub login_attempts: usize,
    pub registrations: Vec<String>,
    /// Session cookie each new page was seeded with
    pub seeded: Vec<Option<String>>,
    /// Extra elements visible on content pages, with their text
    pub elements: HashMap<String, String>,
    /// Dropdown options per CSS selector
    pub options: HashMap<String, Vec<String>>,
    pub clicks: Vec<String>,
    pub selected: Vec<(String, SelectBy)>,
}

impl BankState {
    fn open_session(&mut self) -> String {
        self.next_session += 1;
        let token = format!("S{}", self.next_session);
        self.sessions.insert(token.clone());
        token
    }
}

/// A ParaBank stand-in implementing [`Browser`]
#[derive(Clone)]
pub struct FakeBank {
    pub state: Arc<Mutex<BankState>>,
}

impl FakeBank {
    pub fn new() -> Self {
        let mut state = BankState::default();
        state.users.insert("john".to_string(), "demo".to_string());
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn with_element(self, css: &str, text: &str) -> Self {
        self.state.lock().elements.insert(css.to_string(), text.to_string());
        self
    }

    pub fn with_options(self, css: &str, options: &[&str]) -> Self {
        self.state
            .lock()
            .options
            .insert(css.to_string(), options.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn set_internal_error(&self, on: bool) {
        self.state.lock().internal_error = on;
    }

    pub fn expire_sessions(&self) {
        self.state.lock().sessions.clear();
    }

    pub fn login_attempts(&self) -> usize {
        self.state.lock().login_attempts
    }

    pub fn seeded(&self) -> Vec<Option<String>> {
        self.state.lock().seeded.clone()
    }
}

#[async_trait]
impl Browser for FakeBank {
    async fn new_page(&self, storage_state: Option<&StorageState>) -> E2eResult<Box<dyn Page>> {
        let cookie = storage_state
            .and_then(|s| s.cookie(SESSION_COOKIE))
            .map(|c| c.value.clone());
        self.state.lock().seeded.push(cookie.clone());
        Ok(Box::new(FakeBankPage {
            bank: self.state.clone(),
            inner: Mutex::new(PageState {
                path: String::new(),
                cookie,
                fields: HashMap::new(),
                view: View::Blank,
            }),
        }))
    }

    async fn shutdown(&self) -> E2eResult<()> {
        Ok(())
    }
}

struct PageState {
    path: String,
    cookie: Option<String>,
    fields: HashMap<String, String>,
    view: View,
}

pub struct FakeBankPage {
    bank: Arc<Mutex<BankState>>,
    inner: Mutex<PageState>,
}

impl FakeBankPage {
    fn logged_in(&self) -> bool {
        let cookie = self.inner.lock().cookie.clone();
        match cookie {
            Some(token) => self.bank.lock().sessions.contains(&token),
            None => false,
        }
    }

    fn view(&self) -> View {
        self.inner.lock().view.clone()
    }

    fn navigate(&self, path: &str) {
        let logged_in = self.logged_in();
        let internal_error = self.bank.lock().internal_error;
        let view = if internal_error {
            View::InternalError
        } else {
            match path {
                "" | "index.htm" => View::Home,
                // The bank answers protected pages with its error page when logged out
                "overview.htm" if logged_in => View::Overview,
                "overview.htm" => View::InternalError,
                "register.htm" => View::RegisterForm,
                other => View::Other(other.to_string()),
            }
        };
        let mut inner = self.inner.lock();
        inner.path = path.to_string();
        inner.view = view;
    }

    fn visible_now(&self, selector: &Selector) -> bool {
        let view = self.view();
        let logged_in = self.logged_in();
        let css = selector.css.as_str();

        if css == home::ACCOUNT_SERVICES {
            return logged_in
                && !matches!(view, View::InternalError | View::Blank)
                && has_text_matches(selector, ACCOUNT_SERVICES_TEXT);
        }
        if css == home::LOG_IN_BUTTON {
            return !logged_in && view != View::Blank;
        }
        if css == home::LOG_OUT {
            return logged_in && view != View::InternalError;
        }
        if css == home::LOGIN_ERROR {
            return view == View::LoginError;
        }
        if css == ERROR_HEADING {
            return matches!(view, View::InternalError | View::LoginError) && has_text_matches(selector, "Error!");
        }
        if css == ERROR_PARAGRAPH {
            return matches!(view, View::InternalError | View::LoginError);
        }
        if css == register::REGISTER_BUTTON {
            return view == View::RegisterForm;
        }
        if css == register::TITLE {
            return match &view {
                View::Welcome(user) => has_text_matches(selector, &format!("Welcome {}", user)),
                _ => false,
            };
        }
        if css == register::USERNAME_ERROR {
            return view == View::Duplicate && has_text_matches(selector, "already exists");
        }

        if matches!(view, View::Other(_) | View::Overview | View::Home) {
            if let Some(text) = self.bank.lock().elements.get(css) {
                return has_text_matches(selector, text);
            }
            return self.bank.lock().options.contains_key(css);
        }
        false
    }

    fn submit_login(&self) {
        let (username, password) = {
            let inner = self.inner.lock();
            (
                inner.fields.get(home::USERNAME).cloned().unwrap_or_default(),
                inner.fields.get(home::PASSWORD).cloned().unwrap_or_default(),
            )
        };
        let mut bank = self.bank.lock();
        bank.login_attempts += 1;
        if bank.internal_error {
            drop(bank);
            self.inner.lock().view = View::InternalError;
            return;
        }
        if bank.users.get(&username) == Some(&password) {
            let token = bank.open_session();
            drop(bank);
            let mut inner = self.inner.lock();
            inner.cookie = Some(token);
            inner.path = "overview.htm".to_string();
            inner.view = View::Overview;
        } else {
            drop(bank);
            self.inner.lock().view = View::LoginError;
        }
    }

    fn submit_registration(&self) {
        let (username, password) = {
            let inner = self.inner.lock();
            (
                inner.fields.get(register::USERNAME).cloned().unwrap_or_default(),
                inner.fields.get(register::PASSWORD).cloned().unwrap_or_default(),
            )
        };
        let mut bank = self.bank.lock();
        if bank.users.contains_key(&username) {
            drop(bank);
            self.inner.lock().view = View::Duplicate;
            return;
        }
        bank.users.insert(username.clone(), password);
        bank.registrations.push(username.clone());
        if bank.false_duplicate {
            drop(bank);
            self.inner.lock().view = View::Duplicate;
            return;
        }
        let token = bank.open_session();
        drop(bank);
        let mut inner = self.inner.lock();
        inner.cookie = Some(token);
        inner.view = View::Welcome(username);
    }
}

#[async_trait]
impl Page for FakeBankPage {
    async fn goto(&self, url: &str, _wait_until: LoadState, _timeout: Duration) -> E2eResult<()> {
        let path = url.strip_prefix(BASE_URL).unwrap_or(url).to_string();
        self.navigate(&path);
        Ok(())
    }

    async fn reload(&self, _wait_until: LoadState, _timeout: Duration) -> E2eResult<()> {
        let path = self.inner.lock().path.clone();
        self.navigate(&path);
        Ok(())
    }

    async fn url(&self) -> E2eResult<String> {
        Ok(format!("{}{}", BASE_URL, self.inner.lock().path))
    }

    async fn content(&self) -> E2eResult<String> {
        Ok(match self.view() {
            View::InternalError => format!(
                "<h1 class=\"title\">Error!</h1><p class=\"error\">{}</p>",
                INTERNAL_ERROR_TEXT
            ),
            View::LoginError => format!("<h1 class=\"title\">Error!</h1><p class=\"error\">{}</p>", BAD_LOGIN_TEXT),
            _ => "<html><body>ParaBank</body></html>".to_string(),
        })
    }

    async fn wait_for_url(&self, pattern: &str, _timeout: Duration) -> E2eResult<()> {
        let url = self.url().await?;
        let re = Regex::new(pattern).map_err(|e| E2eError::Browser(e.to_string()))?;
        if re.is_match(&url) {
            Ok(())
        } else {
            Err(E2eError::Timeout(format!("waiting for url {}", pattern)))
        }
    }

    async fn is_visible(&self, selector: &Selector, _timeout: Duration) -> E2eResult<bool> {
        Ok(self.visible_now(selector))
    }

    async fn wait_for(&self, selector: &Selector, state: WaitState, _timeout: Duration) -> E2eResult<()> {
        let visible = self.visible_now(selector);
        let ok = match state {
            WaitState::Visible | WaitState::Attached => visible,
            WaitState::Hidden | WaitState::Detached => !visible,
        };
        if ok {
            Ok(())
        } else {
            Err(E2eError::Timeout(format!("{} to be {}", selector, state.as_str())))
        }
    }

    async fn inner_text(&self, selector: &Selector, _timeout: Duration) -> E2eResult<String> {
        if !self.visible_now(selector) {
            return Err(E2eError::Timeout(selector.to_string()));
        }
        let view = self.view();
        let css = selector.css.as_str();
        let text = if css == ERROR_PARAGRAPH || css == home::LOGIN_ERROR {
            match view {
                View::InternalError => INTERNAL_ERROR_TEXT.to_string(),
                _ => BAD_LOGIN_TEXT.to_string(),
            }
        } else if css == ERROR_HEADING {
            "Error!".to_string()
        } else if css == home::ACCOUNT_SERVICES {
            ACCOUNT_SERVICES_TEXT.to_string()
        } else {
            self.bank.lock().elements.get(css).cloned().unwrap_or_default()
        };
        Ok(text)
    }

    async fn click(&self, selector: &Selector, _options: ClickOptions) -> E2eResult<()> {
        if !self.visible_now(selector) {
            return Err(E2eError::Timeout(format!("click {}", selector)));
        }
        match selector.css.as_str() {
            home::LOG_IN_BUTTON => self.submit_login(),
            register::REGISTER_BUTTON => self.submit_registration(),
            home::LOG_OUT => {
                let token = self.inner.lock().cookie.take();
                if let Some(token) = token {
                    self.bank.lock().sessions.remove(&token);
                }
                self.navigate("index.htm");
            }
            css => self.bank.lock().clicks.push(css.to_string()),
        }
        Ok(())
    }

    async fn fill(&self, selector: &Selector, value: &str, _timeout: Duration) -> E2eResult<()> {
        self.inner
            .lock()
            .fields
            .insert(selector.css.clone(), value.to_string());
        Ok(())
    }

    async fn option_labels(&self, selector: &Selector) -> E2eResult<Vec<String>> {
        Ok(self.bank.lock().options.get(&selector.css).cloned().unwrap_or_default())
    }

    async fn select_option(&self, selector: &Selector, option: &SelectBy, _timeout: Duration) -> E2eResult<()> {
        self.bank.lock().selected.push((selector.css.clone(), option.clone()));
        Ok(())
    }

    async fn wait_for_timeout(&self, _duration: Duration) {}

    async fn storage_state(&self) -> E2eResult<StorageState> {
        let cookie = self.inner.lock().cookie.clone();
        Ok(StorageState {
            cookies: cookie
                .map(|value| Cookie {
                    name: SESSION_COOKIE.to_string(),
                    value,
                    domain: "parabank.test".to_string(),
                    path: "/parabank".to_string(),
                    expires: -1.0,
                    http_only: true,
                    secure: false,
                    same_site: SameSite::Lax,
                })
                .into_iter()
                .collect(),
            origins: Vec::new(),
        })
    }

    async fn close(&self) -> E2eResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Metrics sinks
// ---------------------------------------------------------------------------

/// Keeps every push and delete; can be switched into an outage
#[derive(Default)]
pub struct RecordingSink {
    pub pushes: Mutex<Vec<(String, GroupingKey, String)>>,
    pub deletes: Mutex<Vec<(String, GroupingKey)>>,
    pub down: AtomicBool,
    /// Worker labels whose delete fails
    pub failing_deletes: Mutex<HashSet<String>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().len()
    }

    pub fn last_body(&self) -> Option<String> {
        self.pushes.lock().last().map(|(_, _, body)| body.clone())
    }
}

#[async_trait]
impl MetricsSink for RecordingSink {
    async fn push(&self, job: &str, grouping_key: &GroupingKey, body: String) -> E2eResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(E2eError::Bridge("gateway unreachable".into()));
        }
        self.pushes.lock().push((job.to_string(), grouping_key.clone(), body));
        Ok(())
    }

    async fn delete(&self, job: &str, grouping_key: &GroupingKey) -> E2eResult<()> {
        let label = grouping_key.get("worker").cloned().unwrap_or_default();
        if self.down.load(Ordering::SeqCst) || self.failing_deletes.lock().contains(&label) {
            return Err(E2eError::Bridge(format!("delete {} failed", label)));
        }
        self.deletes.lock().push((job.to_string(), grouping_key.clone()));
        Ok(())
    }
}
