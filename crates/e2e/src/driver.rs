//! Browser-driving seam
//!
//! Everything above this module talks to the browser through [`Page`] and
//! [`Browser`]. The Playwright bridge implements them for real runs; tests
//! substitute in-process fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use parabank_common::StorageState;

use crate::error::E2eResult;

/// An element query: a CSS selector optionally narrowed by contained text
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector {
    pub css: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_text: Option<String>,
}

impl Selector {
    pub fn css(css: impl Into<String>) -> Self {
        Self {
            css: css.into(),
            has_text: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.has_text = Some(text.into());
        self
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.has_text {
            Some(text) => write!(f, "{} >> has-text(\"{}\")", self.css, text),
            None => f.write_str(&self.css),
        }
    }
}

/// Navigation milestone to wait for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    #[default]
    Load,
    DomContentLoaded,
    NetworkIdle,
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::Load => "load",
            LoadState::DomContentLoaded => "domcontentloaded",
            LoadState::NetworkIdle => "networkidle",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
}

impl WaitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitState::Visible => "visible",
            WaitState::Hidden => "hidden",
            WaitState::Attached => "attached",
            WaitState::Detached => "detached",
        }
    }
}

/// How to pick an `<option>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectBy {
    Label(String),
    Value(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClickOptions {
    pub timeout: Duration,
    /// Skip actionability checks
    pub force: bool,
}

impl ClickOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            force: false,
        }
    }

    pub fn forced(timeout: Duration) -> Self {
        Self {
            timeout,
            force: true,
        }
    }
}

/// One browser tab with its own execution context
#[async_trait]
pub trait Page: Send + Sync {
    async fn goto(&self, url: &str, wait_until: LoadState, timeout: Duration) -> E2eResult<()>;

    async fn reload(&self, wait_until: LoadState, timeout: Duration) -> E2eResult<()>;

    async fn url(&self) -> E2eResult<String>;

    /// Full serialized HTML of the page
    async fn content(&self) -> E2eResult<String>;

    /// Wait until the current URL matches the regex `pattern`
    async fn wait_for_url(&self, pattern: &str, timeout: Duration) -> E2eResult<()>;

    /// Whether the element becomes visible within `timeout`; never errors on absence
    async fn is_visible(&self, selector: &Selector, timeout: Duration) -> E2eResult<bool>;

    async fn wait_for(&self, selector: &Selector, state: WaitState, timeout: Duration) -> E2eResult<()>;

    async fn inner_text(&self, selector: &Selector, timeout: Duration) -> E2eResult<String>;

    async fn click(&self, selector: &Selector, options: ClickOptions) -> E2eResult<()>;

    async fn fill(&self, selector: &Selector, value: &str, timeout: Duration) -> E2eResult<()>;

    /// Labels of every `<option>` under the element, in document order
    async fn option_labels(&self, selector: &Selector) -> E2eResult<Vec<String>>;

    async fn select_option(&self, selector: &Selector, option: &SelectBy, timeout: Duration) -> E2eResult<()>;

    async fn wait_for_timeout(&self, duration: Duration);

    /// Cookies and local storage of the page's context
    async fn storage_state(&self) -> E2eResult<StorageState>;

    async fn close(&self) -> E2eResult<()>;
}

/// Factory for isolated pages
#[async_trait]
pub trait Browser: Send + Sync {
    /// Open a page in a new context, seeded with `storage_state` when given
    async fn new_page(&self, storage_state: Option<&StorageState>) -> E2eResult<Box<dyn Page>>;

    async fn shutdown(&self) -> E2eResult<()>;
}
