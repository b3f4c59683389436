//! Harness configuration
//!
//! Settings are loaded from `config/<env>.toml` and then overridden by
//! environment variables, so CI can point the suite at another deployment
//! without editing files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::types::Credentials;

/// Deployment the suite runs against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Dev,
    Stage,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Stage => "stage",
            Environment::Prod => "prod",
        }
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "stage" => Ok(Environment::Stage),
            "prod" => Ok(Environment::Prod),
            other => Err(Error::InvalidConfig(format!(
                "unknown environment '{}' (expected dev, stage or prod)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Complete harness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Environment these settings were loaded for
    pub environment: Environment,

    /// Root URL of the bank, with trailing slash
    pub base_url: String,

    /// Known-valid account used for the per-worker login
    pub credentials: Credentials,

    /// Timeout budgets
    pub timeouts: TimeoutConfig,

    /// Metrics gateway configuration
    pub metrics: MetricsConfig,

    /// Auth-state persistence
    pub session: SessionConfig,

    /// Browser launch options
    pub browser: BrowserConfig,

    /// Running under CI
    pub ci: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: Environment::Dev,
            base_url: "https://parabank.parasoft.com/parabank/".to_string(),
            credentials: Credentials::default(),
            timeouts: TimeoutConfig::default(),
            metrics: MetricsConfig::default(),
            session: SessionConfig::default(),
            browser: BrowserConfig::default(),
            ci: false,
        }
    }
}

/// Timeout budgets, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Full page loads
    pub navigation_ms: u64,

    /// Waiting for an element to become visible
    pub visible_ms: u64,

    /// A single click
    pub click_ms: u64,

    /// Forced click after a normal click failed
    pub force_click_ms: u64,

    /// Probing for the internal-error page
    pub error_check_ms: u64,

    /// Reaching the overview page after submitting credentials
    pub login_ms: u64,

    /// Pause after submitting credentials before probing for errors
    pub login_settle_ms: u64,

    /// Page reload inside retry-with-reload
    pub reload_ms: u64,

    /// Pause after a reload before retrying
    pub reload_pause_ms: u64,

    /// Dropdown population budget
    pub dropdown_ms: u64,

    /// Dropdown polling interval
    pub dropdown_poll_ms: u64,

    /// Retries after a timeout
    pub max_retries: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            navigation_ms: 90_000,
            visible_ms: 10_000,
            click_ms: 3_000,
            force_click_ms: 2_000,
            error_check_ms: 500,
            login_ms: 15_000,
            login_settle_ms: 1_000,
            reload_ms: 30_000,
            reload_pause_ms: 500,
            dropdown_ms: 15_000,
            dropdown_poll_ms: 500,
            max_retries: 1,
        }
    }
}

impl TimeoutConfig {
    pub fn navigation(&self) -> Duration {
        Duration::from_millis(self.navigation_ms)
    }

    pub fn visible(&self) -> Duration {
        Duration::from_millis(self.visible_ms)
    }

    pub fn error_check(&self) -> Duration {
        Duration::from_millis(self.error_check_ms)
    }

    pub fn login(&self) -> Duration {
        Duration::from_millis(self.login_ms)
    }

    pub fn login_settle(&self) -> Duration {
        Duration::from_millis(self.login_settle_ms)
    }

    pub fn dropdown(&self) -> Duration {
        Duration::from_millis(self.dropdown_ms)
    }

    pub fn dropdown_poll(&self) -> Duration {
        Duration::from_millis(self.dropdown_poll_ms)
    }
}

/// Metrics gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Push metrics at all
    pub enabled: bool,

    /// Pushgateway base URL
    pub pushgateway_url: String,

    /// Job name series are pushed under
    pub job_name: String,

    /// HTTP timeout for push and delete calls
    pub timeout_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pushgateway_url: "http://localhost:9091".to_string(),
            job_name: "para-bank-tests".to_string(),
            timeout_ms: 5_000,
        }
    }
}

/// Auth-state persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory holding `state[_<worker>].json`
    pub state_dir: PathBuf,

    /// Perform the per-worker login and reuse its state
    pub restore: bool,

    /// Delete the state file when the run finishes
    pub cleanup: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            state_dir: crate::default_results_dir(),
            restore: true,
            cleanup: false,
        }
    }
}

/// Browser launch options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// chromium, firefox or webkit
    pub kind: String,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            kind: "chromium".to_string(),
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
        }
    }
}

impl Settings {
    /// Load `<config_dir>/<env>.toml` and apply environment overrides
    pub fn load(config_dir: &Path, env: Environment) -> Result<Self> {
        let mut settings = Self::load_file(config_dir, env)?;
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Load the config file without consulting the process environment
    pub fn load_file(config_dir: &Path, env: Environment) -> Result<Self> {
        let path = config_dir.join(format!("{}.toml", env));
        let example = config_dir.join(format!("{}.toml.example", env));

        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let settings: Self = toml::from_str(&content)?;
            info!("Loaded configuration from {}", path.display());
            settings
        } else if example.exists() {
            return Err(Error::ConfigNotFound { path, example });
        } else {
            warn!("No configuration at {}, using defaults", path.display());
            Self::default()
        };

        settings.environment = env;
        settings.base_url = normalize_base_url(&settings.base_url);
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `BASE_URL`, `PARABANK_USERNAME`, `PASSWORD`, `PUSHGATEWAY_URL`
    /// and CI detection from the given lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("BASE_URL") {
            self.base_url = normalize_base_url(&url);
        }
        if let Some(username) = non_empty("PARABANK_USERNAME") {
            self.credentials.username = username;
        }
        if let Some(password) = non_empty("PASSWORD") {
            self.credentials.password = password;
        }
        if let Some(url) = non_empty("PUSHGATEWAY_URL") {
            self.metrics.pushgateway_url = url;
        }

        let truthy = |key: &str| {
            non_empty(key)
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no"))
                .unwrap_or(false)
        };
        if truthy("CI") || truthy("GITHUB_ACTIONS") {
            self.ci = true;
            self.browser.headless = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(Error::InvalidConfig(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }
        if self.credentials.username.is_empty() {
            return Err(Error::InvalidConfig("credentials.username is empty".to_string()));
        }
        if self.timeouts.dropdown_poll_ms == 0 {
            return Err(Error::InvalidConfig("timeouts.dropdown_poll_ms must be > 0".to_string()));
        }
        Ok(())
    }

    /// Resolve a page path against the base URL
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }
}

fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    }
}
