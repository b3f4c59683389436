//! Core types shared across the harness

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};

/// Label used to separate worker series in the metrics gateway
pub const WORKER_LABEL: &str = "worker";

/// Upper bound on parallel workers the harness knows how to clean up after
pub const MAX_WORKERS: usize = 32;

/// Name of the cookie the bank uses for its server-side session
pub const SESSION_COOKIE: &str = "JSESSIONID";

/// Identity of the process running tests.
///
/// `Master` is either a single-process run or the coordinator of a
/// multi-worker run. Workers are named `gw0`, `gw1`, ...
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerId {
    Master,
    Worker(String),
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::Master
    }
}

impl WorkerId {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") | Some("master") => Self::Master,
            Some(id) => Self::Worker(id.to_string()),
        }
    }

    /// Worker `gw<index>`
    pub fn indexed(index: usize) -> Self {
        Self::Worker(format!("gw{}", index))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Master => "master",
            Self::Worker(id) => id,
        }
    }

    /// Only the coordinating process may perform run-wide cleanup
    pub fn is_coordinator(&self) -> bool {
        matches!(self, Self::Master)
    }

    /// Label set identifying this process's series in the gateway
    pub fn grouping_key(&self) -> BTreeMap<String, String> {
        let mut key = BTreeMap::new();
        key.insert(WORKER_LABEL.to_string(), self.as_str().to_string());
        key
    }

    /// File name of this worker's auth-state snapshot
    pub fn state_file_name(&self) -> String {
        match self {
            Self::Master => "state.json".to_string(),
            Self::Worker(id) => format!("state_{}.json", id),
        }
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every worker label a run may have written to the gateway
pub fn known_worker_labels() -> Vec<String> {
    std::iter::once("master".to_string())
        .chain((0..MAX_WORKERS).map(|i| format!("gw{}", i)))
        .collect()
}

/// Login credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: "john".to_string(),
            password: "demo".to_string(),
        }
    }
}

/// A bank customer as entered on the registration form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub first_name: String,
    pub last_name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub phone: String,
    pub ssn: String,
    pub username: String,
    pub password: String,
}

impl User {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// Browser storage snapshot in the Playwright `storageState` format
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub origins: Vec<OriginState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    /// Unix seconds; -1 marks a session cookie
    #[serde(default = "session_expiry")]
    pub expires: f64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: SameSite,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn session_expiry() -> f64 {
    -1.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginState {
    pub origin: String,
    #[serde(rename = "localStorage", default)]
    pub local_storage: Vec<StorageEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub name: String,
    pub value: String,
}

impl Cookie {
    pub fn is_expired(&self, now_secs: f64) -> bool {
        self.expires >= 0.0 && self.expires <= now_secs
    }
}

impl StorageState {
    /// Load a snapshot written by [`StorageState::save`] or by Playwright
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)?;
        Ok(state)
    }

    /// Write the snapshot as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    /// Whether the snapshot still carries an unexpired server session cookie
    pub fn has_live_session(&self) -> bool {
        let now = chrono::Utc::now().timestamp() as f64;
        self.cookie(SESSION_COOKIE)
            .map(|c| !c.is_expired(now) && !c.value.is_empty())
            .unwrap_or(false)
    }

    /// Reject snapshots that cannot represent a logged-in session
    pub fn validate(&self) -> Result<()> {
        if self.cookies.is_empty() {
            return Err(Error::InvalidStorageState("no cookies captured".to_string()));
        }
        if let Some(c) = self.cookies.iter().find(|c| c.name.is_empty() || c.domain.is_empty()) {
            return Err(Error::InvalidStorageState(format!(
                "cookie '{}' is missing a name or domain",
                c.name
            )));
        }
        Ok(())
    }
}
