//! Playwright browser automation
//!
//! Drives a long-lived Node process that owns the Playwright browser. Rust
//! sends one JSON request per line on stdin and the bridge answers with one
//! JSON line on stdout carrying the same `id`:
//!
//! ```text
//! → {"id":7,"op":"click","page":2,"args":{"selector":{"css":"#go"},"force":false,"timeout":3000}}
//! ← {"id":7,"ok":true,"result":null}
//! ← {"id":8,"ok":false,"error":{"name":"TimeoutError","message":"locator.click: Timeout 3000ms exceeded."}}
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as TokioCommand};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use parabank_common::{Settings, StorageState};

use crate::driver::{Browser, ClickOptions, LoadState, Page, SelectBy, Selector, WaitState};
use crate::error::{E2eError, E2eResult};

const BRIDGE_SCRIPT: &str = r#"
const readline = require('readline');
const playwright = require('playwright');

let browser = null;
const pages = new Map();
let nextPage = 1;

function locator(page, sel) {
  let loc = page.locator(sel.css);
  if (sel.has_text) loc = loc.filter({ hasText: sel.has_text });
  return loc.first();
}

function pageOf(id) {
  const entry = pages.get(id);
  if (!entry) throw new Error(`unknown page ${id}`);
  return entry;
}

const ops = {
  async launch(_, a) {
    browser = await playwright[a.browser].launch({ headless: a.headless });
    return null;
  },
  async new_page(_, a) {
    const options = { viewport: a.viewport };
    if (a.storage_state) options.storageState = a.storage_state;
    const context = await browser.newContext(options);
    const page = await context.newPage();
    const id = nextPage++;
    pages.set(id, { context, page });
    return id;
  },
  async goto({ page }, a) { await page.goto(a.url, { waitUntil: a.wait_until, timeout: a.timeout }); return null; },
  async reload({ page }, a) { await page.reload({ waitUntil: a.wait_until, timeout: a.timeout }); return null; },
  async url({ page }) { return page.url(); },
  async content({ page }) { return await page.content(); },
  async wait_for_url({ page }, a) {
    await page.waitForURL(new RegExp(a.pattern), { timeout: a.timeout });
    return null;
  },
  async is_visible({ page }, a) {
    return await locator(page, a.selector)
      .waitFor({ state: 'visible', timeout: a.timeout })
      .then(() => true, () => false);
  },
  async wait_for({ page }, a) {
    await locator(page, a.selector).waitFor({ state: a.state, timeout: a.timeout });
    return null;
  },
  async inner_text({ page }, a) { return await locator(page, a.selector).innerText({ timeout: a.timeout }); },
  async click({ page }, a) {
    await locator(page, a.selector).click({ force: a.force, timeout: a.timeout });
    return null;
  },
  async fill({ page }, a) {
    await locator(page, a.selector).fill(a.value, { timeout: a.timeout });
    return null;
  },
  async option_labels({ page }, a) {
    return await locator(page, a.selector).locator('option').allInnerTexts();
  },
  async select_option({ page }, a) {
    await locator(page, a.selector).selectOption(a.option, { timeout: a.timeout });
    return null;
  },
  async storage_state({ context }) { return await context.storageState(); },
  async close_page(_, a, id) {
    const entry = pages.get(id);
    pages.delete(id);
    if (entry) await entry.context.close();
    return null;
  },
  async shutdown() {
    if (browser) await browser.close();
    setImmediate(() => process.exit(0));
    return null;
  },
};

const rl = readline.createInterface({ input: process.stdin });
rl.on('line', async (line) => {
  let req;
  try { req = JSON.parse(line); } catch (e) { return; }
  const reply = { id: req.id };
  try {
    const op = ops[req.op];
    if (!op) throw new Error(`unknown op ${req.op}`);
    const target = req.page == null || req.op === 'close_page' ? {} : pageOf(req.page);
    reply.ok = true;
    reply.result = await op(target, req.args || {}, req.page);
  } catch (e) {
    reply.ok = false;
    reply.error = { name: (e && e.name) || 'Error', message: (e && e.message) || String(e) };
  }
  process.stdout.write(JSON.stringify(reply) + '\n');
});
rl.on('close', async () => { if (browser) await browser.close(); process.exit(0); });
"#;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BrowserKind {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserKind::Chromium => "chromium",
            BrowserKind::Firefox => "firefox",
            BrowserKind::Webkit => "webkit",
        }
    }
}

impl FromStr for BrowserKind {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chromium" | "chrome" => Ok(BrowserKind::Chromium),
            "firefox" => Ok(BrowserKind::Firefox),
            "webkit" | "safari" => Ok(BrowserKind::Webkit),
            other => Err(E2eError::Browser(format!("unsupported browser '{}'", other))),
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub browser: BrowserKind,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Upper bound on any single bridge round trip
    pub request_timeout: Duration,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            browser: BrowserKind::Chromium,
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl PlaywrightConfig {
    pub fn from_settings(settings: &Settings) -> E2eResult<Self> {
        Ok(Self {
            browser: settings.browser.kind.parse()?,
            headless: settings.browser.headless,
            viewport_width: settings.browser.viewport_width,
            viewport_height: settings.browser.viewport_height,
            ..Default::default()
        })
    }
}

/// Check if Playwright is installed
pub fn check_playwright_installed() -> E2eResult<()> {
    let output = Command::new("npx")
        .args(["playwright", "--version"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match output {
        Ok(status) if status.success() => Ok(()),
        _ => Err(E2eError::PlaywrightNotFound),
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: u64,
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<ReplyError>,
}

#[derive(Debug, Deserialize)]
struct ReplyError {
    #[serde(default)]
    name: String,
    message: String,
}

impl From<ReplyError> for E2eError {
    fn from(e: ReplyError) -> Self {
        if e.name == "TimeoutError" {
            E2eError::Timeout(e.message)
        } else {
            E2eError::Browser(e.message)
        }
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// The Node process and its request/response plumbing
struct Bridge {
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: Pending,
    next_id: AtomicU64,
    request_timeout: Duration,
    child: tokio::sync::Mutex<Child>,
    // Holds the bridge script on disk for the lifetime of the process
    _script_dir: tempfile::TempDir,
}

impl Bridge {
    async fn spawn(config: &PlaywrightConfig) -> E2eResult<Self> {
        let script_dir = tempfile::tempdir()?;
        let script_path = script_dir.path().join("bridge.js");
        std::fs::write(&script_path, BRIDGE_SCRIPT)?;

        // The script lives in a temp dir; resolve `playwright` from the project
        let node_path = std::env::current_dir()?.join("node_modules");
        debug!("Starting Playwright bridge {}", script_path.display());

        let mut child = TokioCommand::new("node")
            .arg(&script_path)
            .env("NODE_PATH", node_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| E2eError::Bridge(format!("failed to start node: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| E2eError::Bridge("bridge stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| E2eError::Bridge("bridge stdout unavailable".into()))?;
        let stderr = child.stderr.take();

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<Reply>(&line) {
                        Ok(reply) => {
                            if let Some(tx) = reader_pending.lock().remove(&reply.id) {
                                let _ = tx.send(reply);
                            }
                        }
                        Err(_) => debug!("[bridge] {}", line),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Bridge stdout read failed: {}", e);
                        break;
                    }
                }
            }
            // Wake every waiter; dropped senders surface as bridge errors
            reader_pending.lock().clear();
        });

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[bridge stderr] {}", line);
                }
            });
        }

        Ok(Self {
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            request_timeout: config.request_timeout,
            child: tokio::sync::Mutex::new(child),
            _script_dir: script_dir,
        })
    }

    async fn call(&self, op: &str, page: Option<u64>, args: Value) -> E2eResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let mut line = serde_json::to_string(&json!({
            "id": id,
            "op": op,
            "page": page,
            "args": args,
        }))?;
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await
            }
            .await
            {
                self.pending.lock().remove(&id);
                return Err(E2eError::Bridge(format!("{} could not be sent: {}", op, e)));
            }
        }

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(E2eError::Bridge(format!("bridge exited during {}", op))),
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(E2eError::Bridge(format!(
                    "{} timed out after {} s",
                    op,
                    self.request_timeout.as_secs()
                )));
            }
        };

        if reply.ok {
            Ok(reply.result)
        } else {
            Err(reply
                .error
                .map(E2eError::from)
                .unwrap_or_else(|| E2eError::Browser(format!("{} failed without a message", op))))
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// A browser launched through the bridge
pub struct PlaywrightBrowser {
    bridge: Arc<Bridge>,
    config: PlaywrightConfig,
}

impl PlaywrightBrowser {
    pub async fn launch(config: PlaywrightConfig) -> E2eResult<Self> {
        let bridge = Arc::new(Bridge::spawn(&config).await?);
        bridge
            .call(
                "launch",
                None,
                json!({ "browser": config.browser.as_str(), "headless": config.headless }),
            )
            .await?;
        info!(
            "Launched {} ({})",
            config.browser.as_str(),
            if config.headless { "headless" } else { "headed" }
        );
        Ok(Self { bridge, config })
    }
}

#[async_trait]
impl Browser for PlaywrightBrowser {
    async fn new_page(&self, storage_state: Option<&StorageState>) -> E2eResult<Box<dyn Page>> {
        let args = json!({
            "viewport": { "width": self.config.viewport_width, "height": self.config.viewport_height },
            "storage_state": storage_state,
        });
        let value = self.bridge.call("new_page", None, args).await?;
        let id = value
            .as_u64()
            .ok_or_else(|| E2eError::Bridge(format!("new_page returned {}", value)))?;
        Ok(Box::new(PlaywrightPage {
            bridge: self.bridge.clone(),
            id,
        }))
    }

    async fn shutdown(&self) -> E2eResult<()> {
        let result = self.bridge.call("shutdown", None, Value::Null).await;
        let mut child = self.bridge.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("Playwright bridge did not exit, killing it");
                child.kill().await?;
            }
        }
        result.map(|_| ())
    }
}

/// One browser context with a single page
pub struct PlaywrightPage {
    bridge: Arc<Bridge>,
    id: u64,
}

impl PlaywrightPage {
    async fn call(&self, op: &str, args: Value) -> E2eResult<Value> {
        self.bridge.call(op, Some(self.id), args).await
    }

    async fn call_string(&self, op: &str, args: Value) -> E2eResult<String> {
        match self.call(op, args).await? {
            Value::String(s) => Ok(s),
            other => Err(E2eError::Bridge(format!("{} returned {}", op, other))),
        }
    }
}

#[async_trait]
impl Page for PlaywrightPage {
    async fn goto(&self, url: &str, wait_until: LoadState, timeout: Duration) -> E2eResult<()> {
        debug!("goto {}", url);
        self.call(
            "goto",
            json!({ "url": url, "wait_until": wait_until.as_str(), "timeout": millis(timeout) }),
        )
        .await
        .map(|_| ())
    }

    async fn reload(&self, wait_until: LoadState, timeout: Duration) -> E2eResult<()> {
        self.call(
            "reload",
            json!({ "wait_until": wait_until.as_str(), "timeout": millis(timeout) }),
        )
        .await
        .map(|_| ())
    }

    async fn url(&self) -> E2eResult<String> {
        self.call_string("url", Value::Null).await
    }

    async fn content(&self) -> E2eResult<String> {
        self.call_string("content", Value::Null).await
    }

    async fn wait_for_url(&self, pattern: &str, timeout: Duration) -> E2eResult<()> {
        self.call(
            "wait_for_url",
            json!({ "pattern": pattern, "timeout": millis(timeout) }),
        )
        .await
        .map(|_| ())
    }

    async fn is_visible(&self, selector: &Selector, timeout: Duration) -> E2eResult<bool> {
        let value = self
            .call(
                "is_visible",
                json!({ "selector": selector, "timeout": millis(timeout) }),
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn wait_for(&self, selector: &Selector, state: WaitState, timeout: Duration) -> E2eResult<()> {
        self.call(
            "wait_for",
            json!({ "selector": selector, "state": state.as_str(), "timeout": millis(timeout) }),
        )
        .await
        .map(|_| ())
    }

    async fn inner_text(&self, selector: &Selector, timeout: Duration) -> E2eResult<String> {
        self.call_string(
            "inner_text",
            json!({ "selector": selector, "timeout": millis(timeout) }),
        )
        .await
    }

    async fn click(&self, selector: &Selector, options: ClickOptions) -> E2eResult<()> {
        self.call(
            "click",
            json!({ "selector": selector, "force": options.force, "timeout": millis(options.timeout) }),
        )
        .await
        .map(|_| ())
    }

    async fn fill(&self, selector: &Selector, value: &str, timeout: Duration) -> E2eResult<()> {
        self.call(
            "fill",
            json!({ "selector": selector, "value": value, "timeout": millis(timeout) }),
        )
        .await
        .map(|_| ())
    }

    async fn option_labels(&self, selector: &Selector) -> E2eResult<Vec<String>> {
        let value = self.call("option_labels", json!({ "selector": selector })).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn select_option(&self, selector: &Selector, option: &SelectBy, timeout: Duration) -> E2eResult<()> {
        let option = match option {
            SelectBy::Label(label) => json!({ "label": label }),
            SelectBy::Value(value) => json!({ "value": value }),
        };
        self.call(
            "select_option",
            json!({ "selector": selector, "option": option, "timeout": millis(timeout) }),
        )
        .await
        .map(|_| ())
    }

    async fn wait_for_timeout(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn storage_state(&self) -> E2eResult<StorageState> {
        let value = self.call("storage_state", Value::Null).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn close(&self) -> E2eResult<()> {
        self.call("close_page", Value::Null).await.map(|_| ())
    }
}
