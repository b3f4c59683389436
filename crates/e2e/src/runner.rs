//! Main test runner that orchestrates the session, browser and hooks

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use parabank_common::{Settings, WorkerId};

use crate::driver::Browser;
use crate::error::{E2eError, E2eResult};
use crate::lifecycle::{AbortReason, LifecycleHooks, TestContext, TestReport};
use crate::metrics::{MetricsRegistry, Outcome};
use crate::pushgateway::MetricsEmitter;
use crate::scenario::Scenario;
use crate::session::{AuthPhase, AuthStateManager};
use crate::stability::RetryPolicy;
use crate::steps::StepExecutor;

/// Result of running all tests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestSuiteResult {
    pub worker: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Includes conditional passes
    pub skipped: usize,
    pub conditional_passes: usize,
    pub reruns: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<AbortReason>,
    /// Every attempt, reruns included
    pub results: Vec<TestReport>,
    /// Tests never started because the run aborted
    #[serde(default)]
    pub not_run: Vec<String>,
}

impl TestSuiteResult {
    fn record(&mut self, reports: Vec<TestReport>) {
        if let Some(last) = reports.last() {
            match last.outcome {
                Outcome::Passed => self.passed += 1,
                Outcome::Failed | Outcome::Rerun => self.failed += 1,
                Outcome::Skipped => self.skipped += 1,
                Outcome::ConditionalPass => {
                    self.skipped += 1;
                    self.conditional_passes += 1;
                }
            }
        }
        self.reruns += reports.iter().filter(|r| r.outcome == Outcome::Rerun).count();
        self.results.extend(reports);
    }

    /// 0 clean, 1 test failures, 3 aborted by the circuit breaker
    pub fn exit_code(&self) -> i32 {
        if self.aborted.is_some() {
            3
        } else if self.failed > 0 {
            1
        } else {
            0
        }
    }
}

/// Configuration for the test runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub scenarios_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Extra attempts for a failing test
    pub reruns: u32,
    /// `(index, total)` slice of the scenario list for this worker
    pub shard: Option<(usize, usize)>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            scenarios_dir: PathBuf::from("scenarios"),
            output_dir: parabank_common::default_results_dir(),
            reruns: 0,
            shard: None,
        }
    }
}

/// Runs scenarios sequentially for one worker
pub struct TestRunner {
    settings: Settings,
    browser: Arc<dyn Browser>,
    session: AuthStateManager,
    hooks: LifecycleHooks,
    policy: RetryPolicy,
    config: RunnerConfig,
}

impl TestRunner {
    pub fn new(settings: Settings, browser: Arc<dyn Browser>, worker: WorkerId, config: RunnerConfig) -> E2eResult<Self> {
        let registry = Arc::new(MetricsRegistry::new()?);
        let emitter = if settings.metrics.enabled {
            Some(Arc::new(MetricsEmitter::from_config(&settings.metrics)?))
        } else {
            None
        };
        Ok(Self::with_parts(settings, browser, worker, config, registry, emitter))
    }

    /// Build with an explicit registry and emitter
    pub fn with_parts(
        settings: Settings,
        browser: Arc<dyn Browser>,
        worker: WorkerId,
        config: RunnerConfig,
        registry: Arc<MetricsRegistry>,
        emitter: Option<Arc<MetricsEmitter>>,
    ) -> Self {
        let hooks = LifecycleHooks::new(registry, emitter, worker.clone(), settings.timeouts.error_check());
        Self {
            session: AuthStateManager::new(&settings, worker),
            policy: RetryPolicy::from_timeouts(&settings.timeouts),
            settings,
            browser,
            hooks,
            config,
        }
    }

    pub fn session(&self) -> &AuthStateManager {
        &self.session
    }

    pub fn hooks(&self) -> &LifecycleHooks {
        &self.hooks
    }

    /// Session-start hooks, then the worker's one-time login
    pub async fn start(&mut self) -> E2eResult<AuthPhase> {
        self.hooks.session_start().await;
        let phase = self.session.establish(self.browser.as_ref()).await?;
        info!("Auth state for {}: {:?}", self.hooks.worker(), phase);
        Ok(phase)
    }

    fn load(&self) -> E2eResult<Vec<Scenario>> {
        let scenarios = Scenario::load_all(&self.config.scenarios_dir)?;
        debug!(
            "Loaded {} scenario(s) from {}",
            scenarios.len(),
            self.config.scenarios_dir.display()
        );
        Ok(self.select(scenarios))
    }

    /// This worker's share of `scenarios`
    fn select(&self, scenarios: Vec<Scenario>) -> Vec<Scenario> {
        match self.config.shard {
            Some((index, total)) => Scenario::shard(scenarios, index, total),
            None => scenarios,
        }
    }

    /// Run all scenarios in the scenarios directory
    pub async fn run_all(&mut self) -> E2eResult<TestSuiteResult> {
        let scenarios = self.load()?;
        self.run_scenarios(&scenarios).await
    }

    /// Run scenarios matching a tag
    pub async fn run_tagged(&mut self, tag: &str) -> E2eResult<TestSuiteResult> {
        let scenarios: Vec<Scenario> = self.load()?.into_iter().filter(|s| s.has_tag(tag)).collect();
        self.run_scenarios(&scenarios).await
    }

    /// Run a specific scenario by name.
    ///
    /// Under sharding only the worker owning the scenario runs it; the others
    /// return an empty result.
    pub async fn run_named(&mut self, name: &str) -> E2eResult<TestSuiteResult> {
        let all = Scenario::load_all(&self.config.scenarios_dir)?;
        if !all.iter().any(|s| s.name == name) {
            return Err(E2eError::ScenarioParse(format!("Test not found: {}", name)));
        }
        let scenarios: Vec<Scenario> = self.select(all).into_iter().filter(|s| s.name == name).collect();
        if scenarios.is_empty() {
            debug!("{} belongs to another shard", name);
        }
        self.run_scenarios(&scenarios).await
    }

    /// Run scenarios in order until done or the circuit breaker trips
    pub async fn run_scenarios(&mut self, scenarios: &[Scenario]) -> E2eResult<TestSuiteResult> {
        let start = Instant::now();
        let mut suite = TestSuiteResult {
            worker: self.hooks.worker().to_string(),
            total: scenarios.len(),
            ..Default::default()
        };

        info!("Running {} test(s)...", scenarios.len());

        for scenario in scenarios {
            if self.hooks.should_abort() {
                suite.not_run.push(scenario.name.clone());
                continue;
            }
            let reports = self.run_scenario(scenario).await;
            suite.record(reports);
        }

        if !suite.not_run.is_empty() {
            warn!("{} test(s) not run after abort", suite.not_run.len());
        }
        suite.aborted = self.hooks.abort_reason().cloned();
        suite.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Test Results: {} passed, {} failed, {} skipped ({} conditional), {} rerun(s) ({} ms)",
            suite.passed, suite.failed, suite.skipped, suite.conditional_passes, suite.reruns, suite.duration_ms
        );
        Ok(suite)
    }

    /// Run one scenario with reruns; returns every attempt's report
    pub async fn run_scenario(&mut self, scenario: &Scenario) -> Vec<TestReport> {
        let worker = self.hooks.worker().clone();
        let requires_login = scenario.requires_login();
        let max_attempts = self.config.reruns + 1;
        let mut reports = Vec::new();

        for attempt in 1..=max_attempts {
            let ctx = TestContext::new(scenario.name.clone(), worker.clone())
                .requires_login(requires_login)
                .attempt(attempt, attempt < max_attempts);

            let state = if scenario.fresh_context {
                None
            } else {
                self.session.context_for(&scenario.name)
            };
            let restored = state.is_some();
            let report = match self.browser.new_page(state.as_ref()).await {
                Ok(page) => {
                    let body = StepExecutor::new(
                        page.as_ref(),
                        &mut self.session,
                        &self.settings,
                        self.policy.clone(),
                        requires_login,
                        restored,
                    )
                    .run(&scenario.steps);
                    let report = self.hooks.run_test(&ctx, Some(page.as_ref()), body).await;
                    if let Err(e) = page.close().await {
                        debug!("Closing page for {} failed: {}", scenario.name, e);
                    }
                    report
                }
                Err(e) => self.hooks.run_test(&ctx, None, async move { Err(e) }).await,
            };

            let again = report.outcome == Outcome::Rerun && !self.hooks.should_abort();
            reports.push(report);
            if !again {
                break;
            }
        }
        reports
    }

    /// Session-finish hooks, state cleanup and browser shutdown
    pub async fn finish(&mut self, suite: &TestSuiteResult) -> E2eResult<()> {
        self.hooks.session_finish(suite.passed, suite.failed, suite.skipped);
        self.session.finish()?;
        self.browser.shutdown().await
    }

    /// Write test results to JSON file
    pub fn write_results(&self, results: &TestSuiteResult) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;

        let file_name = match self.hooks.worker() {
            WorkerId::Master => "test-results.json".to_string(),
            WorkerId::Worker(id) => format!("test-results_{}.json", id),
        };
        let path = self.config.output_dir.join(file_name);
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}
