//! Session and per-test hooks
//!
//! Wraps every test body with metrics recording, outcome classification and
//! the circuit breaker. Once an internal-error page is seen the breaker
//! trips and the runner starts no further tests in this worker.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use parabank_common::WorkerId;

use crate::driver::Page;
use crate::error::{E2eError, E2eResult};
use crate::metrics::{ExecutionMetrics, MetricsRegistry, Outcome};
use crate::pushgateway::MetricsEmitter;
use crate::stability::detect_internal_error;

/// What the hooks know about the test being run
#[derive(Debug, Clone)]
pub struct TestContext {
    pub name: String,
    /// 1-based
    pub attempt: u32,
    pub requires_login: bool,
    pub worker: WorkerId,
    /// The runner will rerun this test if the attempt fails
    pub will_retry: bool,
}

impl TestContext {
    pub fn new(name: impl Into<String>, worker: WorkerId) -> Self {
        Self {
            name: name.into(),
            attempt: 1,
            requires_login: false,
            worker,
            will_retry: false,
        }
    }

    pub fn requires_login(mut self, requires_login: bool) -> Self {
        self.requires_login = requires_login;
        self
    }

    pub fn attempt(mut self, attempt: u32, will_retry: bool) -> Self {
        self.attempt = attempt;
        self.will_retry = will_retry;
        self
    }
}

/// Result of one test attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub name: String,
    pub outcome: Outcome,
    pub attempt: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// This attempt tripped the circuit breaker
    #[serde(default)]
    pub circuit_breaker: bool,
}

impl TestReport {
    pub fn is_failure(&self) -> bool {
        self.outcome == Outcome::Failed
    }
}

/// Why the run stopped early
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortReason {
    pub test_name: String,
    pub message: String,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server overload detected during {}: {}", self.test_name, self.message)
    }
}

pub struct LifecycleHooks {
    registry: Arc<MetricsRegistry>,
    emitter: Option<Arc<MetricsEmitter>>,
    worker: WorkerId,
    check_timeout: Duration,
    abort: Option<AbortReason>,
}

impl LifecycleHooks {
    pub fn new(
        registry: Arc<MetricsRegistry>,
        emitter: Option<Arc<MetricsEmitter>>,
        worker: WorkerId,
        check_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            emitter,
            worker,
            check_timeout,
            abort: None,
        }
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    /// Log the session boundary; the coordinator also clears stale metric groups
    pub async fn session_start(&self) {
        info!("Starting test session on {}", self.worker);
        if !self.worker.is_coordinator() {
            return;
        }
        if let Some(emitter) = &self.emitter {
            emitter.cleanup_metrics().await;
        }
    }

    /// Run one test body under metrics and outcome classification.
    ///
    /// `page` is checked for internal-error markers when the body fails.
    pub async fn run_test<Fut>(&mut self, ctx: &TestContext, page: Option<&dyn Page>, body: Fut) -> TestReport
    where
        Fut: Future<Output = E2eResult<()>>,
    {
        info!("Running {} (attempt {}) on {}", ctx.name, ctx.attempt, ctx.worker);
        let mut guard = ExecutionMetrics::start(
            ctx.name.clone(),
            &self.registry,
            self.emitter.clone(),
            ctx.worker.clone(),
        );

        let result = body.await;
        let (outcome, message, tripped) = match result {
            Ok(()) => (Outcome::Passed, None, false),
            Err(E2eError::Skipped(reason)) => {
                info!("{} skipped: {}", ctx.name, reason);
                (Outcome::Skipped, Some(reason), false)
            }
            Err(e) if e.is_service_unavailable() => {
                let message = e.to_string();
                self.trip(ctx, &message);
                (Outcome::ConditionalPass, Some(message), true)
            }
            Err(e) => self.classify_failure(ctx, page, e).await,
        };

        let duration_ms = guard.elapsed().as_millis() as u64;
        guard.set_status(outcome);
        let outcome = guard.finish(outcome == Outcome::Failed).await;

        match outcome {
            Outcome::Passed => info!("{} passed in {} ms", ctx.name, duration_ms),
            Outcome::Failed => error!(
                "{} failed: {}",
                ctx.name,
                message.as_deref().unwrap_or("unknown error")
            ),
            Outcome::Rerun => warn!("{} failed, will rerun", ctx.name),
            Outcome::ConditionalPass => warn!("{} conditionally passed (server fault)", ctx.name),
            Outcome::Skipped => {}
        }

        TestReport {
            name: ctx.name.clone(),
            outcome,
            attempt: ctx.attempt,
            duration_ms,
            error: message,
            circuit_breaker: tripped,
        }
    }

    async fn classify_failure(
        &mut self,
        ctx: &TestContext,
        page: Option<&dyn Page>,
        err: E2eError,
    ) -> (Outcome, Option<String>, bool) {
        let message = err.to_string();
        let signal = match page {
            Some(page) => detect_internal_error(page, self.check_timeout).await,
            None => None,
        };

        if let Some(signal) = signal {
            self.trip(ctx, &signal.message);
            let outcome = if ctx.requires_login {
                Outcome::ConditionalPass
            } else {
                Outcome::Failed
            };
            return (outcome, Some(message), true);
        }

        let outcome = if ctx.will_retry {
            Outcome::Rerun
        } else {
            Outcome::Failed
        };
        (outcome, Some(message), false)
    }

    fn trip(&mut self, ctx: &TestContext, message: &str) {
        if self.abort.is_some() {
            return;
        }
        error!("Circuit breaker tripped by {}: {}", ctx.name, message);
        self.abort = Some(AbortReason {
            test_name: ctx.name.clone(),
            message: message.to_string(),
        });
    }

    pub fn should_abort(&self) -> bool {
        self.abort.is_some()
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        self.abort.as_ref()
    }

    /// Log the session summary and exit reason
    pub fn session_finish(&self, passed: usize, failed: usize, skipped: usize) {
        info!(
            "Test session finished on {}: {} passed, {} failed, {} skipped",
            self.worker, passed, failed, skipped
        );
        if let Some(reason) = &self.abort {
            error!("Run aborted: {}", reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hooks() -> LifecycleHooks {
        let registry = Arc::new(MetricsRegistry::new().unwrap());
        LifecycleHooks::new(registry, None, WorkerId::Master, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_passing_body() {
        let mut hooks = hooks();
        let ctx = TestContext::new("test_transfer_funds", WorkerId::Master);
        let report = hooks.run_test(&ctx, None, async { Ok(()) }).await;
        assert_eq!(report.outcome, Outcome::Passed);
        assert!(report.error.is_none());
        assert_eq!(hooks.registry().passes.get(), 1);
        assert!(!hooks.should_abort());
    }

    #[tokio::test]
    async fn test_service_unavailable_is_conditional_pass_and_aborts() {
        let mut hooks = hooks();
        let ctx = TestContext::new("test_bill_pay", WorkerId::Master).requires_login(true);
        let report = hooks
            .run_test(&ctx, None, async {
                Err(E2eError::ServiceUnavailable("An internal error has occurred".into()))
            })
            .await;
        assert_eq!(report.outcome, Outcome::ConditionalPass);
        assert!(report.circuit_breaker);
        assert!(hooks.should_abort());
        assert_eq!(hooks.abort_reason().unwrap().test_name, "test_bill_pay");
        assert_eq!(hooks.registry().skipped.get(), 1);
        assert_eq!(hooks.registry().failures.get(), 0);
    }

    #[tokio::test]
    async fn test_plain_failure_reruns_then_fails() {
        let mut hooks = hooks();
        let first = TestContext::new("test_logout", WorkerId::Master).attempt(1, true);
        let report = hooks
            .run_test(&first, None, async { Err(E2eError::AssertionFailed("nope".into())) })
            .await;
        assert_eq!(report.outcome, Outcome::Rerun);

        let last = TestContext::new("test_logout", WorkerId::Master).attempt(2, false);
        let report = hooks
            .run_test(&last, None, async { Err(E2eError::AssertionFailed("nope".into())) })
            .await;
        assert_eq!(report.outcome, Outcome::Failed);
        assert_eq!(hooks.registry().reruns.get(), 1);
        assert_eq!(hooks.registry().failures.get(), 1);
        assert_eq!(hooks.registry().runs.get(), 2);
        assert!(!hooks.should_abort());
    }

    #[tokio::test]
    async fn test_skip() {
        let mut hooks = hooks();
        let ctx = TestContext::new("test_contact_us", WorkerId::Master);
        let report = hooks
            .run_test(&ctx, None, async { Err(E2eError::Skipped("not on this env".into())) })
            .await;
        assert_eq!(report.outcome, Outcome::Skipped);
        assert_eq!(hooks.registry().skipped.get(), 1);
    }

    #[test]
    fn test_abort_reason_display() {
        let reason = AbortReason {
            test_name: "test_transfer_funds".into(),
            message: "Internal Error".into(),
        };
        assert_eq!(
            reason.to_string(),
            "server overload detected during test_transfer_funds: Internal Error"
        );
    }
}
