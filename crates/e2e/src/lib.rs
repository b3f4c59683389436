//! ParaBank UI Test Harness
//!
//! This crate drives the ParaBank demo bank through Playwright and keeps a
//! slow, intermittently failing server from turning into flaky results:
//! - Absorbs timeouts with reload-and-retry and forced clicks
//! - Logs in once per worker and shares the saved session
//! - Records per-test metrics and pushes them to a Prometheus Pushgateway
//! - Stops a worker's run as soon as the bank shows its internal-error page
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  parabank-e2e (one worker)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TestRunner                                                 │
//! │    ├── AuthStateManager   state_<worker>.json               │
//! │    ├── LifecycleHooks     outcome + circuit breaker         │
//! │    │     └── ExecutionMetrics -> MetricsEmitter -> gateway  │
//! │    └── StepExecutor       Scenario (YAML) steps             │
//! │          └── stability    retry_with_reload, safe_click     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  driver::{Browser, Page}                                    │
//! │    └── PlaywrightBrowser  Node bridge, JSON lines           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod pages;
pub mod playwright;
pub mod pushgateway;
pub mod runner;
pub mod scenario;
pub mod session;
pub mod stability;
pub mod steps;

pub use driver::{Browser, Page, Selector};
pub use error::{E2eError, E2eResult};
pub use lifecycle::{LifecycleHooks, TestContext, TestReport};
pub use metrics::{ExecutionMetrics, MetricsRegistry, Outcome};
pub use pushgateway::{MetricsEmitter, MetricsSink, Pushgateway};
pub use runner::{RunnerConfig, TestRunner, TestSuiteResult};
pub use scenario::{Scenario, Step};
pub use session::AuthStateManager;
