//! Delivery of worker metrics to a Prometheus Pushgateway
//!
//! Each worker pushes its whole registry under
//! `/metrics/job/<job>/worker/<id>`, replacing the previous push for that
//! grouping key. Delivery is best-effort: failures are logged and never
//! affect a test's outcome.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use parabank_common::config::MetricsConfig;
use parabank_common::known_worker_labels;

use crate::error::{E2eError, E2eResult};
use crate::metrics::MetricsRegistry;

/// Content type of the Prometheus text exposition format
pub const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

pub type GroupingKey = BTreeMap<String, String>;

/// Where encoded metrics go
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Replace every series under `job` + `grouping_key`
    async fn push(&self, job: &str, grouping_key: &GroupingKey, body: String) -> E2eResult<()>;

    /// Remove the group entirely
    async fn delete(&self, job: &str, grouping_key: &GroupingKey) -> E2eResult<()>;
}

/// HTTP client for the Pushgateway API
pub struct Pushgateway {
    client: reqwest::Client,
    base_url: reqwest::Url,
}

impl Pushgateway {
    pub fn new(base_url: &str, timeout: Duration) -> E2eResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let invalid = |reason: String| {
            E2eError::Config(parabank_common::Error::InvalidConfig(format!(
                "pushgateway_url '{}': {}",
                base_url, reason
            )))
        };
        let base_url = reqwest::Url::parse(base_url.trim()).map_err(|e| invalid(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid("not a base URL".to_string()));
        }
        Ok(Self { client, base_url })
    }

    pub fn from_config(config: &MetricsConfig) -> E2eResult<Self> {
        Self::new(&config.pushgateway_url, Duration::from_millis(config.timeout_ms))
    }

    /// `{base}/metrics/job/{job}[/{label}/{value}...]`, each segment percent-encoded
    pub fn endpoint(&self, job: &str, grouping_key: &GroupingKey) -> reqwest::Url {
        let mut url = self.base_url.clone();
        // Checked in `new`
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["metrics", "job", job]);
            for (label, value) in grouping_key {
                segments.push(label).push(value);
            }
        }
        url
    }
}

#[async_trait]
impl MetricsSink for Pushgateway {
    async fn push(&self, job: &str, grouping_key: &GroupingKey, body: String) -> E2eResult<()> {
        let url = self.endpoint(job, grouping_key);
        debug!("PUT {}", url);
        self.client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, TEXT_FORMAT)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete(&self, job: &str, grouping_key: &GroupingKey) -> E2eResult<()> {
        let url = self.endpoint(job, grouping_key);
        debug!("DELETE {}", url);
        self.client.delete(url).send().await?.error_for_status()?;
        Ok(())
    }
}

/// Result of a stale-group sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

/// Pushes registries for one job
pub struct MetricsEmitter {
    sink: Arc<dyn MetricsSink>,
    job_name: String,
}

impl MetricsEmitter {
    pub fn new(sink: Arc<dyn MetricsSink>, job_name: impl Into<String>) -> Self {
        Self {
            sink,
            job_name: job_name.into(),
        }
    }

    pub fn from_config(config: &MetricsConfig) -> E2eResult<Self> {
        let gateway = Pushgateway::from_config(config)?;
        Ok(Self::new(Arc::new(gateway), config.job_name.clone()))
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Push the full registry; returns whether the gateway accepted it.
    ///
    /// A missing grouping key pushes at the job level.
    pub async fn push_metrics(&self, registry: &MetricsRegistry, grouping_key: Option<&GroupingKey>) -> bool {
        let body = match registry.encode() {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to encode metrics: {}", e);
                return false;
            }
        };
        let empty = GroupingKey::new();
        let key = grouping_key.unwrap_or(&empty);

        match self.sink.push(&self.job_name, key, body).await {
            Ok(()) => {
                debug!("Pushed metrics for job {} {:?}", self.job_name, key);
                true
            }
            Err(e) => {
                warn!("Failed to push metrics: {}", e);
                false
            }
        }
    }

    /// Delete every grouping key a worker of this harness could have used.
    ///
    /// Run once per session by the coordinator so stale series from an
    /// earlier run do not mix with the new one.
    pub async fn cleanup_metrics(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for label in known_worker_labels() {
            let mut key = GroupingKey::new();
            key.insert(parabank_common::WORKER_LABEL.to_string(), label.clone());
            match self.sink.delete(&self.job_name, &key).await {
                Ok(()) => report.deleted.push(label),
                Err(e) => {
                    debug!("Could not delete metrics for {}: {}", label, e);
                    report.failed.push(label);
                }
            }
        }
        info!(
            "Cleaned up metrics for job {}: {} groups deleted, {} failed",
            self.job_name,
            report.deleted.len(),
            report.failed.len()
        );
        report
    }
}
