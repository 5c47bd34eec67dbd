//! Automation driver adapter. The orchestrator treats the driver as an
//! unreliable resource that can die mid-operation, so every failure is
//! classified before it reaches the run loop.

use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    /// The driver process or remote session is gone (disconnection-class).
    #[error("driver disconnected: {0}")]
    Disconnected(String),

    /// Business-rule rejection of one work item.
    #[error("rejected: {0}")]
    Rejected(String),

    /// One item's operation timed out.
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// Anything unclassified; aborts the whole run.
    #[error("{0}")]
    Other(String),
}

impl DriverError {
    pub fn is_disconnection(&self) -> bool {
        matches!(self, DriverError::Disconnected(_))
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Browser lifecycle + page primitives. Object-safe so the state can hold
/// `Arc<dyn DriverAdapter>` and tests can substitute a scripted double.
pub trait DriverAdapter: Send + Sync {
    /// Launch or re-attach the driver. Idempotent; safe to call while the
    /// driver is already up.
    fn ensure_ready(&self) -> BoxFuture<'_, DriverResult<()>>;

    fn is_alive(&self) -> BoxFuture<'_, bool>;

    /// Release the driver resource. Errors are not interesting here.
    fn close(&self) -> BoxFuture<'_, ()>;

    fn navigate<'a>(&'a self, path: &'a str) -> BoxFuture<'a, DriverResult<()>>;

    fn click<'a>(&'a self, selector: &'a str) -> BoxFuture<'a, DriverResult<()>>;

    fn wait_for<'a>(
        &'a self,
        selector: &'a str,
        timeout_ms: u64,
    ) -> BoxFuture<'a, DriverResult<()>>;
}

/// Production adapter: a remote browser-driver process speaking HTTP.
/// Liveness is a probe of its status endpoint, the same way a detached
/// browser is probed before reattaching.
pub struct HttpDriver {
    endpoint: String,
    ready_timeout: Duration,
    client: reqwest::Client,
}

const PROBE_RETRY: Duration = Duration::from_millis(250);

impl HttpDriver {
    pub fn new(endpoint: String, ready_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            endpoint,
            ready_timeout,
            client,
        }
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/status", self.endpoint);
        matches!(self.client.get(&url).send().await, Ok(r) if r.status().is_success())
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> DriverResult<()> {
        let url = format!("{}{}", self.endpoint, path);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(DriverError::Rejected(format!("HTTP {}", status)))
        } else {
            Err(DriverError::Other(format!("HTTP {}", status)))
        }
    }
}

fn classify_reqwest(e: reqwest::Error) -> DriverError {
    if e.is_timeout() {
        DriverError::Timeout(60_000)
    } else if e.is_connect() {
        DriverError::Disconnected(e.to_string())
    } else {
        DriverError::Other(e.to_string())
    }
}

impl DriverAdapter for HttpDriver {
    fn ensure_ready(&self) -> BoxFuture<'_, DriverResult<()>> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + self.ready_timeout;
            loop {
                if self.probe().await {
                    return Ok(());
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(DriverError::Disconnected(format!(
                        "driver at {} not ready within {:?}",
                        self.endpoint, self.ready_timeout
                    )));
                }
                tokio::time::sleep(PROBE_RETRY).await;
            }
        })
    }

    fn is_alive(&self) -> BoxFuture<'_, bool> {
        Box::pin(self.probe())
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let url = format!("{}/shutdown", self.endpoint);
            if let Err(e) = self.client.post(&url).send().await {
                tracing::debug!("Driver shutdown request failed: {}", e);
            }
        })
    }

    fn navigate<'a>(&'a self, path: &'a str) -> BoxFuture<'a, DriverResult<()>> {
        Box::pin(self.post("/navigate", serde_json::json!({ "path": path })))
    }

    fn click<'a>(&'a self, selector: &'a str) -> BoxFuture<'a, DriverResult<()>> {
        Box::pin(self.post("/click", serde_json::json!({ "selector": selector })))
    }

    fn wait_for<'a>(
        &'a self,
        selector: &'a str,
        timeout_ms: u64,
    ) -> BoxFuture<'a, DriverResult<()>> {
        Box::pin(self.post(
            "/wait_for",
            serde_json::json!({ "selector": selector, "timeout_ms": timeout_ms }),
        ))
    }
}
