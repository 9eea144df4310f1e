//! ---
//! crorch_section: "05-networking-external-interfaces"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Callback delivery of terminal lifecycle results."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! Delivery of terminal results to the caller's callback target.
//!
//! HTTP targets receive a `PUT` with the JSON body and an empty content type,
//! which is what presigned callback URLs are signed for. The `stdout:` target
//! prints the body as one JSON line and is what the CLI uses.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use crorch_common::ReporterConfig;
use crorch_resilience::{retry_with_backoff, Deadline, RetryPolicy};
use parking_lot::Mutex;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::result::CallbackPayload;

pub const STDOUT_TARGET: &str = "stdout:";

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid callback target: {0}")]
    InvalidTarget(String),
    #[error("callback transport failed: {0}")]
    Transport(String),
    #[error("callback endpoint answered HTTP {0}")]
    Status(u16),
    #[error("callback body could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Bad targets and bodies fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transport(_) | DeliveryError::Status(_))
    }
}

/// Moves an encoded callback body to a target.
#[async_trait]
pub trait CallbackTransport: Send + Sync {
    async fn send(&self, target: &str, body: &[u8]) -> Result<(), DeliveryError>;
}

/// reqwest-backed transport for `http(s)://` targets plus `stdout:`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build callback HTTP client")?;
        Ok(Self { client })
    }

    fn write_stdout(body: &[u8]) -> Result<(), DeliveryError> {
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(body)
            .and_then(|()| stdout.write_all(b"\n"))
            .and_then(|()| stdout.flush())
            .map_err(|err| DeliveryError::Transport(err.to_string()))
    }
}

#[async_trait]
impl CallbackTransport for HttpTransport {
    async fn send(&self, target: &str, body: &[u8]) -> Result<(), DeliveryError> {
        if target == STDOUT_TARGET {
            return Self::write_stdout(body);
        }
        let url = Url::parse(target).map_err(|err| DeliveryError::InvalidTarget(err.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DeliveryError::InvalidTarget(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }

        let response = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "")
            .header(CONTENT_LENGTH, body.len())
            .body(body.to_vec())
            .send()
            .await
            .map_err(|err| DeliveryError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// In-memory transport capturing every delivered body.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    deliveries: Mutex<Vec<(String, Value)>>,
    failures_left: Mutex<usize>,
    attempts: Mutex<usize>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` sends fail with a transport error.
    pub fn fail_next(&self, count: usize) {
        *self.failures_left.lock() = count;
    }

    pub fn deliveries(&self) -> Vec<(String, Value)> {
        self.deliveries.lock().clone()
    }

    /// Decoded payloads in delivery order.
    pub fn payloads(&self) -> Vec<CallbackPayload> {
        self.deliveries
            .lock()
            .iter()
            .filter_map(|(_, body)| serde_json::from_value(body.clone()).ok())
            .collect()
    }

    /// Sends attempted, including failed ones.
    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

#[async_trait]
impl CallbackTransport for RecordingTransport {
    async fn send(&self, target: &str, body: &[u8]) -> Result<(), DeliveryError> {
        *self.attempts.lock() += 1;
        {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(DeliveryError::Transport("connection reset".into()));
            }
        }
        let value: Value = serde_json::from_slice(body)?;
        self.deliveries.lock().push((target.to_owned(), value));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: usize },
    Abandoned { attempts: usize, reason: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered { .. } => "delivered",
            DeliveryOutcome::Abandoned { .. } => "abandoned",
        }
    }
}

/// Retries callback delivery, then gives up with an error log.
#[derive(Clone)]
pub struct ResponseReporter {
    transport: Arc<dyn CallbackTransport>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for ResponseReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseReporter")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ResponseReporter {
    pub fn new(transport: Arc<dyn CallbackTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn from_config(config: &ReporterConfig) -> anyhow::Result<Self> {
        let transport = HttpTransport::new(config.request_timeout)?;
        Ok(Self::new(
            Arc::new(transport),
            RetryPolicy::for_reporter(config),
        ))
    }

    pub async fn deliver(&self, target: &str, payload: &CallbackPayload) -> DeliveryOutcome {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(err) => {
                let err = DeliveryError::from(err);
                error!(request_id = %payload.request_id, error = %err, "callback abandoned");
                return DeliveryOutcome::Abandoned {
                    attempts: 0,
                    reason: err.to_string(),
                };
            }
        };

        let mut attempts = 0;
        let outcome = retry_with_backoff(
            &self.policy,
            &Deadline::unbounded(),
            "callback",
            DeliveryError::is_retryable,
            |attempt| {
                attempts = attempt;
                self.transport.send(target, &body)
            },
        )
        .await;

        match outcome {
            Ok(()) => {
                debug!(request_id = %payload.request_id, attempts, "callback delivered");
                info!(
                    request_id = %payload.request_id,
                    status = payload.status.as_str(),
                    physical_id = %payload.physical_resource_id,
                    "result reported"
                );
                DeliveryOutcome::Delivered { attempts }
            }
            Err(err) => {
                let attempts = err.attempts();
                let reason = err.into_last().to_string();
                error!(
                    request_id = %payload.request_id,
                    attempts,
                    error = %reason,
                    "callback abandoned"
                );
                DeliveryOutcome::Abandoned { attempts, reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::result::LifecycleStatus;

    fn payload() -> CallbackPayload {
        CallbackPayload {
            status: LifecycleStatus::Success,
            reason: String::new(),
            physical_resource_id: "app-workergroup".into(),
            stack_id: "stack".into(),
            request_id: "req-1".into(),
            logical_resource_id: "WorkerGroup".into(),
            data: Map::new(),
        }
    }

    fn fast_policy(attempts: usize) -> RetryPolicy {
        RetryPolicy::new(
            attempts,
            Duration::from_millis(10),
            Duration::from_millis(40),
            Duration::ZERO,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transport_failures_then_delivers() {
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_next(2);
        let reporter = ResponseReporter::new(transport.clone(), fast_policy(3));

        let outcome = reporter.deliver("https://cb.example.com/x", &payload()).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 3 });
        assert_eq!(transport.payloads(), vec![payload()]);
    }

    #[tokio::test(start_paused = true)]
    async fn abandons_after_the_configured_attempts() {
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_next(10);
        let reporter = ResponseReporter::new(transport.clone(), fast_policy(3));

        let outcome = reporter.deliver("https://cb.example.com/x", &payload()).await;
        assert!(matches!(outcome, DeliveryOutcome::Abandoned { attempts: 3, .. }));
        assert_eq!(transport.attempts(), 3);
        assert!(transport.deliveries().is_empty());
    }

    #[tokio::test]
    async fn invalid_targets_are_not_retried() {
        let transport = HttpTransport::new(Duration::from_secs(1)).expect("client");
        let reporter = ResponseReporter::new(Arc::new(transport), fast_policy(3));

        let outcome = reporter.deliver("ftp://cb.example.com/x", &payload()).await;
        let DeliveryOutcome::Abandoned { attempts, reason } = outcome else {
            panic!("expected abandonment");
        };
        assert_eq!(attempts, 1);
        assert!(reason.contains("unsupported scheme ftp"));
    }

    #[test]
    fn only_transport_and_status_errors_retry() {
        assert!(DeliveryError::Status(503).is_retryable());
        assert!(DeliveryError::Transport("reset".into()).is_retryable());
        assert!(!DeliveryError::InvalidTarget("x".into()).is_retryable());
    }
}
