//! ---
//! crorch_section: "03-persistence-logging"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Request-scoped logging context and lifecycle events."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
#![warn(missing_docs)]
//! Structured logging helpers stamping lifecycle correlation ids on every event.

use std::time::Duration;

pub mod macros;

#[doc(hidden)]
pub use tracing as __tracing;

/// Correlation fields propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Caller-assigned request identifier.
    pub request_id: Option<&'a str>,
    /// Logical resource name within the caller's template.
    pub logical_id: Option<&'a str>,
    /// Resource family tag (ScalingGroup, Firewall, DnsRecord).
    pub resource_type: Option<&'a str>,
    /// Lifecycle transition (Create, Update, Delete).
    pub request_type: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the request identifier.
    pub fn with_request(mut self, request_id: &'a str) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Attach the logical resource identifier.
    pub fn with_logical_id(mut self, logical_id: &'a str) -> Self {
        self.logical_id = Some(logical_id);
        self
    }

    /// Attach the resource family tag.
    pub fn with_resource_type(mut self, resource_type: &'a str) -> Self {
        self.resource_type = Some(resource_type);
        self
    }

    /// Attach the lifecycle transition.
    pub fn with_request_type(mut self, request_type: &'a str) -> Self {
        self.request_type = Some(request_type);
        self
    }
}

/// Terminal outcome recorded once per lifecycle request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The handler finished and the caller was told SUCCESS.
    Success,
    /// The handler raised an error and the caller was told FAILED.
    Failed,
    /// The handler overran its budget.
    TimedOut,
}

impl LifecycleOutcome {
    /// Stable label used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleOutcome::Success => "success",
            LifecycleOutcome::Failed => "failed",
            LifecycleOutcome::TimedOut => "timed_out",
        }
    }
}

/// Emit the single outcome record for a lifecycle request.
pub fn log_lifecycle_event(
    context: &LogContext<'_>,
    outcome: LifecycleOutcome,
    duration: Duration,
    message: &str,
) {
    let duration_ms = duration.as_millis() as u64;
    match outcome {
        LifecycleOutcome::Success => tracing::info!(
            event = "lifecycle.completed",
            outcome = outcome.as_str(),
            request_id = context.request_id.unwrap_or(""),
            logical_id = context.logical_id.unwrap_or(""),
            resource_type = context.resource_type.unwrap_or(""),
            request_type = context.request_type.unwrap_or(""),
            duration_ms,
            message = %message
        ),
        LifecycleOutcome::Failed | LifecycleOutcome::TimedOut => tracing::error!(
            event = "lifecycle.completed",
            outcome = outcome.as_str(),
            request_id = context.request_id.unwrap_or(""),
            logical_id = context.logical_id.unwrap_or(""),
            resource_type = context.resource_type.unwrap_or(""),
            request_type = context.request_type.unwrap_or(""),
            duration_ms,
            message = %message
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use serde_json::Value;

    use super::*;

    /// Collects formatted output so tests can inspect emitted records.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("capture lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn records(&self) -> Vec<Value> {
            let bytes = self.0.lock().expect("capture lock").clone();
            String::from_utf8(bytes)
                .expect("utf-8 output")
                .lines()
                .map(|line| serde_json::from_str(line).expect("json record"))
                .collect()
        }
    }

    fn capture(emit: impl FnOnce()) -> Vec<Value> {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, emit);
        captured.records()
    }

    #[test]
    fn macros_stamp_correlation_fields() {
        let records = capture(|| {
            let ctx = LogContext::new()
                .with_request("req-1")
                .with_logical_id("WorkerGroup")
                .with_resource_type("ScalingGroup")
                .with_request_type("Create");
            crorch_info!(context = ctx.clone(), "handler started");
            crorch_warn!(context = ctx, "retrying after {}ms", 200);
            crorch_debug!("no context");
        });

        assert_eq!(records.len(), 3);
        let fields = &records[1]["fields"];
        assert_eq!(fields["message"], "retrying after 200ms");
        assert_eq!(fields["request_id"], "req-1");
        assert_eq!(fields["logical_id"], "WorkerGroup");
        assert_eq!(records[1]["level"], "WARN");
    }

    #[test]
    fn lifecycle_events_carry_outcome_and_duration() {
        let records = capture(|| {
            let ctx = LogContext::new().with_request("req-2").with_request_type("Delete");
            for outcome in [
                LifecycleOutcome::Success,
                LifecycleOutcome::Failed,
                LifecycleOutcome::TimedOut,
            ] {
                log_lifecycle_event(&ctx, outcome, Duration::from_millis(12), "done");
            }
        });

        let outcomes: Vec<_> = records
            .iter()
            .map(|record| record["fields"]["outcome"].as_str().unwrap_or_default().to_owned())
            .collect();
        assert_eq!(outcomes, vec!["success", "failed", "timed_out"]);
        assert_eq!(records[0]["level"], "INFO");
        assert_eq!(records[2]["level"], "ERROR");
        assert_eq!(records[0]["fields"]["duration_ms"], 12);
        assert_eq!(records[0]["fields"]["request_type"], "Delete");
        assert_eq!(records[0]["fields"]["event"], "lifecycle.completed");
    }

    #[test]
    fn outcome_labels_are_stable() {
        assert_eq!(LifecycleOutcome::TimedOut.as_str(), "timed_out");
        assert_eq!(LifecycleOutcome::Success.as_str(), "success");
    }
}
