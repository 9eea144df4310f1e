//! ---
//! crorch_section: "04-configuration-orchestration"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Lifecycle dispatcher: handler routing, budget enforcement and reporting."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! The dispatcher turns one [`LifecycleRequest`] into exactly one
//! [`LifecycleResult`] and hands it to the [`ResponseReporter`].
//!
//! Handlers run in their own task. When the budget elapses first the
//! dispatcher reports a timeout itself and detaches the task; whatever the
//! task produces afterwards is dropped.

use std::time::{Duration, Instant};

use crorch_common::DispatcherConfig;
use crorch_handlers::{
    HandlerCall, HandlerContext, HandlerError, HandlerSet, ResourceKind, ResourceProperties,
};
use crorch_logging::{
    crorch_debug, crorch_error, crorch_warn, log_lifecycle_event, LifecycleOutcome, LogContext,
};
use crorch_provider::ProviderClient;
use crorch_resilience::{Deadline, WaitConfig};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::metrics::OrchestratorMetrics;
use crate::reporter::ResponseReporter;
use crate::request::{redact_event, LifecycleRequest, MalformedEvent, RequestType};
use crate::result::{failed_physical_id, CallbackPayload, LifecycleResult, LifecycleStatus};

/// Resource and request type recorded for events too malformed to carry them.
const UNKNOWN_LABEL: &str = "unknown";

/// What the handler stage produced, before delete tolerance is applied.
struct Execution {
    result: LifecycleResult,
    outcome: LifecycleOutcome,
}

impl Execution {
    fn success(result: LifecycleResult) -> Self {
        Self {
            result,
            outcome: LifecycleOutcome::Success,
        }
    }

    fn failed(result: LifecycleResult) -> Self {
        Self {
            result,
            outcome: LifecycleOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    handlers: HandlerSet,
    client: ProviderClient,
    reporter: ResponseReporter,
    config: DispatcherConfig,
    wait: WaitConfig,
    metrics: Option<OrchestratorMetrics>,
}

impl Dispatcher {
    pub fn new(
        handlers: HandlerSet,
        client: ProviderClient,
        reporter: ResponseReporter,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            handlers,
            client,
            reporter,
            config,
            wait: WaitConfig::default(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: OrchestratorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Poll cadence handed to handlers that wait on provider state.
    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    /// Time a handler may run before a timeout is reported.
    pub fn budget(&self) -> Duration {
        self.config.handler_budget()
    }

    /// Upper bound on one event from acceptance to its reported result.
    pub fn invocation_limit(&self) -> Duration {
        self.config.invocation_limit
    }

    /// Parse, process and report a raw event. Malformed envelopes are still
    /// answered with FAILED when they name a callback target.
    pub async fn handle_event(&self, event: &Value) -> LifecycleResult {
        let started = Instant::now();
        info!(event = %redact_event(event), "lifecycle event received");
        match LifecycleRequest::from_value(event) {
            Ok(request) => self.handle(request).await,
            Err(malformed) => self.reject(malformed, started).await,
        }
    }

    pub async fn handle(&self, request: LifecycleRequest) -> LifecycleResult {
        self.handle_with_budget(request, self.budget()).await
    }

    /// Like [`Dispatcher::handle`] with an explicit handler budget, for hosts
    /// that know their remaining invocation time.
    pub async fn handle_with_budget(
        &self,
        request: LifecycleRequest,
        budget: Duration,
    ) -> LifecycleResult {
        let started = Instant::now();
        let execution = self.execute(&request, budget).await;
        let result = self.tolerate_delete_failure(&request, execution.result);
        let outcome = match execution.outcome {
            LifecycleOutcome::TimedOut => LifecycleOutcome::TimedOut,
            _ if result.is_success() => LifecycleOutcome::Success,
            _ => LifecycleOutcome::Failed,
        };

        let elapsed = started.elapsed();
        let log_context = LogContext::new()
            .with_request(&request.request_id)
            .with_logical_id(&request.logical_id)
            .with_resource_type(&request.resource_type)
            .with_request_type(request.request_type.as_str());
        let message = if result.is_success() {
            result.physical_id.as_str()
        } else {
            result.reason.as_str()
        };
        log_lifecycle_event(&log_context, outcome, elapsed, message);
        if let Some(metrics) = &self.metrics {
            metrics.record_request(
                &request.resource_type,
                request.request_type.as_str(),
                result.status,
                elapsed,
            );
            if outcome == LifecycleOutcome::TimedOut {
                metrics.record_timeout();
            }
        }

        let payload = CallbackPayload::new(&request, &result);
        let delivery = self
            .reporter
            .deliver(&request.callback_target, &payload)
            .await;
        if let Some(metrics) = &self.metrics {
            metrics.record_delivery(&delivery);
        }
        result
    }

    async fn reject(&self, malformed: MalformedEvent, started: Instant) -> LifecycleResult {
        let payload = CallbackPayload::for_malformed(&malformed);
        error!(
            request_id = %payload.request_id,
            logical_id = %payload.logical_resource_id,
            error = %malformed,
            "rejected lifecycle event"
        );
        let result = LifecycleResult::failed(payload.physical_resource_id.clone(), payload.reason.clone());

        let log_context = LogContext::new()
            .with_request(&payload.request_id)
            .with_logical_id(&payload.logical_resource_id)
            .with_resource_type(UNKNOWN_LABEL)
            .with_request_type(UNKNOWN_LABEL);
        let elapsed = started.elapsed();
        log_lifecycle_event(&log_context, LifecycleOutcome::Failed, elapsed, &result.reason);
        if let Some(metrics) = &self.metrics {
            metrics.record_request(UNKNOWN_LABEL, UNKNOWN_LABEL, result.status, elapsed);
        }
        match &malformed.callback_target {
            Some(target) => {
                let delivery = self.reporter.deliver(target, &payload).await;
                if let Some(metrics) = &self.metrics {
                    metrics.record_delivery(&delivery);
                }
            }
            None => error!("malformed event carries no callback target; caller is not notified"),
        }
        result
    }

    async fn execute(&self, request: &LifecycleRequest, budget: Duration) -> Execution {
        let fallback_id = request
            .physical_id
            .clone()
            .unwrap_or_else(|| failed_physical_id(&request.logical_id, &request.request_id));

        let kind = match request.resource_type.parse::<ResourceKind>() {
            Ok(kind) => kind,
            Err(err) => return Execution::failed(LifecycleResult::failed(fallback_id, err.to_string())),
        };
        let failure_reason =
            |err: &dyn std::fmt::Display| format!("{kind} {} failed: {err}", request.request_type);

        let call = match build_call(kind, request) {
            Ok(Some(call)) => call,
            Ok(None) => {
                // A Delete for a resource whose Create never produced an id.
                return Execution::success(LifecycleResult::success(fallback_id, Default::default()));
            }
            Err(err) => {
                return Execution::failed(LifecycleResult::failed(fallback_id, failure_reason(&err)))
            }
        };

        let mut ctx = HandlerContext::new(
            self.client.scoped(Deadline::after(budget)),
            kind,
            request.request_type.as_str(),
            &request.request_id,
            &request.logical_id,
            &request.stack_context,
        )
        .with_wait(self.wait);
        if let Some(physical_id) = &request.physical_id {
            ctx.store.set_physical_id(physical_id.clone());
        }
        // A create that may have left resources behind reports the id they
        // live under, so the caller's cleanup delete can reach them.
        let leftover_id = self
            .handlers
            .planned_physical_id(&ctx, &call)
            .unwrap_or_else(|| fallback_id.clone());

        let handlers = self.handlers.clone();
        let task = tokio::spawn(async move {
            let outcome = handlers.run(&mut ctx, &call).await;
            (outcome, ctx)
        });

        match tokio::time::timeout(budget, task).await {
            Err(_) => {
                // Dropping the join handle detaches the task; its late result is discarded.
                let reason = format!("handler timeout after {}s", budget.as_secs_f64());
                crorch_error!(
                    context = request_log_context(request),
                    "{reason}; in-flight provider calls are left to finish"
                );
                Execution {
                    result: LifecycleResult::failed(leftover_id, reason),
                    outcome: LifecycleOutcome::TimedOut,
                }
            }
            Ok(Err(join_err)) => {
                let reason = if join_err.is_panic() {
                    failure_reason(&"handler panicked")
                } else {
                    failure_reason(&join_err)
                };
                Execution::failed(LifecycleResult::failed(leftover_id, reason))
            }
            Ok(Ok((Ok(provisioned), ctx))) => {
                crorch_debug!(
                    context = ctx.log_context(),
                    "sub-resources created: [{}]",
                    ctx.store.created_labels().join(", ")
                );
                Execution::success(LifecycleResult::success(
                    provisioned.physical_id,
                    provisioned.data,
                ))
            }
            Ok(Ok((Err(err), ctx))) => {
                let created = ctx.store.created_labels();
                let physical_id = if created.is_empty() {
                    fallback_id
                } else {
                    crorch_warn!(
                        context = ctx.log_context(),
                        "failed after creating [{}]",
                        created.join(", ")
                    );
                    leftover_id
                };
                Execution::failed(LifecycleResult::failed(physical_id, failure_reason(&err)))
            }
        }
    }

    fn tolerate_delete_failure(
        &self,
        request: &LifecycleRequest,
        result: LifecycleResult,
    ) -> LifecycleResult {
        if request.request_type != RequestType::Delete
            || result.status != LifecycleStatus::Failed
            || !self.config.tolerate_delete_failures
        {
            return result;
        }
        crorch_warn!(
            context = request_log_context(request),
            "reporting failed delete as success: {}",
            result.reason
        );
        let mut data = serde_json::Map::new();
        data.insert("deleteStatus".into(), json!("DeleteFailed"));
        data.insert("error".into(), json!(result.reason));
        LifecycleResult::success(result.physical_id, data)
    }
}

fn request_log_context(request: &LifecycleRequest) -> LogContext<'_> {
    LogContext::new()
        .with_request(&request.request_id)
        .with_logical_id(&request.logical_id)
        .with_resource_type(&request.resource_type)
        .with_request_type(request.request_type.as_str())
}

/// Validate the request into a handler call. `None` means there is nothing
/// to do.
fn build_call(
    kind: ResourceKind,
    request: &LifecycleRequest,
) -> Result<Option<HandlerCall>, HandlerError> {
    match request.request_type {
        RequestType::Create => {
            let properties = ResourceProperties::parse(kind, &request.desired_properties)?;
            Ok(Some(HandlerCall::Create(properties)))
        }
        RequestType::Update => {
            let physical_id = request
                .physical_id
                .clone()
                .ok_or_else(|| HandlerError::validation("Update requires a physical id"))?;
            let properties = ResourceProperties::parse(kind, &request.desired_properties)?;
            Ok(Some(HandlerCall::Update {
                physical_id,
                properties,
            }))
        }
        // Properties only refine a delete; an unparsable set never blocks it.
        RequestType::Delete => Ok(request.physical_id.clone().map(|physical_id| {
            HandlerCall::Delete {
                kind,
                physical_id,
                properties: ResourceProperties::parse(kind, &request.desired_properties).ok(),
            }
        })),
    }
}
