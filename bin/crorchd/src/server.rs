//! ---
//! crorch_section: "05-networking-external-interfaces"
//! crorch_subsection: "binary"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "HTTP listener accepting lifecycle events."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use crorch_orchestrator::{metrics, Dispatcher, SharedRegistry};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    registry: SharedRegistry,
    /// Accepted events still being processed.
    in_flight: Arc<Mutex<JoinSet<()>>>,
}

impl AppState {
    fn new(dispatcher: Arc<Dispatcher>, registry: SharedRegistry) -> Self {
        Self {
            dispatcher,
            registry,
            in_flight: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    fn accept(&self, event: Value) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let mut in_flight = self.in_flight.lock();
        // Reap finished events so the set only holds live ones.
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move {
            dispatcher.handle_event(&event).await;
        });
    }

    /// Wait for accepted events to report, giving up after `window`.
    async fn drain(&self, window: Duration) {
        let mut pending = std::mem::take(&mut *self.in_flight.lock());
        if pending.is_empty() {
            return;
        }
        info!(pending = pending.len(), "waiting for accepted events to finish");
        let drained = tokio::time::timeout(window, async {
            while pending.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                abandoned = pending.len(),
                window_secs = window.as_secs(),
                "accepted events still running at shutdown"
            );
        }
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/events", post(post_event))
        .route("/healthz", get(healthz))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

/// Serve until ctrl-c, then let accepted events report before returning.
pub async fn run(dispatcher: Arc<Dispatcher>, registry: SharedRegistry, addr: SocketAddr) -> Result<()> {
    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind event listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure event listener as non-blocking")?;
    let listener = TcpListener::from_std(listener).context("failed to create tokio listener")?;

    info!(address = %addr, budget_secs = dispatcher.budget().as_secs(), "event listener started");
    let drain_window = dispatcher.invocation_limit();
    let state = AppState::new(dispatcher, registry);
    let served = axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(async {
            if let Err(err) = signal::ctrl_c().await {
                error!(error = %err, "failed to listen for ctrl-c");
            }
            info!("ctrl-c received; shutting down");
        })
        .await
        .context("event listener exited with error");
    state.drain(drain_window).await;
    served
}

/// Accept the event and process it in the background; the result goes to
/// the event's callback target.
async fn post_event(State(state): State<AppState>, Json(event): Json<Value>) -> impl IntoResponse {
    let request_id = event
        .get("RequestId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    state.accept(event);
    (
        StatusCode::ACCEPTED,
        Json(json!({"accepted": true, "requestId": request_id})),
    )
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_metrics(State(state): State<AppState>) -> Response {
    match metrics::render(&state.registry) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(metrics::content_type()),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}
