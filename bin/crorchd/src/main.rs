//! ---
//! crorch_section: "01-core-functionality"
//! crorch_subsection: "binary"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Binary entrypoint for the crorch daemon."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
use std::fs;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use crorch_common::{init_tracing, AppConfig, ProviderBackend};
use crorch_handlers::{HandlerSet, ResourceKind, ResourceProperties};
use crorch_orchestrator::{
    new_registry, Dispatcher, LifecycleRequest, OrchestratorMetrics, RequestType,
    ResponseReporter, STDOUT_TARGET,
};
use crorch_provider::{ProviderClient, SimulatedControlPlane};
use crorch_resilience::RetryPolicy;
use serde_json::Value;
use tracing::info;

mod server;

#[derive(Debug, Parser)]
#[command(author, version, about = "crorch custom resource orchestrator", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Process one lifecycle event and report its result")]
    Invoke {
        #[arg(long, value_name = "FILE|-", help = "Event JSON file, or - for stdin")]
        event: String,
        #[arg(long, help = "Print the result on stdout instead of calling ResponseURL")]
        stdout_callback: bool,
    },
    #[command(about = "Parse and validate an event without calling the provider")]
    Validate {
        #[arg(long, value_name = "FILE|-", help = "Event JSON file, or - for stdin")]
        event: String,
    },
    #[command(about = "Accept events over HTTP")]
    Serve {
        #[arg(long, value_name = "ADDR", help = "Listen address, overrides [server].listen")]
        listen: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(AppConfig::DEFAULT_PATH));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    init_tracing("crorchd", &config.logging)?;
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; using defaults"),
    }

    match cli.command {
        Commands::Invoke {
            event,
            stdout_callback,
        } => invoke(&config, &event, stdout_callback).await,
        Commands::Validate { event } => validate(&event),
        Commands::Serve { listen } => {
            let addr = listen.unwrap_or(config.server.listen);
            let registry = new_registry();
            let metrics = OrchestratorMetrics::new(&registry)?;
            let dispatcher = build_dispatcher(&config)?.with_metrics(metrics);
            server::run(Arc::new(dispatcher), registry, addr).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_dispatcher(config: &AppConfig) -> Result<Dispatcher> {
    let plane = match config.provider.backend {
        ProviderBackend::Simulated => Arc::new(SimulatedControlPlane::from_config(&config.provider)?),
    };
    info!(
        backend = ?config.provider.backend,
        region = %plane.region(),
        "provider control plane ready"
    );
    let client = ProviderClient::new(
        plane,
        RetryPolicy::from_config(&config.provider.retry, config.provider.seed),
    );
    let reporter = ResponseReporter::from_config(&config.reporter)?;
    Ok(Dispatcher::new(
        HandlerSet::new(),
        client,
        reporter,
        config.dispatcher.clone(),
    ))
}

fn read_event(source: &str) -> Result<Value> {
    let raw = if source == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read event from stdin")?;
        buffer
    } else {
        fs::read_to_string(source).with_context(|| format!("unable to read event file {source}"))?
    };
    serde_json::from_str(&raw).with_context(|| format!("event {source} is not valid JSON"))
}

async fn invoke(config: &AppConfig, source: &str, stdout_callback: bool) -> Result<ExitCode> {
    let mut event = read_event(source)?;
    if stdout_callback {
        if let Value::Object(envelope) = &mut event {
            envelope.insert("ResponseURL".into(), Value::String(STDOUT_TARGET.into()));
        }
    }
    let dispatcher = build_dispatcher(config)?;
    let result = dispatcher.handle_event(&event).await;
    if result.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("FAILED: {}", result.reason);
        Ok(ExitCode::FAILURE)
    }
}

fn validate(source: &str) -> Result<ExitCode> {
    let event = read_event(source)?;
    let request = LifecycleRequest::from_value(&event).map_err(|err| anyhow!(err))?;
    let kind: ResourceKind = request.resource_type.parse()?;
    if request.request_type != RequestType::Delete {
        ResourceProperties::parse(kind, &request.desired_properties)
            .with_context(|| format!("{kind} properties of {} are invalid", request.logical_id))?;
    }
    println!(
        "valid: {kind} {} for {}",
        request.request_type, request.logical_id
    );
    Ok(ExitCode::SUCCESS)
}
