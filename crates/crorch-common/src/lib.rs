//! ---
//! crorch_section: "01-core-functionality"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Shared configuration and tracing bootstrap."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! Shared primitives for the crorch workspace.
//! This crate exposes configuration loading and the tracing bootstrap consumed
//! by the daemon and the integration suites.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, DispatcherConfig, LoadedAppConfig, LoggingConfig, ProviderBackend, ProviderConfig,
    ReporterConfig, RetryConfig, ServerConfig,
};
pub use logging::{init_tracing, LogFormat};
