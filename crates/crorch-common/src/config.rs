//! ---
//! crorch_section: "04-configuration-orchestration"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "TOML configuration model for the orchestrator daemon."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_invocation_limit() -> Duration {
    Duration::from_secs(900)
}

fn default_safety_margin() -> Duration {
    Duration::from_secs(30)
}

fn default_region() -> String {
    "us-east-1".to_owned()
}

fn default_provider_attempts() -> usize {
    5
}

fn default_provider_base_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_provider_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_provider_jitter() -> Duration {
    Duration::from_millis(100)
}

fn default_reporter_attempts() -> usize {
    3
}

fn default_reporter_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_reporter_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8088))
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub reporter: ReporterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
///
/// `source` is `None` when no candidate existed and defaults were used.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "CRORCH_CONFIG";
    pub const DEFAULT_PATH: &'static str = "configs/crorch.toml";

    /// Load configuration from disk, respecting the `CRORCH_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// An explicit `CRORCH_CONFIG` path must exist; candidate paths are optional.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.dispatcher.validate()?;
        self.provider.retry.validate("provider.retry")?;
        if self.reporter.max_attempts == 0 {
            return Err(anyhow!("reporter.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Hard wall-clock limit the host places on one invocation.
    #[serde(default = "default_invocation_limit")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub invocation_limit: Duration,
    /// Time reserved for reporting after the handler budget expires.
    #[serde(default = "default_safety_margin")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub safety_margin: Duration,
    #[serde(default)]
    pub tolerate_delete_failures: bool,
}

impl DispatcherConfig {
    /// Time a handler may run before the dispatcher reports a timeout.
    pub fn handler_budget(&self) -> Duration {
        self.invocation_limit.saturating_sub(self.safety_margin)
    }

    pub fn validate(&self) -> Result<()> {
        if self.safety_margin >= self.invocation_limit {
            return Err(anyhow!(
                "dispatcher.safety_margin ({}s) must be smaller than dispatcher.invocation_limit ({}s)",
                self.safety_margin.as_secs(),
                self.invocation_limit.as_secs()
            ));
        }
        Ok(())
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            invocation_limit: default_invocation_limit(),
            safety_margin: default_safety_margin(),
            tolerate_delete_failures: false,
        }
    }
}

/// Control-plane implementation backing the provider client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderBackend {
    #[default]
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub backend: ProviderBackend,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Simulated backend only: JSON file holding control-plane state across runs.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    /// Seed for retry jitter; entropy is used when unset.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            backend: ProviderBackend::default(),
            region: default_region(),
            retry: RetryConfig::default(),
            state_file: None,
            seed: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_provider_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_provider_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde(default = "default_provider_max_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    #[serde(default = "default_provider_jitter")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter: Duration,
}

impl RetryConfig {
    fn validate(&self, section: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("{section}.max_attempts must be at least 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(anyhow!(
                "{section}.base_delay must not exceed {section}.max_delay"
            ));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_provider_attempts(),
            base_delay: default_provider_base_delay(),
            max_delay: default_provider_max_delay(),
            jitter: default_provider_jitter(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterConfig {
    #[serde(default = "default_reporter_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_reporter_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde(default = "default_reporter_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_reporter_attempts(),
            base_delay: default_reporter_base_delay(),
            request_timeout: default_reporter_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}
