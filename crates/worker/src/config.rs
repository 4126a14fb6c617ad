//! Worker settings read from the environment.
//!
//! Everything except the log format lives in [`WorkerConfig`]; the log
//! format is read on its own by [`LogFormat::from_env`] because tracing
//! has to be set up before the rest of the configuration can log.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use avagen_comfyui::supervisor::{LaunchSpec, SupervisorConfig};
use avagen_pipeline::orchestrator::OrchestratorConfig;
use avagen_pipeline::poller::PollConfig;

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// Read `LOG_FORMAT` (`text` or `json`, default `text`).
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .ok()
            .and_then(|v| Self::parse(&v))
            .unwrap_or(Self::Text)
    }

    /// `None` for anything but `text` or `json`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Worker configuration loaded from environment variables.
///
/// Every field has a default matching the container layout; invalid
/// values are logged and replaced by the default so the worker still
/// starts.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub comfy_dir: PathBuf,
    pub comfy_python: String,
    /// Host the HTTP client talks to.
    pub comfy_host: String,
    pub comfy_port: u16,
    /// Address the server binds to.
    pub comfy_listen: String,
    pub startup_timeout: Duration,
    pub health_interval: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub poll_max_transient_errors: u32,
    pub output_dir: PathBuf,
    pub workflow_template: PathBuf,
    pub provision_models: bool,
    /// `None` uses the built-in manifest.
    pub model_manifest: Option<PathBuf>,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                                            |
    /// |-----------------------------|----------------------------------------------------|
    /// | `COMFY_DIR`                 | `/workspace/ComfyUI`                               |
    /// | `COMFY_PYTHON`              | `python3`                                          |
    /// | `COMFY_HOST`                | `127.0.0.1`                                        |
    /// | `COMFY_PORT`                | `8188`                                             |
    /// | `COMFY_LISTEN`              | `0.0.0.0`                                          |
    /// | `STARTUP_TIMEOUT_SECS`      | `60`                                               |
    /// | `HEALTH_INTERVAL_MS`        | `1000`                                             |
    /// | `POLL_INTERVAL_MS`          | `2000`                                             |
    /// | `POLL_TIMEOUT_SECS`         | `300`                                              |
    /// | `POLL_MAX_TRANSIENT_ERRORS` | `3`                                                |
    /// | `OUTPUT_DIR`                | `/workspace/outputs`                               |
    /// | `WORKFLOW_TEMPLATE`         | `$COMFY_DIR/user/default/workflows/avatar_ai.json` |
    /// | `PROVISION_MODELS`          | `true`                                             |
    /// | `MODEL_MANIFEST`            | unset (built-in manifest)                          |
    ///
    /// `LOG_FORMAT` is read separately by [`LogFormat::from_env`].
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let comfy_dir = var("COMFY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/workspace/ComfyUI"));
        let workflow_template = var("WORKFLOW_TEMPLATE")
            .map(PathBuf::from)
            .unwrap_or_else(|| comfy_dir.join("user/default/workflows/avatar_ai.json"));

        Self {
            comfy_python: var("COMFY_PYTHON").unwrap_or_else(|| "python3".into()),
            comfy_host: var("COMFY_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            comfy_port: parse_or(&var, "COMFY_PORT", 8188),
            comfy_listen: var("COMFY_LISTEN").unwrap_or_else(|| "0.0.0.0".into()),
            startup_timeout: Duration::from_secs(parse_or(&var, "STARTUP_TIMEOUT_SECS", 60)),
            health_interval: Duration::from_millis(parse_or(&var, "HEALTH_INTERVAL_MS", 1000)),
            poll_interval: Duration::from_millis(parse_or(&var, "POLL_INTERVAL_MS", 2000)),
            poll_timeout: Duration::from_secs(parse_or(&var, "POLL_TIMEOUT_SECS", 300)),
            poll_max_transient_errors: parse_or(&var, "POLL_MAX_TRANSIENT_ERRORS", 3),
            output_dir: var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/workspace/outputs")),
            provision_models: parse_flag(&var, "PROVISION_MODELS", true),
            model_manifest: var("MODEL_MANIFEST").map(PathBuf::from),
            comfy_dir,
            workflow_template,
        }
    }

    /// Base URL of the server's HTTP API.
    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.comfy_host, self.comfy_port)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let launch = LaunchSpec::comfyui(
            &self.comfy_python,
            &self.comfy_dir,
            &self.comfy_listen,
            self.comfy_port,
        );
        SupervisorConfig {
            health_interval: self.health_interval,
            ..SupervisorConfig::new(launch)
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            startup_timeout: self.startup_timeout,
            poll: PollConfig {
                interval: self.poll_interval,
                timeout: self.poll_timeout,
                max_transient_errors: self.poll_max_transient_errors,
            },
            ..Default::default()
        }
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match var(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, %default, "Invalid number, using default");
            default
        }),
    }
}

fn parse_flag(var: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match var(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        None => default,
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        Some(other) => {
            tracing::warn!(key, value = other, default, "Invalid flag, using default");
            default
        }
    }
}
