//! `avagen-worker` -- runs one avatar generation job end to end.
//!
//! Reads a job (bare request object or `{"input": {...}}` envelope) from
//! the file named by the first argument, or from stdin when the argument
//! is absent or `-`. Starts ComfyUI if needed, renders, and prints the
//! JSON result to stdout. Logs go to stderr.
//!
//! Exit status is `0` when the job succeeded and `1` otherwise. See
//! [`WorkerConfig::from_env`] for the environment variables.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use avagen_comfyui::api::ComfyUIApi;
use avagen_comfyui::supervisor::ProcessSupervisor;
use avagen_core::clock::{Clock, SystemClock};
use avagen_pipeline::orchestrator::JobOrchestrator;
use avagen_pipeline::packaging::build_payload;
use avagen_pipeline::provision::{builtin_manifest, load_manifest, ModelProvisioner};
use avagen_pipeline::storage::OutputStore;
use avagen_pipeline::template;
use avagen_worker::config::{LogFormat, WorkerConfig};
use avagen_worker::input;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "avagen_worker=info,avagen_pipeline=info,avagen_comfyui=info";

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing(LogFormat::from_env());

    let config = WorkerConfig::from_env();
    match run(config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Worker failed before the job ran");
            println!(
                "{}",
                serde_json::json!({ "status": "failed", "stage": "idle", "error": format!("{e:#}") })
            );
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(format: LogFormat) {
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
    );
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

/// Run the job; `Ok(false)` means the job itself failed and its failure
/// payload has been printed.
async fn run(config: WorkerConfig) -> anyhow::Result<bool> {
    let source = std::env::args().nth(1);
    let text = read_job(source.as_deref()).await?;
    let request = input::parse_job(&text).context("invalid job input")?;

    tracing::info!(
        api_url = %config.api_url(),
        comfy_dir = %config.comfy_dir.display(),
        output_dir = %config.output_dir.display(),
        provision_models = config.provision_models,
        "Starting avagen-worker",
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let api = Arc::new(ComfyUIApi::new(config.api_url()));
    let supervisor = Arc::new(ProcessSupervisor::new(
        config.supervisor_config(),
        api.clone(),
        clock.clone(),
    ));
    let graph = template::load_or_builtin(Some(&config.workflow_template)).await;

    let mut orchestrator = JobOrchestrator::new(
        supervisor.clone(),
        api,
        graph,
        OutputStore::new(&config.output_dir),
        config.orchestrator_config(),
        clock.clone(),
    );
    if config.provision_models {
        let manifest = match &config.model_manifest {
            Some(path) => load_manifest(path)
                .await
                .with_context(|| format!("failed to load model manifest {}", path.display()))?,
            None => builtin_manifest(),
        };
        orchestrator =
            orchestrator.with_provisioner(ModelProvisioner::new(&config.comfy_dir, manifest, clock));
    }

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling job");
                cancel.cancel();
            }
        })
    };

    let outcome = orchestrator.run(&request, &cancel).await;
    interrupt.abort();

    let (payload, succeeded) = match &outcome {
        Ok(result) => (serde_json::to_string(&build_payload(result))?, true),
        Err(failure) => (serde_json::to_string(failure)?, false),
    };
    println!("{payload}");

    supervisor.stop().await;
    Ok(succeeded)
}

async fn read_job(source: Option<&str>) -> anyhow::Result<String> {
    match source {
        None | Some("-") => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .context("failed to read job from stdin")?;
            Ok(text)
        }
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read job file {path}")),
    }
}
