//! The per-job state machine.
//!
//! ```text
//! Idle -> ServerEnsuring -> GraphBuilding -> Submitting -> Polling
//!      -> Fetching -> Converting -> Done
//! ```
//!
//! Any error stops the job in its current stage and is returned as a
//! [`JobFailure`]. Results are all-or-nothing: if one artifact fails to
//! fetch, convert or persist, nothing from the job is returned and files
//! already written for it are removed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use avagen_comfyui::backend::RenderBackend;
use avagen_comfyui::protocol::{ArtifactRef, SubmissionHandle};
use avagen_comfyui::retry::{retry_transient, RetryPolicy};
use avagen_comfyui::supervisor::{ProcessSupervisor, SupervisorError};
use avagen_core::clock::Clock;
use avagen_core::convert::{self, ConvertedImage};
use avagen_core::graph::{self, JobGraph};
use avagen_core::request::{JobRequest, JobSettings};
use tokio::sync::{broadcast, OnceCell};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{JobFailure, PipelineError, Stage};
use crate::events::{JobEvent, EVENT_CHANNEL_CAPACITY};
use crate::poller::{self, PollConfig};
use crate::provision::ModelProvisioner;
use crate::storage::OutputStore;

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum wait for the server to become ready.
    pub startup_timeout: Duration,
    pub poll: PollConfig,
    /// Retry policy for artifact downloads.
    pub fetch_retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            poll: PollConfig::default(),
            fetch_retry: RetryPolicy::default(),
        }
    }
}

/// One converted output, in server-reported order.
#[derive(Debug, Clone)]
pub struct DeliveredImage {
    pub artifact: ArtifactRef,
    /// `<artifact stem>.<ext>`.
    pub filename: String,
    pub image: ConvertedImage,
}

/// Everything a successful job produced.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: Uuid,
    pub submission: SubmissionHandle,
    pub settings: JobSettings,
    pub images: Vec<DeliveredImage>,
}

impl JobResult {
    pub fn saved_paths(&self) -> Vec<PathBuf> {
        self.images
            .iter()
            .filter_map(|i| i.image.saved_path.clone())
            .collect()
    }
}

/// Runs jobs against one supervised rendering server.
pub struct JobOrchestrator {
    supervisor: Arc<ProcessSupervisor>,
    backend: Arc<dyn RenderBackend>,
    template: JobGraph,
    store: OutputStore,
    provisioner: Option<ModelProvisioner>,
    provisioned: OnceCell<()>,
    config: OrchestratorConfig,
    clock: Arc<dyn Clock>,
    event_tx: broadcast::Sender<JobEvent>,
}

impl JobOrchestrator {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        backend: Arc<dyn RenderBackend>,
        template: JobGraph,
        store: OutputStore,
        config: OrchestratorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            supervisor,
            backend,
            template,
            store,
            provisioner: None,
            provisioned: OnceCell::new(),
            config,
            clock,
            event_tx,
        }
    }

    /// Provision models once, before the first job needs the server.
    pub fn with_provisioner(mut self, provisioner: ModelProvisioner) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Subscribe to job events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Run one job to completion.
    pub async fn run(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<JobResult, JobFailure> {
        let mut job = JobRun {
            id: Uuid::now_v7(),
            stage: Stage::Idle,
            events: &self.event_tx,
        };
        let started = self.clock.now();
        tracing::info!(job_id = %job.id, "Job started");

        match self.execute(&mut job, request, cancel).await {
            Ok(result) => {
                job.enter(Stage::Done);
                tracing::info!(
                    job_id = %job.id,
                    prompt_id = %result.submission.id,
                    images = result.images.len(),
                    elapsed_ms = self.clock.since(started).as_millis() as u64,
                    "Job completed",
                );
                job.emit(JobEvent::Completed {
                    job_id: job.id,
                    prompt_id: result.submission.id.clone(),
                    images: result.images.len(),
                });
                Ok(result)
            }
            Err(error) => {
                let failure = JobFailure::new(job.stage, error);
                tracing::error!(job_id = %job.id, stage = %failure.stage, error = %failure.error, "Job failed");
                job.emit(JobEvent::Failed {
                    job_id: job.id,
                    stage: failure.stage,
                    error: failure.error.to_string(),
                });
                Err(failure)
            }
        }
    }

    async fn execute(
        &self,
        job: &mut JobRun<'_>,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<JobResult, PipelineError> {
        job.enter(Stage::ServerEnsuring);
        cancellable(cancel, self.ensure_server()).await??;

        job.enter(Stage::GraphBuilding);
        let settings = request.resolve()?;
        let graph = graph::apply_settings(&self.template, &settings)?;
        tracing::debug!(
            job_id = %job.id,
            steps = settings.steps,
            seed = settings.seed,
            width = settings.width,
            height = settings.height,
            format = %settings.output_format,
            "Job graph built",
        );

        job.enter(Stage::Submitting);
        let submitted_at = self.clock.now();
        let submission = cancellable(cancel, self.backend.submit(&graph)).await??;

        job.enter(Stage::Polling);
        let artifacts = poller::wait_for_completion(
            self.backend.as_ref(),
            &submission,
            &self.config.poll,
            self.clock.as_ref(),
            submitted_at,
            cancel,
            |info| {
                job.emit(JobEvent::Progress {
                    job_id: job.id,
                    prompt_id: submission.id.clone(),
                    status: info.status.clone(),
                    messages: info.messages,
                })
            },
        )
        .await?;

        job.enter(Stage::Fetching);
        let mut raw = Vec::with_capacity(artifacts.len());
        for artifact in &artifacts {
            let fetch = retry_transient(
                &self.config.fetch_retry,
                self.clock.as_ref(),
                "Artifact fetch",
                || self.backend.fetch_artifact(artifact),
            );
            raw.push(cancellable(cancel, fetch).await??);
        }

        job.enter(Stage::Converting);
        let images = self
            .convert_all(&submission, &settings, artifacts, raw, cancel)
            .await?;

        Ok(JobResult {
            job_id: job.id,
            submission,
            settings,
            images,
        })
    }

    /// Provision models (first job only) and wait for the server.
    async fn ensure_server(&self) -> Result<(), PipelineError> {
        if let Some(provisioner) = &self.provisioner {
            self.provisioned
                .get_or_try_init(|| async {
                    provisioner
                        .provision_all()
                        .await
                        .map(|report| {
                            tracing::info!(
                                downloaded = report.downloaded.len(),
                                present = report.present.len(),
                                "Models provisioned",
                            );
                        })
                        .map_err(|e| SupervisorError::Provisioning(e.to_string()))
                })
                .await?;
        }
        self.supervisor
            .ensure_ready(self.config.startup_timeout)
            .await?;
        Ok(())
    }

    /// Convert every artifact, then persist them if requested.
    async fn convert_all(
        &self,
        submission: &SubmissionHandle,
        settings: &JobSettings,
        artifacts: Vec<ArtifactRef>,
        raw: Vec<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeliveredImage>, PipelineError> {
        let format = settings.output_format;
        let quality = settings.output_quality;

        let mut images = Vec::with_capacity(artifacts.len());
        for (artifact, bytes) in artifacts.into_iter().zip(raw) {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let image =
                tokio::task::spawn_blocking(move || convert::convert(&bytes, format, quality))
                    .await??;
            let filename = format!("{}.{}", artifact.stem(), format.extension());
            images.push(DeliveredImage {
                artifact,
                filename,
                image,
            });
        }

        if settings.save_to_disk {
            let mut written: Vec<PathBuf> = Vec::with_capacity(images.len());
            for delivered in &mut images {
                let saved = self
                    .store
                    .save(&submission.id, &delivered.filename, &delivered.image.bytes)
                    .await;
                match saved {
                    Ok(path) => {
                        written.push(path.clone());
                        delivered.image.saved_path = Some(path);
                    }
                    Err(e) => {
                        self.store.discard(&written).await;
                        return Err(e.into());
                    }
                }
            }
        }

        Ok(images)
    }
}

/// Per-job bookkeeping: current stage and event emission.
struct JobRun<'a> {
    id: Uuid,
    stage: Stage,
    events: &'a broadcast::Sender<JobEvent>,
}

impl JobRun<'_> {
    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        tracing::debug!(job_id = %self.id, %stage, "Job stage changed");
        self.emit(JobEvent::StageChanged {
            job_id: self.id,
            stage,
        });
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

/// Race `fut` against cancellation.
async fn cancellable<F: std::future::Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, PipelineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        output = fut => Ok(output),
    }
}
