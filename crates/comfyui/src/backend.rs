//! Trait seams between the pipeline and the rendering server.
//!
//! [`ComfyUIApi`](crate::api::ComfyUIApi) implements both traits; tests
//! substitute scripted implementations.

use async_trait::async_trait;
use avagen_core::graph::JobGraph;

use crate::api::AdapterError;
use crate::protocol::{ArtifactRef, PollResult, SubmissionHandle};

/// Job submission, status polling and artifact download.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    async fn submit(&self, graph: &JobGraph) -> Result<SubmissionHandle, AdapterError>;

    async fn poll(&self, handle: &SubmissionHandle) -> Result<PollResult, AdapterError>;

    async fn fetch_artifact(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, AdapterError>;
}

/// Liveness probe. Never fails: any error means "not healthy".
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn health_check(&self) -> bool;
}
