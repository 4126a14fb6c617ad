//! Job stages and the stage-tagged failure returned to callers.

use avagen_comfyui::api::AdapterError;
use avagen_comfyui::supervisor::SupervisorError;
use avagen_core::error::{BuildError, ConvertError};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::storage::StorageError;

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    ServerEnsuring,
    GraphBuilding,
    Submitting,
    Polling,
    Fetching,
    Converting,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ServerEnsuring => "server_ensuring",
            Self::GraphBuilding => "graph_building",
            Self::Submitting => "submitting",
            Self::Polling => "polling",
            Self::Fetching => "fetching",
            Self::Converting => "converting",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any error that can abort a job.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    /// The rendering server reported the job as failed.
    #[error("Rendering failed: {0}")]
    Render(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A blocking conversion task panicked or was aborted.
    #[error("Conversion task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Job cancelled")]
    Cancelled,
}

/// A failed job: the stage it stopped in and why.
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {error}")]
pub struct JobFailure {
    pub stage: Stage,
    #[source]
    pub error: PipelineError,
}

impl JobFailure {
    pub fn new(stage: Stage, error: PipelineError) -> Self {
        Self { stage, error }
    }

    /// Server output captured while the failure happened, if any.
    pub fn server_output(&self) -> Option<&str> {
        match &self.error {
            PipelineError::Supervisor(e) => e.tail().filter(|t| !t.is_empty()),
            _ => None,
        }
    }
}

/// `{"status": "failed", "stage": "...", "error": "...", "server_output"?: "..."}`
impl Serialize for JobFailure {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let server_output = self.server_output();
        let mut map = serializer.serialize_map(Some(3 + usize::from(server_output.is_some())))?;
        map.serialize_entry("status", "failed")?;
        map.serialize_entry("stage", &self.stage)?;
        map.serialize_entry("error", &self.error.to_string())?;
        if let Some(output) = server_output {
            map.serialize_entry("server_output", output)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn display_names_the_stage() {
        let failure = JobFailure::new(Stage::Polling, PipelineError::Render("CUDA out of memory".into()));
        assert_eq!(failure.to_string(), "polling failed: Rendering failed: CUDA out of memory");
    }

    #[test]
    fn serializes_as_failed_payload() {
        let failure = JobFailure::new(Stage::Submitting, PipelineError::Cancelled);
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "status": "failed", "stage": "submitting", "error": "Job cancelled" })
        );
    }

    #[test]
    fn supervisor_failures_carry_server_output() {
        let failure = JobFailure::new(
            Stage::ServerEnsuring,
            PipelineError::Supervisor(SupervisorError::Timeout {
                elapsed: Duration::from_secs(60),
                tail: "Loading checkpoint".into(),
            }),
        );
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["stage"], "server_ensuring");
        assert_eq!(json["server_output"], "Loading checkpoint");
    }

    #[test]
    fn stage_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(Stage::ServerEnsuring).unwrap(),
            serde_json::json!("server_ensuring")
        );
        assert_eq!(Stage::GraphBuilding.to_string(), "graph_building");
    }
}
