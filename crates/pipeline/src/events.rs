//! Job lifecycle events broadcast by the orchestrator.
//!
//! Subscribers get a [`tokio::sync::broadcast::Receiver`] from
//! [`JobOrchestrator::subscribe`](crate::orchestrator::JobOrchestrator::subscribe).
//! Events are best-effort: with no subscribers they are dropped.

use serde::Serialize;
use uuid::Uuid;

use crate::error::Stage;

/// Capacity of the job event channel. Slow receivers see `Lagged`.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A job-level event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// The job entered a new stage.
    StageChanged { job_id: Uuid, stage: Stage },

    /// The rendering server reported the job as still running.
    Progress {
        job_id: Uuid,
        prompt_id: String,
        /// Server-side status string, e.g. `"running"`.
        status: String,
        /// Execution messages recorded so far.
        messages: usize,
    },

    /// The job finished and produced `images` outputs.
    Completed {
        job_id: Uuid,
        prompt_id: String,
        images: usize,
    },

    /// The job failed in `stage`.
    Failed {
        job_id: Uuid,
        stage: Stage,
        error: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::StageChanged { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. } => *job_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag() {
        let job_id = Uuid::nil();
        let event = JobEvent::StageChanged {
            job_id,
            stage: Stage::Polling,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "stage_changed");
        assert_eq!(json["stage"], "polling");
        assert_eq!(event.job_id(), job_id);
    }
}
