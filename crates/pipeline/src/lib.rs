//! Job orchestration: from a caller's request to delivered images.
//!
//! [`orchestrator::JobOrchestrator`] drives one job through server
//! readiness, graph building, submission, polling, artifact download and
//! conversion, wrapping any failure with the stage it happened in.

pub mod error;
pub mod events;
pub mod orchestrator;
pub mod packaging;
pub mod poller;
pub mod provision;
pub mod storage;
pub mod template;
