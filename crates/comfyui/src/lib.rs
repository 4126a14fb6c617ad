//! ComfyUI HTTP client and process supervision.
//!
//! Provides the REST adapter for job submission, history polling and
//! artifact download, the typed view of the server's history responses,
//! and a supervisor that owns the lifecycle of a local ComfyUI process.

pub mod api;
pub mod backend;
pub mod output;
pub mod protocol;
pub mod retry;
pub mod supervisor;
