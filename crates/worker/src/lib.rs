//! `avagen-worker` library crate.
//!
//! Re-exports the configuration and input parsing used by the binary so
//! they can be tested on their own. The entrypoint lives in `main.rs`.

pub mod config;
pub mod input;
