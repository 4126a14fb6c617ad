//! Domain types and pure transformations for the avatar generation worker.
//!
//! Nothing in this crate talks to the network or spawns processes: it
//! validates job input, parameterizes job graphs, converts images and
//! provides the clock abstraction the async layers are driven by.

pub mod clock;
pub mod convert;
pub mod error;
pub mod graph;
pub mod hashing;
pub mod request;
pub mod types;
