#![forbid(unsafe_code)]

//! Shared models and pure logic for the must-gather orchestrator.

pub mod backoff;
pub mod error;
pub mod layout;
pub mod model;
pub mod paths;
pub mod time;
pub mod wire;

pub use backoff::*;
pub use error::*;
pub use model::*;
pub use time::*;
