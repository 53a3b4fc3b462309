//! Utility modules shared by the orchestration code.

pub mod errors;
pub mod format;
pub mod logger;
pub mod signal;

pub use errors::{OpsError, Result, StepContext};
