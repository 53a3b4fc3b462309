//! Infrahub Ops Library
//!
//! Backup and restore orchestration for Infrahub deployments running on
//! Docker Compose or Kubernetes.

pub mod archive;
pub mod config;
pub mod credentials;
pub mod env;
pub mod executor;
pub mod neo4j;
pub mod runner;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use executor::InfrahubOps;
pub use utils::errors::OpsError;
pub type Result<T> = std::result::Result<T, OpsError>;
