//! avalanche: orchestrates a batch data pipeline over external collaborators.
//!
//! The stages provision a namespace tree on the storage service, wait for the
//! streaming agent, bulk-import filtered relational tables, aggregate raw
//! records by key, and verify every artifact and service.
//!
//! # Example
//!
//! ```ignore
//! use avalanche::error::ConfigSnafu;
//! use avalanche::{Config, Orchestrator, RunPolicy};
//! use snafu::ResultExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), avalanche::error::PipelineError> {
//!     let config = Config::from_file("avalanche.yaml").context(ConfigSnafu)?;
//!     let run = Orchestrator::from_config(config)?
//!         .run(RunPolicy::HaltOnFirstFailure)
//!         .await;
//!     for outcome in run.outcomes() {
//!         println!("{outcome}");
//!     }
//!     run.into_result().map(|_| ())
//! }
//! ```

pub mod aggregate;
pub mod command;
pub mod config;
pub mod error;
pub mod generator;
pub mod import;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod provision;
pub mod readiness;
pub mod signal;
pub mod storage;
pub mod verify;

// Re-export main types
pub use config::Config;
pub use pipeline::{Orchestrator, PipelineRun, RunPolicy, Stage, Status};
pub use storage::{StorageProvider, StorageRef};
pub use verify::{Report, VerificationReporter};
