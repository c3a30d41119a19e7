//! modflow: modular, versioned data pipelines over a sample catalog.
//!
//! A pipeline definition declares result types and their dependencies. For a
//! run, the requested endpoints are closed under their dependencies, samples
//! lacking origin data are filtered out, build rules and an engine config are
//! generated, and an external build engine does the work. A daemon keeps
//! several repositories up to date.

// Core modules
pub mod assembler;
pub mod catalog;
pub mod cli;
pub mod daemon;
pub mod definition;
pub mod eligibility;
pub mod engine;
pub mod error;
pub mod home;
pub mod instance;
pub mod repo;
pub mod resolver;
pub mod workflow;

// Re-export commonly used types
pub use catalog::{Catalog, SqliteCatalog};
pub use definition::{Level, PipelineDefinition, ResultSchema};
pub use engine::{BuildEngine, Snakemake};
pub use error::{
    AssemblyError, CatalogError, DaemonError, DefinitionError, EngineError, RepoError, RunError,
};
pub use home::ConfigHome;
pub use instance::{PipelineInstance, RunOutcome, RunRequest};
pub use repo::Repository;
