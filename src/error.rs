//! Error types for modflow operations.
//!
//! Defines error types for the major subsystems:
//! - Pipeline definition loading and validation
//! - Catalog lookups and registration
//! - Configuration assembly
//! - Build engine invocation
//! - Repository bookkeeping
//! - Pipeline runs
//! - The scheduling daemon

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating a pipeline definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse pipeline definition '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Missing required field '{0}'")]
    MissingField(String),

    #[error("Invalid level '{level}' for result type '{schema}': must be SAMPLE or GROUP")]
    InvalidLevel { schema: String, level: String },

    #[error("Result type '{0}' is declared more than once")]
    DuplicateSchema(String),

    #[error("Result type '{schema}' has no files")]
    NoFiles { schema: String },

    #[error("Result type '{schema}' uses the reserved file role 'flag'")]
    ReservedRole { schema: String },

    #[error("Pipeline '{0}' is not installed")]
    NotInstalled(String),

    #[error("Pipeline '{name}' has no installed version '{version}'")]
    VersionNotInstalled { name: String, version: String },

    #[error("'{first}' and '{second}' both map to the rule identifier '{identifier}'")]
    IdentifierCollision {
        first: String,
        second: String,
        identifier: String,
    },

    #[error("Invalid pipeline definition: {0}")]
    Invalid(String),
}

/// Errors that can occur while talking to the catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{kind} '{name}' not found in catalog")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists with different contents: {detail}")]
    Conflict {
        kind: &'static str,
        name: String,
        detail: String,
    },

    #[error("Unknown file type '{0}'")]
    UnknownFileType(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while assembling the engine configuration.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("Failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Config '{path}' must be a mapping at the top level")]
    NotAMapping { path: PathBuf },

    #[error("Unsupported config value at '{key}': {kind} leaves cannot be resolved")]
    UnsupportedLeaf { key: String, kind: &'static str },

    #[error("Substitution task failed: {0}")]
    Task(String),
}

/// Errors that can occur while invoking the build engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to start build engine '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Build engine exited with code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by repository bookkeeping.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("No modflow repository found at or above '{0}'")]
    NotFound(PathBuf),

    #[error("A modflow repository already exists at '{0}'")]
    AlreadyExists(PathBuf),

    #[error("Pipeline '{0}' is already attached to this repository")]
    AlreadyAttached(String),

    #[error("Pipeline '{0}' is not attached to this repository")]
    NotAttached(String),

    #[error("Pipeline '{name}' is attached at version '{found}', expected '{expected}'")]
    VersionMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that can occur during a single pipeline run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Assembly error: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Repository error: {0}")]
    Repo(#[from] RepoError),

    #[error("Rule file for module '{module}' not found at '{path}'")]
    MissingModuleRules { module: String, path: PathBuf },

    #[error("No extension known for file type '{0}'")]
    UnknownFileType(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the scheduling daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Failed to read daemon config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse daemon config '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid daemon config: {0}")]
    Invalid(String),

    #[error("Repository error: {0}")]
    Repo(#[from] RepoError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),
}
