//! Build engine integration.
//!
//! The build engine executes the generated rule file. A dry run reports the
//! jobs still outstanding, which is how the daemon measures unfinished work.

mod plan;
mod snakemake;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::EngineError;

pub use plan::{parse_run_plan, RunPlan};
pub use snakemake::Snakemake;

/// One call of the build engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Directory the engine process is started in.
    pub workdir: PathBuf,
    /// Directory targets are built in.
    pub result_dir: PathBuf,
    pub snakefile: PathBuf,
    pub configfile: PathBuf,
    pub dryrun: bool,
    pub unlock: bool,
    /// Concurrent job budget.
    pub jobs: usize,
    /// Cluster submission command; `None` runs locally.
    pub cluster: Option<String>,
}

impl Invocation {
    pub fn new(
        workdir: impl Into<PathBuf>,
        result_dir: impl Into<PathBuf>,
        snakefile: impl Into<PathBuf>,
        configfile: impl Into<PathBuf>,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            result_dir: result_dir.into(),
            snakefile: snakefile.into(),
            configfile: configfile.into(),
            dryrun: false,
            unlock: false,
            jobs: 1,
            cluster: None,
        }
    }

    pub fn with_dryrun(mut self, dryrun: bool) -> Self {
        self.dryrun = dryrun;
        self
    }

    pub fn with_unlock(mut self, unlock: bool) -> Self {
        self.unlock = unlock;
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_cluster(mut self, cluster: Option<String>) -> Self {
        self.cluster = cluster;
        self
    }
}

/// What the engine reported for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    /// Jobs outstanding before the invocation; empty when none ran.
    pub plan: RunPlan,
}

impl Report {
    pub fn outstanding(&self) -> u64 {
        self.plan.outstanding()
    }
}

/// An external workflow executor.
#[async_trait]
pub trait BuildEngine: Send + Sync {
    /// Runs the engine; a non-zero exit is an error.
    async fn execute(&self, invocation: &Invocation) -> Result<Report, EngineError>;
}
