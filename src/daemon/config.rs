//! Daemon configuration document.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::definition::scalar_string;
use crate::error::DaemonError;
use crate::home::{split_versioned_name, versioned_name};

/// Default total job budget for one cycle.
pub const DEFAULT_NUM_JOBS: usize = 10;
const DEFAULT_STATUS_TIMEOUT_SECS: u64 = 600;
const DEFAULT_INTERVAL_SECS: u64 = 300;

/// Configuration of the scheduling daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub repos: Vec<RepoConfig>,
    /// Total job budget, shared by all repositories.
    #[serde(default = "default_num_jobs")]
    pub num_jobs: usize,
    #[serde(default)]
    pub run_on_cluster: bool,
    /// Config overlays keyed by `name::version`.
    #[serde(default)]
    pub pipeline_configs: BTreeMap<String, PathBuf>,
    #[serde(default = "default_status_timeout_secs")]
    pub status_timeout_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

/// One repository the daemon keeps up to date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

/// One pipeline version within a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(deserialize_with = "scalar_string")]
    pub version: String,
    /// Outstanding jobs tolerated before the pipeline is considered for a run.
    #[serde(default)]
    pub tolerance: u64,
    #[serde(default)]
    pub endpoints: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_endpoints: Vec<String>,
    /// Overlay for this repository only; wins over `pipeline_configs`.
    #[serde(default)]
    pub config: Option<PathBuf>,
}

fn default_num_jobs() -> usize {
    DEFAULT_NUM_JOBS
}

fn default_status_timeout_secs() -> u64 {
    DEFAULT_STATUS_TIMEOUT_SECS
}

fn default_interval_secs() -> u64 {
    DEFAULT_INTERVAL_SECS
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            repos: Vec::new(),
            num_jobs: DEFAULT_NUM_JOBS,
            run_on_cluster: false,
            pipeline_configs: BTreeMap::new(),
            status_timeout_secs: DEFAULT_STATUS_TIMEOUT_SECS,
            interval_secs: DEFAULT_INTERVAL_SECS,
        }
    }
}

impl DaemonConfig {
    /// Loads and validates a config file.
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        let contents = std::fs::read_to_string(path).map_err(|source| DaemonError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&contents).map_err(|e| DaemonError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, DaemonError> {
        let config: Self =
            serde_yaml::from_str(contents).map_err(|e| DaemonError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.num_jobs == 0 {
            return Err(DaemonError::Invalid("num_jobs must be greater than 0".into()));
        }
        if self.status_timeout_secs == 0 {
            return Err(DaemonError::Invalid(
                "status_timeout_secs must be greater than 0".into(),
            ));
        }

        let mut names = HashSet::new();
        for repo in &self.repos {
            if !names.insert(repo.name.as_str()) {
                return Err(DaemonError::Invalid(format!(
                    "duplicate repository name '{}'",
                    repo.name
                )));
            }
            let mut pipelines = HashSet::new();
            for pipeline in &repo.pipelines {
                if !pipelines.insert(pipeline.name.as_str()) {
                    return Err(DaemonError::Invalid(format!(
                        "pipeline '{}' listed twice for repository '{}'",
                        pipeline.name, repo.name
                    )));
                }
            }
        }

        for key in self.pipeline_configs.keys() {
            if split_versioned_name(key).is_none() {
                return Err(DaemonError::Invalid(format!(
                    "pipeline_configs key '{key}' is not of the form name::version"
                )));
            }
        }
        Ok(())
    }

    pub fn run_locally(&self) -> bool {
        !self.run_on_cluster
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn repo(&self, name: &str) -> Option<&RepoConfig> {
        self.repos.iter().find(|r| r.name == name)
    }

    /// Config overlay for a pipeline in a repository, if any.
    pub fn overlay_for(&self, pipeline: &PipelineConfig) -> Option<PathBuf> {
        pipeline.config.clone().or_else(|| {
            self.pipeline_configs
                .get(&versioned_name(&pipeline.name, &pipeline.version))
                .cloned()
        })
    }
}
