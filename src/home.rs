//! The configuration home.
//!
//! A single directory (by default `~/.modflow_config`) holding installed
//! pipelines and user-level settings:
//!
//! ```text
//! <home>/
//!   config_variables.yml          CLUSTER_SUBMIT_SCRIPT and friends
//!   daemon_config.yaml            default daemon configuration
//!   installed_pipelines/
//!     <name>::<version>/
//!       pipeline_definition.json
//!       <module>.snkmk
//!       snakemake_config.json
//! ```
//!
//! The environment is read once, by [`ConfigHome::from_env`]; everything
//! else receives the home explicitly.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::definition::{PipelineDefinition, DEFINITION_FILENAME};
use crate::error::{DefinitionError, RepoError};

/// Overrides the configuration home location.
pub const CONFIG_ENV: &str = "MODFLOW_CONFIG";
/// Overrides the daemon configuration location.
pub const DAEMON_CONFIG_ENV: &str = "MODFLOW_DAEMON_CONFIG";

const DEFAULT_DIR_NAME: &str = ".modflow_config";
const INSTALLED_DIR: &str = "installed_pipelines";
const CONFIG_VARS_FILE: &str = "config_variables.yml";
const DAEMON_CONFIG_FILE: &str = "daemon_config.yaml";
const DEFAULT_BASE_CONFIG: &str = "snakemake_config.json";
const CLUSTER_SUBMIT_KEY: &str = "CLUSTER_SUBMIT_SCRIPT";

/// Joins a pipeline name and version the way installed directories are named.
pub fn versioned_name(name: &str, version: &str) -> String {
    format!("{name}::{version}")
}

/// Splits `name::version`.
pub fn split_versioned_name(versioned: &str) -> Option<(&str, &str)> {
    versioned
        .split_once("::")
        .filter(|(name, version)| !name.is_empty() && !version.is_empty())
}

/// Orders version strings, treating `1.2` as `1.2.0`.
///
/// Strings that are not versions sort below every version and among
/// themselves lexically.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn parse(v: &str) -> Option<semver::Version> {
        let v = v.trim().trim_start_matches('v');
        semver::Version::parse(v).ok().or_else(|| {
            let parts = v.split('.').count();
            let padded = match parts {
                1 => format!("{v}.0.0"),
                2 => format!("{v}.0"),
                _ => return None,
            };
            semver::Version::parse(&padded).ok()
        })
    }

    match (parse(a), parse(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

/// An installed pipeline version and its directory.
#[derive(Debug, Clone)]
pub struct InstalledPipeline {
    pub definition: PipelineDefinition,
    pub dir: PathBuf,
}

impl InstalledPipeline {
    /// Directory holding the module rule files.
    pub fn rules_dir(&self) -> PathBuf {
        match &self.definition.rules_dir {
            Some(dir) => self.dir.join(dir),
            None => self.dir.clone(),
        }
    }

    /// Base engine configuration, if the pipeline ships one.
    ///
    /// An explicitly declared file is always returned so a missing file
    /// surfaces as an error; the default location is only used if present.
    pub fn base_config(&self) -> Option<PathBuf> {
        match &self.definition.base_config {
            Some(conf) => Some(self.dir.join(conf)),
            None => {
                let default = self.dir.join(DEFAULT_BASE_CONFIG);
                default.is_file().then_some(default)
            }
        }
    }
}

/// Explicit configuration context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigHome {
    root: PathBuf,
    daemon_config: Option<PathBuf>,
}

impl ConfigHome {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            daemon_config: None,
        }
    }

    /// Resolves the home from `MODFLOW_CONFIG`, falling back to
    /// `~/.modflow_config`. `None` when neither is available.
    pub fn from_env() -> Option<Self> {
        let root = match std::env::var_os(CONFIG_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()?.join(DEFAULT_DIR_NAME),
        };
        let daemon_config = std::env::var_os(DAEMON_CONFIG_ENV).map(PathBuf::from);
        Some(Self {
            root,
            daemon_config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the home layout. Returns `false` if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let existed = self.installed_dir().is_dir();
        std::fs::create_dir_all(self.installed_dir())?;
        Ok(!existed)
    }

    pub fn installed_dir(&self) -> PathBuf {
        self.root.join(INSTALLED_DIR)
    }

    pub fn daemon_config_path(&self) -> PathBuf {
        self.daemon_config
            .clone()
            .unwrap_or_else(|| self.root.join(DAEMON_CONFIG_FILE))
    }

    pub fn pipeline_dir(&self, name: &str, version: &str) -> PathBuf {
        self.installed_dir().join(versioned_name(name, version))
    }

    /// Installed pipelines: name -> versions, highest first.
    pub fn installed_pipelines(&self) -> Result<BTreeMap<String, Vec<String>>, DefinitionError> {
        let mut installed: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let dir = self.installed_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(installed),
            Err(source) => return Err(DefinitionError::Read { path: dir, source }),
        };

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(versioned) = file_name.to_str() else {
                continue;
            };
            let Some((name, version)) = split_versioned_name(versioned) else {
                continue;
            };
            if entry.path().join(DEFINITION_FILENAME).is_file() {
                installed
                    .entry(name.to_string())
                    .or_default()
                    .push(version.to_string());
            }
        }

        for versions in installed.values_mut() {
            versions.sort_by(|a, b| compare_versions(b, a));
        }
        Ok(installed)
    }

    /// Highest installed version of a pipeline.
    pub fn highest_version(&self, name: &str) -> Result<String, DefinitionError> {
        self.installed_pipelines()?
            .remove(name)
            .and_then(|versions| versions.into_iter().next())
            .ok_or_else(|| DefinitionError::NotInstalled(name.to_string()))
    }

    /// Loads an installed pipeline; `None` picks the highest version.
    pub fn load_pipeline(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<InstalledPipeline, DefinitionError> {
        let version = match version {
            Some(v) => v.to_string(),
            None => self.highest_version(name)?,
        };
        let dir = self.pipeline_dir(name, &version);
        let path = dir.join(DEFINITION_FILENAME);
        if !path.is_file() {
            return Err(DefinitionError::VersionNotInstalled {
                name: name.to_string(),
                version,
            });
        }

        let definition = PipelineDefinition::load(&path)?;
        if definition.name != name || definition.version != version {
            return Err(DefinitionError::Invalid(format!(
                "'{}' declares {}::{}",
                path.display(),
                definition.name,
                definition.version
            )));
        }
        debug!(pipeline = %name, version = %version, "Loaded installed pipeline");
        Ok(InstalledPipeline { definition, dir })
    }

    fn config_vars_path(&self) -> PathBuf {
        self.root.join(CONFIG_VARS_FILE)
    }

    /// User-level config variables.
    pub fn config_vars(&self) -> Result<BTreeMap<String, String>, RepoError> {
        let path = self.config_vars_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => Ok(serde_yaml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Command used to submit jobs to a cluster, if configured.
    pub fn cluster_submit_script(&self) -> Result<Option<String>, RepoError> {
        Ok(self.config_vars()?.remove(CLUSTER_SUBMIT_KEY))
    }

    pub fn set_cluster_submit_script(&self, script: &str) -> Result<(), RepoError> {
        let mut vars = self.config_vars()?;
        vars.insert(CLUSTER_SUBMIT_KEY.to_string(), script.to_string());
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(self.config_vars_path(), serde_yaml::to_string(&vars)?)?;
        Ok(())
    }
}
