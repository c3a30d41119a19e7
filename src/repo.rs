//! Repositories: directories in which pipelines are run.
//!
//! A repository is marked by a `.modflow` directory at its root, which holds
//! the catalog database, the attached-pipeline manifest, the generated rule
//! and config files, and the result directory targets are built in.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::catalog::{self, Catalog, Registration, SqliteCatalog};
use crate::definition::PipelineDefinition;
use crate::error::RepoError;
use crate::home::ConfigHome;

/// Name of the directory marking a repository root.
pub const MARKER_DIR: &str = ".modflow";
const RESULT_DIR: &str = "core_results";
const PIPELINES_MANIFEST: &str = "pipelines.yml";

/// Working-directory scope for everything run on behalf of one repository.
///
/// Subprocesses are started in [`RepoScope::dir`]; the process-wide current
/// directory is never changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoScope {
    dir: PathBuf,
}

impl RepoScope {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolves a possibly relative path against the scope directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path)
        }
    }
}

/// A repository and the configuration home it was opened with.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
    home: ConfigHome,
}

impl Repository {
    /// Creates a repository at `root`, including an empty catalog.
    pub async fn init(root: &Path, home: ConfigHome) -> Result<Self, RepoError> {
        let root = std::path::absolute(root)?;
        let marker = root.join(MARKER_DIR);
        if marker.exists() {
            return Err(RepoError::AlreadyExists(root));
        }
        std::fs::create_dir_all(marker.join(RESULT_DIR))?;

        let repo = Self { root, home };
        repo.catalog().await?;
        info!(root = %repo.root.display(), "Initialized repository");
        Ok(repo)
    }

    /// Opens the repository rooted exactly at `root`.
    pub fn open(root: &Path, home: ConfigHome) -> Result<Self, RepoError> {
        let root = std::path::absolute(root)?;
        if !root.join(MARKER_DIR).is_dir() {
            return Err(RepoError::NotFound(root));
        }
        Ok(Self { root, home })
    }

    /// Opens the nearest repository at or above `start`.
    pub fn discover(start: &Path, home: ConfigHome) -> Result<Self, RepoError> {
        let start = std::path::absolute(start)?;
        match start.ancestors().find(|dir| dir.join(MARKER_DIR).is_dir()) {
            Some(root) => Ok(Self {
                root: root.to_path_buf(),
                home,
            }),
            None => Err(RepoError::NotFound(start)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn home(&self) -> &ConfigHome {
        &self.home
    }

    pub fn scope(&self) -> RepoScope {
        RepoScope::new(&self.root)
    }

    pub fn marker_dir(&self) -> PathBuf {
        self.root.join(MARKER_DIR)
    }

    /// Directory build targets are written to.
    pub fn result_dir(&self) -> PathBuf {
        self.marker_dir().join(RESULT_DIR)
    }

    pub fn catalog_path(&self) -> PathBuf {
        catalog::database_path(&self.marker_dir())
    }

    pub async fn catalog(&self) -> Result<SqliteCatalog, RepoError> {
        Ok(SqliteCatalog::open(&self.catalog_path()).await?)
    }

    /// Generated rule file for a pipeline.
    pub fn snakefile_path(&self, pipeline: &str) -> PathBuf {
        self.marker_dir().join(format!("snakemake_{pipeline}.smk"))
    }

    /// Generated engine config for a pipeline.
    pub fn config_path(&self, pipeline: &str) -> PathBuf {
        self.marker_dir()
            .join(format!("snakemake_{pipeline}.config.json"))
    }

    fn manifest_path(&self) -> PathBuf {
        self.marker_dir().join(PIPELINES_MANIFEST)
    }

    /// Attached pipelines: name -> version.
    pub fn pipelines(&self) -> Result<BTreeMap<String, String>, RepoError> {
        match std::fs::read_to_string(self.manifest_path()) {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => Ok(serde_yaml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_pipelines(&self, pipelines: &BTreeMap<String, String>) -> Result<(), RepoError> {
        std::fs::write(self.manifest_path(), serde_yaml::to_string(pipelines)?)?;
        Ok(())
    }

    pub fn pipeline_version(&self, name: &str) -> Result<Option<String>, RepoError> {
        Ok(self.pipelines()?.remove(name))
    }

    /// Attaches an installed pipeline and registers its types in the catalog.
    ///
    /// `version: None` picks the highest installed version. Re-attaching an
    /// attached pipeline requires `modify`. Returns the attached version.
    pub async fn add_pipeline(
        &self,
        catalog: &dyn Catalog,
        name: &str,
        version: Option<&str>,
        modify: bool,
    ) -> Result<String, RepoError> {
        let mut pipelines = self.pipelines()?;
        if !modify && pipelines.contains_key(name) {
            return Err(RepoError::AlreadyAttached(name.to_string()));
        }

        let installed = self.home.load_pipeline(name, version)?;
        register_types(catalog, &installed.definition).await?;

        let version = installed.definition.version.clone();
        pipelines.insert(name.to_string(), version.clone());
        self.write_pipelines(&pipelines)?;
        info!(pipeline = %name, version = %version, "Attached pipeline");
        Ok(version)
    }

    /// Makes sure `name` is attached at `version`, attaching it if absent.
    pub async fn ensure_pipeline(
        &self,
        catalog: &dyn Catalog,
        name: &str,
        version: &str,
    ) -> Result<(), RepoError> {
        match self.pipeline_version(name)? {
            Some(found) if found == version => Ok(()),
            Some(found) => Err(RepoError::VersionMismatch {
                name: name.to_string(),
                expected: version.to_string(),
                found,
            }),
            None => {
                self.add_pipeline(catalog, name, Some(version), false).await?;
                Ok(())
            }
        }
    }
}

/// Registers a definition's file types, sample types and result schemas.
async fn register_types(
    catalog: &dyn Catalog,
    definition: &PipelineDefinition,
) -> Result<(), RepoError> {
    let mut changed = 0usize;
    for file_type in definition.file_types.values() {
        if catalog.add_file_type(file_type).await? == Registration::Created {
            changed += 1;
        }
    }
    for sample_type in &definition.sample_types {
        if catalog.add_sample_type(sample_type).await? == Registration::Created {
            changed += 1;
        }
    }
    for schema in &definition.result_schemas {
        if schema.is_origin && schema.files.is_empty() {
            warn!(result_type = %schema.name, "Origin result type declares no files");
        }
        if catalog.add_result_schema(&schema.name, &schema.files).await?
            != Registration::AlreadyPresent
        {
            changed += 1;
        }
    }
    debug!(pipeline = %definition.name, changed, "Registered pipeline types");
    Ok(())
}
