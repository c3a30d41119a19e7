//! Catalog of samples, sample groups, results and files.
//!
//! The catalog is the metadata store pipelines read their inputs from and
//! register their outputs into. This module defines the records and the
//! [`Catalog`] trait; [`SqliteCatalog`] is the bundled implementation.

mod sqlite;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::definition::{FileType, Level};
use crate::error::CatalogError;

pub use sqlite::SqliteCatalog;

/// Joins an owning entity name and a result type into a result name.
pub fn result_name(owner: &str, result_type: &str) -> String {
    format!("{owner}::{result_type}")
}

/// A file registered in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub path: PathBuf,
    pub file_type: String,
}

impl FileRecord {
    /// Creates a record named after the file's basename.
    pub fn from_path(path: impl Into<PathBuf>, file_type: impl Into<String>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            name,
            path,
            file_type: file_type.into(),
        }
    }
}

/// A result attached to a sample or group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub name: String,
    pub result_type: String,
    pub owner: String,
    pub level: Level,
    /// File role -> file.
    pub files: BTreeMap<String, FileRecord>,
}

impl ResultRecord {
    /// File role -> path, as handed to build rules.
    pub fn file_paths(&self) -> BTreeMap<String, String> {
        self.files
            .iter()
            .map(|(role, f)| (role.clone(), f.path.to_string_lossy().into_owned()))
            .collect()
    }
}

/// A sample and the results it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub name: String,
    pub sample_type: String,
    pub results: Vec<ResultRecord>,
}

impl SampleRecord {
    pub fn new(name: impl Into<String>, sample_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sample_type: sample_type.into(),
            results: Vec::new(),
        }
    }

    pub fn result_types(&self) -> impl Iterator<Item = &str> {
        self.results.iter().map(|r| r.result_type.as_str())
    }
}

/// A sample group, its member samples in order, and the group-level results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    pub members: Vec<SampleRecord>,
    pub results: Vec<ResultRecord>,
}

impl GroupRecord {
    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name.clone()).collect()
    }
}

/// Outcome of an idempotent registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// An identical record already existed; nothing was written.
    AlreadyPresent,
    /// The record existed with different contents and was replaced.
    Updated,
}

/// A result to be written by a registration rule.
#[derive(Debug, Clone)]
pub struct NewResult {
    pub owner: String,
    pub level: Level,
    pub result_type: String,
    pub files: BTreeMap<String, FileRecord>,
}

impl NewResult {
    pub fn name(&self) -> String {
        result_name(&self.owner, &self.result_type)
    }
}

/// Metadata store consumed by pipelines.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Every sample with its results.
    async fn all_samples(&self) -> Result<Vec<SampleRecord>, CatalogError>;

    /// The named samples; unknown names are an error.
    async fn samples(&self, names: &[String]) -> Result<Vec<SampleRecord>, CatalogError>;

    /// Every group with its members and group-level results.
    async fn all_groups(&self) -> Result<Vec<GroupRecord>, CatalogError>;

    /// The named groups; unknown names are an error.
    async fn groups(&self, names: &[String]) -> Result<Vec<GroupRecord>, CatalogError>;

    /// File type name -> extension for every registered file type.
    async fn file_types(&self) -> Result<BTreeMap<String, String>, CatalogError>;

    async fn file_type_extension(&self, name: &str) -> Result<Option<String>, CatalogError> {
        Ok(self.file_types().await?.remove(name))
    }

    async fn add_file_type(&self, file_type: &FileType) -> Result<Registration, CatalogError>;

    async fn add_sample_type(&self, name: &str) -> Result<Registration, CatalogError>;

    async fn add_result_schema(
        &self,
        name: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<Registration, CatalogError>;

    async fn add_sample(&self, name: &str, sample_type: &str)
        -> Result<Registration, CatalogError>;

    async fn add_group(&self, name: &str, members: &[String])
        -> Result<Registration, CatalogError>;

    /// Registers a file; an identical existing record is reported, not an error.
    async fn register_file(&self, file: &FileRecord) -> Result<Registration, CatalogError>;

    /// Registers a result and its files and associates it with its owner.
    async fn register_result(&self, result: &NewResult) -> Result<Registration, CatalogError>;
}

/// Default catalog database location inside a repository marker directory.
pub fn database_path(marker_dir: &Path) -> PathBuf {
    marker_dir.join("catalog.db")
}
