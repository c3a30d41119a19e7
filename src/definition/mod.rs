//! Pipeline definitions.
//!
//! A pipeline definition is the immutable, declarative description of one
//! pipeline version: which file types and sample types it uses, which result
//! types it produces, and which result types it expects to find already in
//! the catalog ("origins").
//!
//! # Example
//!
//! ```yaml
//! NAME: metagenomics
//! VERSION: 1.2.0
//! FILE_TYPES: [fastq, {NAME: report, EXT: tsv}]
//! SAMPLE_TYPES: [metagenome]
//! ORIGINS: [[raw_short_reads, raw_long_reads]]
//! RESULT_TYPES:
//!   - NAME: raw_short_reads
//!   - NAME: filtered_reads
//!     FILES: {read1: fastq, read2: fastq}
//!   - NAME: taxonomy
//!     DEPENDENCIES: [filtered_reads]
//!     FILES: {report: report}
//! ```

mod schema;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::error::DefinitionError;

pub use schema::{Level, ResultSchema, FLAG_EXTENSION, FLAG_ROLE};
use schema::RawSchema;

/// File name of the definition inside an installed pipeline directory.
pub const DEFINITION_FILENAME: &str = "pipeline_definition.json";

/// A named file type and the extension its files carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FileType {
    pub name: String,
    pub extension: String,
}

impl FileType {
    pub fn new(name: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extension: extension.into(),
        }
    }
}

/// A set of alternative result types; a sample satisfies the group when it
/// holds a result of any one of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OriginGroup(Vec<String>);

impl OriginGroup {
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let members = members
            .into_iter()
            .map(Into::into)
            .filter(|m: &String| seen.insert(m.clone()))
            .collect();
        Self(members)
    }

    pub fn members(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, result_type: &str) -> bool {
        self.0.iter().any(|m| m == result_type)
    }

    /// True if any held result type is a member of this group.
    pub fn is_satisfied_by<'a, I>(&self, held: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        held.into_iter().any(|t| self.contains(t))
    }
}

impl fmt::Display for OriginGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("|"))
    }
}

/// Immutable description of one pipeline version.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub version: String,
    /// File type name -> file type.
    pub file_types: BTreeMap<String, FileType>,
    pub sample_types: BTreeSet<String>,
    pub origins: Vec<OriginGroup>,
    pub result_schemas: Vec<ResultSchema>,
    /// Endpoints built when a run does not name any.
    pub endpoints: BTreeSet<String>,
    /// Directory holding module rule files, relative to the pipeline directory.
    pub rules_dir: Option<String>,
    /// Base engine configuration, relative to the pipeline directory.
    pub base_config: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct RawDefinition {
    name: String,
    #[serde(deserialize_with = "scalar_string")]
    version: String,
    #[serde(default)]
    file_types: Vec<RawFileType>,
    #[serde(default)]
    sample_types: Vec<String>,
    #[serde(default)]
    origins: Vec<RawOrigin>,
    #[serde(default)]
    end_points: Option<Vec<String>>,
    result_types: Vec<RawSchema>,
    #[serde(default)]
    snakemake: Option<RawSnakemake>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFileType {
    Bare(String),
    Full {
        #[serde(rename = "NAME")]
        name: String,
        #[serde(rename = "EXT")]
        ext: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawOrigin {
    Single(String),
    AnyOf(Vec<String>),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct RawSnakemake {
    #[serde(default)]
    dir: Option<String>,
    #[serde(default)]
    conf: Option<String>,
}

/// Accepts `VERSION: 1.0` as well as `VERSION: "1.0"`.
pub(crate) fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number, got {other:?}"
        ))),
    }
}

impl PipelineDefinition {
    /// Loads a definition from a JSON or YAML file, chosen by extension.
    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let contents = std::fs::read_to_string(path).map_err(|source| DefinitionError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let raw: RawDefinition = if is_json {
            serde_json::from_str(&contents).map_err(|e| DefinitionError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(&contents).map_err(|e| DefinitionError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        };

        let definition = Self::from_raw(raw)?;
        debug!(
            pipeline = %definition.name,
            version = %definition.version,
            schemas = definition.result_schemas.len(),
            "Loaded pipeline definition"
        );
        Ok(definition)
    }

    /// Parses a definition from YAML (or JSON, which YAML accepts).
    pub fn from_yaml_str(contents: &str) -> Result<Self, DefinitionError> {
        let raw: RawDefinition =
            serde_yaml::from_str(contents).map_err(|e| DefinitionError::Parse {
                path: "<inline>".into(),
                message: e.to_string(),
            })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawDefinition) -> Result<Self, DefinitionError> {
        if raw.name.trim().is_empty() {
            return Err(DefinitionError::MissingField("NAME".to_string()));
        }
        if raw.version.trim().is_empty() {
            return Err(DefinitionError::MissingField("VERSION".to_string()));
        }

        let file_types = raw
            .file_types
            .into_iter()
            .map(|ft| match ft {
                RawFileType::Bare(name) => FileType::new(name.clone(), name),
                RawFileType::Full { name, ext } => FileType::new(name, ext),
            })
            .map(|ft| (ft.name.clone(), ft))
            .collect();

        let origins: Vec<OriginGroup> = raw
            .origins
            .into_iter()
            .map(|o| match o {
                RawOrigin::Single(name) => OriginGroup::new([name]),
                RawOrigin::AnyOf(names) => OriginGroup::new(names),
            })
            .filter(|g| !g.members().is_empty())
            .collect();

        let mut seen = HashSet::new();
        let mut result_schemas = Vec::with_capacity(raw.result_types.len());
        for raw_schema in raw.result_types {
            if !seen.insert(raw_schema.name.clone()) {
                return Err(DefinitionError::DuplicateSchema(raw_schema.name));
            }
            let is_origin = origins.iter().any(|g| g.contains(&raw_schema.name));
            result_schemas.push(raw_schema.into_schema(is_origin)?);
        }

        for schema in &result_schemas {
            if let Some(missing) = schema.dependencies.iter().find(|d| !seen.contains(*d)) {
                return Err(DefinitionError::Invalid(format!(
                    "result type '{}' depends on undeclared result type '{}'",
                    schema.name, missing
                )));
            }
        }

        let endpoints = match raw.end_points {
            Some(declared) => {
                if let Some(unknown) = declared.iter().find(|e| !seen.contains(*e)) {
                    return Err(DefinitionError::Invalid(format!(
                        "END_POINTS names undeclared result type '{unknown}'"
                    )));
                }
                declared.into_iter().collect()
            }
            None => result_schemas
                .iter()
                .filter(|s| !s.is_origin)
                .map(|s| s.name.clone())
                .collect(),
        };

        let snakemake = raw.snakemake.unwrap_or_default();

        Ok(Self {
            name: raw.name,
            version: raw.version,
            file_types,
            sample_types: raw.sample_types.into_iter().collect(),
            origins,
            result_schemas,
            endpoints,
            rules_dir: snakemake.dir,
            base_config: snakemake.conf,
        })
    }

    /// Looks up a result schema by name.
    pub fn schema(&self, name: &str) -> Option<&ResultSchema> {
        self.result_schemas.iter().find(|s| s.name == name)
    }

    /// Every result-type name that appears in any origin group.
    pub fn origin_types(&self) -> BTreeSet<String> {
        self.origins
            .iter()
            .flat_map(|g| g.members().iter().cloned())
            .collect()
    }

    /// Extension for a file type declared by this pipeline.
    pub fn extension(&self, file_type: &str) -> Option<&str> {
        self.file_types.get(file_type).map(|ft| ft.extension.as_str())
    }
}
