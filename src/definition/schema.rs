//! Result schema declarations.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;

/// File role reserved for the per-target completion marker.
pub const FLAG_ROLE: &str = "flag";

/// Extension of the completion marker file.
pub const FLAG_EXTENSION: &str = "registered";

/// Granularity at which a result is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Level {
    /// One result per sample.
    Sample,
    /// One result per sample group.
    Group,
}

impl Level {
    /// Name of the engine wildcard that stands for the owning entity.
    pub fn wildcard(&self) -> &'static str {
        match self {
            Level::Sample => "sample_name",
            Level::Group => "group_name",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Sample => "SAMPLE",
            Level::Group => "GROUP",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SAMPLE" => Ok(Level::Sample),
            "GROUP" => Ok(Level::Group),
            other => Err(other.to_string()),
        }
    }
}

/// A declared unit of output produced by one module of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultSchema {
    /// Unique name, also the catalog result-type id.
    pub name: String,
    /// Build-rule namespace; defaults to `name`.
    pub module: String,
    pub level: Level,
    /// Schemas that must be part of the same run for this one to be buildable.
    pub dependencies: BTreeSet<String>,
    /// File role -> file type name.
    pub files: BTreeMap<String, String>,
    /// Data is expected to pre-exist in the catalog.
    pub is_origin: bool,
    /// Skip registration-rule emission.
    pub no_register: bool,
    /// Capture timings for the module's build rule.
    pub benchmarked: bool,
}

impl ResultSchema {
    /// Creates a sample-level schema with no dependencies or files.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            module: name.clone(),
            name,
            level: Level::Sample,
            dependencies: BTreeSet::new(),
            files: BTreeMap::new(),
            is_origin: false,
            no_register: false,
            benchmarked: false,
        }
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn with_file(mut self, role: impl Into<String>, file_type: impl Into<String>) -> Self {
        self.files.insert(role.into(), file_type.into());
        self
    }

    pub fn with_origin(mut self, is_origin: bool) -> Self {
        self.is_origin = is_origin;
        self
    }

    pub fn with_no_register(mut self, no_register: bool) -> Self {
        self.no_register = no_register;
        self
    }

    pub fn with_benchmark(mut self, benchmarked: bool) -> Self {
        self.benchmarked = benchmarked;
        self
    }

    /// True when the schema contributes a registration rule.
    pub fn registers(&self) -> bool {
        !self.is_origin && !self.no_register
    }
}

/// Raw `RESULT_TYPES` entry as written in the definition document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) struct RawSchema {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub files: Option<RawFiles>,
    #[serde(default)]
    pub options: RawOptions,
}

/// `FILES` is either a role mapping or a positional list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawFiles {
    Roles(BTreeMap<String, String>),
    Positional(Vec<String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) struct RawOptions {
    #[serde(default)]
    pub no_register: bool,
    #[serde(default)]
    pub benchmark: bool,
}

impl RawSchema {
    /// Converts the raw entry, marking it as an origin when its name appears
    /// in any origin group.
    pub(crate) fn into_schema(self, is_origin: bool) -> Result<ResultSchema, DefinitionError> {
        let level = match self.level.as_deref() {
            None => Level::Sample,
            Some(raw) => raw
                .parse::<Level>()
                .map_err(|level| DefinitionError::InvalidLevel {
                    schema: self.name.clone(),
                    level,
                })?,
        };

        let files = match self.files {
            Some(RawFiles::Roles(roles)) => roles,
            Some(RawFiles::Positional(types)) => types
                .into_iter()
                .enumerate()
                .map(|(i, t)| (i.to_string(), t))
                .collect(),
            None => BTreeMap::new(),
        };

        if files.contains_key(FLAG_ROLE) {
            return Err(DefinitionError::ReservedRole { schema: self.name });
        }
        if files.is_empty() && !is_origin {
            return Err(DefinitionError::NoFiles { schema: self.name });
        }

        Ok(ResultSchema {
            module: self.module.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            level,
            dependencies: self.dependencies.into_iter().collect(),
            files,
            is_origin,
            no_register: self.options.no_register,
            benchmarked: self.options.benchmark,
        })
    }
}
