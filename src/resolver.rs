//! Endpoint dependency resolution.
//!
//! Resolution narrows a candidate set of result schemas to its largest
//! subset that is closed under dependencies. Schemas are only ever removed:
//! excluding a schema removes everything that depends on it, and a request
//! that leaves out a transitive dependency resolves to nothing rather than
//! pulling the dependency in. Callers wanting "X and everything it needs"
//! must name the whole closure.
//!
//! Origin schemas are always candidates unless excluded: their data comes
//! from the catalog, so they never need requesting.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::{debug, warn};

use crate::definition::ResultSchema;

/// Result schemas selected for one run, sorted by name.
///
/// Every member's dependencies are themselves members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedEndpoints {
    schemas: Vec<ResultSchema>,
}

impl ResolvedEndpoints {
    pub fn schemas(&self) -> &[ResultSchema] {
        &self.schemas
    }

    pub fn names(&self) -> Vec<&str> {
        self.schemas.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.iter().any(|s| s.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Schemas that produce build obligations (everything but origins).
    pub fn buildable(&self) -> impl Iterator<Item = &ResultSchema> {
        self.schemas.iter().filter(|s| !s.is_origin)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResultSchema> {
        self.schemas.iter()
    }
}

/// Resolves the dependency-closed endpoint set for a run.
///
/// # Arguments
///
/// * `schemas` - every result schema of the pipeline
/// * `requested` - endpoints named by the caller; `None` means `declared`
/// * `declared` - the pipeline's default endpoints
/// * `excluded` - endpoints removed before closure
pub fn resolve(
    schemas: &[ResultSchema],
    requested: Option<&BTreeSet<String>>,
    declared: &BTreeSet<String>,
    excluded: &BTreeSet<String>,
) -> ResolvedEndpoints {
    let wanted = requested.unwrap_or(declared);

    let by_name: BTreeMap<&str, &ResultSchema> =
        schemas.iter().map(|s| (s.name.as_str(), s)).collect();

    for name in wanted.iter().filter(|n| !by_name.contains_key(n.as_str())) {
        warn!(endpoint = %name, "Requested endpoint is not a result type of this pipeline");
    }

    let mut candidates: BTreeMap<&str, &ResultSchema> = by_name
        .into_iter()
        .filter(|(name, schema)| {
            (schema.is_origin || wanted.contains(*name)) && !excluded.contains(*name)
        })
        .collect();

    loop {
        let present: HashSet<&str> = candidates.keys().copied().collect();
        let before = candidates.len();
        candidates.retain(|_, schema| {
            schema
                .dependencies
                .iter()
                .all(|dep| present.contains(dep.as_str()))
        });
        if candidates.len() == before {
            break;
        }
    }

    let resolved = ResolvedEndpoints {
        schemas: candidates.into_values().cloned().collect(),
    };
    debug!(
        wanted = wanted.len(),
        excluded = excluded.len(),
        resolved = resolved.len(),
        "Resolved endpoints"
    );
    resolved
}
