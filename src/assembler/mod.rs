//! Engine configuration assembly.
//!
//! The configuration handed to the build engine is the pipeline's base
//! configuration, optionally overlaid by a user document, with shell command
//! substitutions resolved and the run's data bindings injected:
//!
//! - `<module>`: file role -> output path pattern
//! - `samples`: sample name -> `{sample_type}`
//! - `groups`: group name -> member sample names
//! - `origins`: origin type -> entity -> file role -> path
//! - `pipeline_dir`: installation directory of the pipeline
//! - `final_inputs`: targets for the `all` rule

pub mod merge;
pub mod substitution;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::catalog::ResultRecord;
use crate::eligibility::Eligible;
use crate::error::AssemblyError;
use crate::workflow::BuildPlan;

pub use merge::{load_document, merge};
pub use substitution::SubstitutionWarning;

/// Inputs to [`assemble`].
#[derive(Debug, Clone)]
pub struct AssemblyInputs<'a> {
    /// Base configuration; `None` starts from an empty mapping.
    pub base_config: Option<&'a Path>,
    pub overlay: Option<&'a Path>,
    pub eligible: &'a Eligible,
    pub origin_types: &'a BTreeSet<String>,
    pub plan: &'a BuildPlan,
    pub pipeline_dir: &'a Path,
    /// Directory substitution commands run in.
    pub workdir: &'a Path,
}

/// An assembled configuration and the substitutions that fell back.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub config: Value,
    pub warnings: Vec<SubstitutionWarning>,
}

/// Loads, merges and resolves the user-controlled part of the configuration.
async fn load_and_resolve(
    base: Option<PathBuf>,
    overlay: Option<PathBuf>,
    workdir: PathBuf,
) -> Result<(Value, Vec<SubstitutionWarning>), AssemblyError> {
    // Substitution runs child processes synchronously.
    let joined = tokio::task::spawn_blocking(move || {
        let mut config = match &base {
            Some(path) => load_document(path)?,
            None => Value::Object(Map::new()),
        };
        if let Some(path) = &overlay {
            debug!(overlay = %path.display(), "Applying config overlay");
            config = merge(config, load_document(path)?);
        }
        let mut run = |command: &str| substitution::run_shell(command, &workdir);
        substitution::resolve_tree(config, &mut run)
    })
    .await;

    joined.map_err(|e| AssemblyError::Task(e.to_string()))?
}

fn origin_bindings<'a, I>(origins: &mut Map<String, Value>, entity: &str, results: I)
where
    I: IntoIterator<Item = &'a ResultRecord>,
{
    for result in results {
        if let Some(Value::Object(by_entity)) = origins.get_mut(&result.result_type) {
            by_entity.insert(entity.to_string(), json!(result.file_paths()));
        }
    }
}

/// Builds the configuration for one run.
pub async fn assemble(inputs: AssemblyInputs<'_>) -> Result<Assembled, AssemblyError> {
    let (resolved, warnings) = load_and_resolve(
        inputs.base_config.map(Path::to_path_buf),
        inputs.overlay.map(Path::to_path_buf),
        inputs.workdir.to_path_buf(),
    )
    .await?;

    let mut config = match resolved {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    for (module, patterns) in &inputs.plan.module_patterns {
        let injected = json!(patterns);
        let entry = config
            .remove(module)
            .map(|existing| merge(existing, injected.clone()))
            .unwrap_or(injected);
        config.insert(module.clone(), entry);
    }

    let samples: Map<String, Value> = inputs
        .eligible
        .samples
        .iter()
        .map(|s| (s.name.clone(), json!({ "sample_type": s.sample_type })))
        .collect();
    config.insert("samples".into(), Value::Object(samples));

    let groups: Map<String, Value> = inputs
        .eligible
        .groups
        .iter()
        .map(|g| (g.name.clone(), json!(g.member_names())))
        .collect();
    config.insert("groups".into(), Value::Object(groups));

    let mut origins: Map<String, Value> = inputs
        .origin_types
        .iter()
        .map(|t| (t.clone(), Value::Object(Map::new())))
        .collect();
    for sample in &inputs.eligible.samples {
        origin_bindings(&mut origins, &sample.name, &sample.results);
    }
    for group in &inputs.eligible.groups {
        origin_bindings(&mut origins, &group.name, &group.results);
    }
    config.insert("origins".into(), Value::Object(origins));

    config.insert(
        "pipeline_dir".into(),
        Value::String(inputs.pipeline_dir.to_string_lossy().into_owned()),
    );
    config.insert("final_inputs".into(), json!(inputs.plan.final_targets));

    if !warnings.is_empty() {
        info!(count = warnings.len(), "Config assembled with failed substitutions");
    }
    Ok(Assembled {
        config: Value::Object(config),
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FileRecord, GroupRecord, SampleRecord};
    use crate::definition::Level;
    use std::collections::BTreeMap;

    fn origin_result(owner: &str, level: Level) -> ResultRecord {
        let mut files = BTreeMap::new();
        files.insert(
            "read1".to_string(),
            FileRecord::from_path(format!("/raw/{owner}_1.fq"), "fastq"),
        );
        ResultRecord {
            name: format!("{owner}::raw"),
            result_type: "raw".into(),
            owner: owner.into(),
            level,
            files,
        }
    }

    fn eligible() -> Eligible {
        let mut s1 = SampleRecord::new("s1", "metagenome");
        s1.results.push(origin_result("s1", Level::Sample));
        Eligible {
            groups: vec![GroupRecord {
                name: "g1".into(),
                members: vec![s1.clone()],
                results: vec![],
            }],
            samples: vec![s1],
            excluded: vec![],
        }
    }

    fn plan() -> BuildPlan {
        let mut plan = BuildPlan::default();
        plan.final_targets = vec!["s1/s1.filter.flag.registered".into()];
        plan.module_patterns.insert(
            "filter".into(),
            [("read1".to_string(), "{sample_name}/{sample_name}.filter.read1.fastq".to_string())]
                .into_iter()
                .collect(),
        );
        plan.module_patterns
            .insert("raw".into(), [("read1".to_string(), String::new())].into_iter().collect());
        plan
    }

    #[tokio::test]
    async fn test_assemble_injects_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.yaml");
        std::fs::write(&base, "threads: 8\nfilter:\n  min_len: 50\nlabel: \"run-`echo 7`\"\n").unwrap();
        let overlay = dir.path().join("overlay.json");
        std::fs::write(&overlay, r#"{"filter": {"min_len": 75}}"#).unwrap();

        let eligible = eligible();
        let origin_types: BTreeSet<String> = ["raw".to_string()].into();
        let plan = plan();
        let assembled = assemble(AssemblyInputs {
            base_config: Some(&base),
            overlay: Some(&overlay),
            eligible: &eligible,
            origin_types: &origin_types,
            plan: &plan,
            pipeline_dir: Path::new("/pipes/p::1"),
            workdir: dir.path(),
        })
        .await
        .unwrap();

        let config = assembled.config;
        assert!(assembled.warnings.is_empty());
        assert_eq!(config["threads"], "8");
        assert_eq!(config["label"], "run-7");
        assert_eq!(config["filter"]["min_len"], "75");
        assert_eq!(
            config["filter"]["read1"],
            "{sample_name}/{sample_name}.filter.read1.fastq"
        );
        assert_eq!(config["raw"]["read1"], "");
        assert_eq!(config["samples"]["s1"]["sample_type"], "metagenome");
        assert_eq!(config["groups"]["g1"], json!(["s1"]));
        assert_eq!(config["origins"]["raw"]["s1"]["read1"], "/raw/s1_1.fq");
        assert_eq!(config["pipeline_dir"], "/pipes/p::1");
        assert_eq!(config["final_inputs"], json!(["s1/s1.filter.flag.registered"]));
    }

    #[tokio::test]
    async fn test_missing_base_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let eligible = Eligible::default();
        let origin_types = BTreeSet::new();
        let plan = BuildPlan::default();
        let assembled = assemble(AssemblyInputs {
            base_config: None,
            overlay: None,
            eligible: &eligible,
            origin_types: &origin_types,
            plan: &plan,
            pipeline_dir: dir.path(),
            workdir: dir.path(),
        })
        .await
        .unwrap();
        assert_eq!(assembled.config["final_inputs"], json!([]));
        assert_eq!(assembled.config["origins"], json!({}));
    }

    #[tokio::test]
    async fn test_null_leaf_fails_assembly() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.json");
        std::fs::write(&base, r#"{"x": null}"#).unwrap();
        let eligible = Eligible::default();
        let origin_types = BTreeSet::new();
        let plan = BuildPlan::default();
        let err = assemble(AssemblyInputs {
            base_config: Some(&base),
            overlay: None,
            eligible: &eligible,
            origin_types: &origin_types,
            plan: &plan,
            pipeline_dir: dir.path(),
            workdir: dir.path(),
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AssemblyError::UnsupportedLeaf { .. }));
    }
}
