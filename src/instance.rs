//! Running one attached pipeline version inside one repository.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::assembler::{self, AssemblyInputs, SubstitutionWarning};
use crate::catalog::{Catalog, GroupRecord, SampleRecord};
use crate::definition::{OriginGroup, PipelineDefinition};
use crate::eligibility::{self, Exclusion};
use crate::engine::{BuildEngine, Invocation, Report};
use crate::error::{RepoError, RunError};
use crate::home::InstalledPipeline;
use crate::repo::Repository;
use crate::resolver;
use crate::workflow::{self, EmitContext};

/// What to build in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Endpoints to build; `None` means the pipeline's declared endpoints.
    pub endpoints: Option<BTreeSet<String>>,
    pub excluded: BTreeSet<String>,
    /// Samples to consider; `None` means all (or the members of `groups`).
    pub samples: Option<Vec<String>>,
    /// Groups to consider; `None` means all (or those within `samples`).
    pub groups: Option<Vec<String>>,
    pub dryrun: bool,
    pub unlock: bool,
    pub jobs: usize,
    /// Run on this machine even if a cluster command is configured.
    pub local: bool,
    /// Benchmark every module.
    pub benchmark: bool,
    pub config_overlay: Option<PathBuf>,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            endpoints: None,
            excluded: BTreeSet::new(),
            samples: None,
            groups: None,
            dryrun: false,
            unlock: false,
            jobs: 1,
            local: true,
            benchmark: false,
            config_overlay: None,
        }
    }
}

impl RunRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = Some(endpoints.into_iter().map(Into::into).collect());
        self
    }

    pub fn excluding<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded.extend(endpoints.into_iter().map(Into::into));
        self
    }

    pub fn with_samples(mut self, samples: Vec<String>) -> Self {
        self.samples = Some(samples);
        self
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = Some(groups);
        self
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

    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    pub fn with_benchmark(mut self, benchmark: bool) -> Self {
        self.benchmark = benchmark;
        self
    }

    pub fn with_overlay(mut self, overlay: Option<PathBuf>) -> Self {
        self.config_overlay = overlay;
        self
    }
}

/// Result of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunOutcome {
    pub pipeline: String,
    pub version: String,
    /// Resolved endpoint names.
    pub endpoints: Vec<String>,
    pub final_targets: Vec<String>,
    pub excluded: Vec<Exclusion>,
    pub warnings: Vec<SubstitutionWarning>,
    /// `false` when there was nothing to build and the engine was skipped.
    pub engine_invoked: bool,
    pub report: Report,
}

impl RunOutcome {
    /// Jobs the engine reported as outstanding.
    pub fn outstanding(&self) -> u64 {
        self.report.outstanding()
    }
}

/// An attached pipeline version bound to its repository.
#[derive(Debug, Clone)]
pub struct PipelineInstance<'r> {
    repo: &'r Repository,
    pipeline: InstalledPipeline,
    registrar: PathBuf,
}

impl<'r> PipelineInstance<'r> {
    /// Loads the attached version of `name`; a given `version` must match it.
    pub fn load(repo: &'r Repository, name: &str, version: Option<&str>) -> Result<Self, RunError> {
        let attached = repo
            .pipeline_version(name)?
            .ok_or_else(|| RepoError::NotAttached(name.to_string()))?;
        if let Some(version) = version {
            if version != attached {
                return Err(RepoError::VersionMismatch {
                    name: name.to_string(),
                    expected: version.to_string(),
                    found: attached,
                }
                .into());
            }
        }

        let pipeline = repo.home().load_pipeline(name, Some(&attached))?;
        let registrar = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("modflow"));
        Ok(Self {
            repo,
            pipeline,
            registrar,
        })
    }

    /// Uses `registrar` as the executable in registration rules.
    pub fn with_registrar(mut self, registrar: impl Into<PathBuf>) -> Self {
        self.registrar = registrar.into();
        self
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.pipeline.definition
    }

    pub fn name(&self) -> &str {
        &self.pipeline.definition.name
    }

    pub fn version(&self) -> &str {
        &self.pipeline.definition.version
    }

    pub fn endpoints(&self) -> &BTreeSet<String> {
        &self.pipeline.definition.endpoints
    }

    pub fn origins(&self) -> &[OriginGroup] {
        &self.pipeline.definition.origins
    }

    pub fn pipeline_dir(&self) -> &Path {
        &self.pipeline.dir
    }

    /// Candidate samples and groups for a request.
    async fn candidates(
        &self,
        catalog: &dyn Catalog,
        request: &RunRequest,
    ) -> Result<(Vec<SampleRecord>, Vec<GroupRecord>), RunError> {
        let groups = match &request.groups {
            Some(names) => Some(catalog.groups(names).await?),
            None => None,
        };

        let samples = match (&request.samples, &groups) {
            (Some(names), _) => catalog.samples(names).await?,
            (None, Some(groups)) => {
                let mut seen = HashSet::new();
                groups
                    .iter()
                    .flat_map(|g| g.members.iter())
                    .filter(|m| seen.insert(m.name.clone()))
                    .cloned()
                    .collect()
            }
            (None, None) => catalog.all_samples().await?,
        };

        let groups = match groups {
            Some(groups) => groups,
            None if request.samples.is_some() => {
                let selected: HashSet<&str> = samples.iter().map(|s| s.name.as_str()).collect();
                catalog
                    .all_groups()
                    .await?
                    .into_iter()
                    .filter(|g| g.members.iter().all(|m| selected.contains(m.name.as_str())))
                    .collect()
            }
            None => catalog.all_groups().await?,
        };

        Ok((samples, groups))
    }

    /// Resolves, emits, assembles and hands the result to the engine.
    pub async fn run(
        &self,
        catalog: &dyn Catalog,
        engine: &dyn BuildEngine,
        request: &RunRequest,
    ) -> Result<RunOutcome, RunError> {
        let definition = &self.pipeline.definition;
        let resolved = resolver::resolve(
            &definition.result_schemas,
            request.endpoints.as_ref(),
            &definition.endpoints,
            &request.excluded,
        );

        let (samples, groups) = self.candidates(catalog, request).await?;
        let eligible = eligibility::filter_eligible(&definition.origins, samples, groups);

        let mut extensions: BTreeMap<String, String> = catalog.file_types().await?;
        extensions.extend(
            definition
                .file_types
                .values()
                .map(|ft| (ft.name.clone(), ft.extension.clone())),
        );

        let rules_dir = self.pipeline.rules_dir();
        for schema in resolved.buildable() {
            let path = workflow::module_rules_path(&rules_dir, &schema.module);
            if !path.is_file() {
                return Err(RunError::MissingModuleRules {
                    module: schema.module.clone(),
                    path,
                });
            }
        }

        let result_dir = self.repo.result_dir();
        let repo_root = self.repo.root();
        let plan = workflow::emit(&EmitContext {
            resolved: &resolved,
            eligible: &eligible,
            extensions: &extensions,
            rules_dir: &rules_dir,
            result_dir: &result_dir,
            repo_root,
            registrar: &self.registrar,
            benchmark_all: request.benchmark,
        })?;

        let scope = self.repo.scope();
        let overlay = request.config_overlay.as_deref().map(|p| scope.resolve(p));
        let base_config = self.pipeline.base_config();
        let origin_types = definition.origin_types();
        let assembled = assembler::assemble(AssemblyInputs {
            base_config: base_config.as_deref(),
            overlay: overlay.as_deref(),
            eligible: &eligible,
            origin_types: &origin_types,
            plan: &plan,
            pipeline_dir: &self.pipeline.dir,
            workdir: scope.dir(),
        })
        .await?;

        // Dry runs leave the repository untouched; their files live in a
        // scratch directory removed once the engine returns.
        let (_scratch, snakefile, configfile) = if request.dryrun {
            let scratch = tempfile::Builder::new().prefix("modflow-").tempdir()?;
            let snakefile = scratch.path().join(format!("snakemake_{}.smk", self.name()));
            let configfile = scratch
                .path()
                .join(format!("snakemake_{}.config.json", self.name()));
            (Some(scratch), snakefile, configfile)
        } else {
            std::fs::create_dir_all(&result_dir)?;
            (
                None,
                self.repo.snakefile_path(self.name()),
                self.repo.config_path(self.name()),
            )
        };
        std::fs::write(&snakefile, plan.snakefile.to_string())?;
        std::fs::write(&configfile, serde_json::to_string_pretty(&assembled.config)?)?;
        debug!(
            snakefile = %snakefile.display(),
            configfile = %configfile.display(),
            "Wrote generated workflow"
        );

        let mut outcome = RunOutcome {
            pipeline: self.name().to_string(),
            version: self.version().to_string(),
            endpoints: resolved.names().into_iter().map(String::from).collect(),
            final_targets: plan.final_targets.clone(),
            excluded: eligible.excluded,
            warnings: assembled.warnings,
            engine_invoked: false,
            report: Report::default(),
        };

        if plan.is_empty() && !request.unlock {
            info!(
                pipeline = %self.name(),
                version = %self.version(),
                "Nothing to build"
            );
            return Ok(outcome);
        }

        let cluster = if request.local {
            None
        } else {
            let script = self.repo.home().cluster_submit_script()?;
            if script.is_none() {
                warn!("No cluster submit script configured; running locally");
            }
            script
        };

        let invocation = Invocation::new(scope.dir(), &result_dir, &snakefile, &configfile)
            .with_dryrun(request.dryrun)
            .with_unlock(request.unlock)
            .with_jobs(request.jobs)
            .with_cluster(cluster);

        info!(
            pipeline = %self.name(),
            version = %self.version(),
            targets = plan.final_targets.len(),
            dryrun = request.dryrun,
            jobs = invocation.jobs,
            "Invoking build engine"
        );
        outcome.report = engine.execute(&invocation).await?;
        outcome.engine_invoked = true;
        Ok(outcome)
    }
}
