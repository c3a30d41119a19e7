//! CLI command definitions for modflow.
//!
//! Commands operate on the repository containing the current directory
//! unless `--root` is given. The configuration home is resolved once, here,
//! and passed to everything that needs it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::{Catalog, FileRecord, NewResult, Registration};
use crate::daemon::{self, DaemonConfig, RepoRunner, RepoStatus};
use crate::definition::{FileType, Level};
use crate::engine::{BuildEngine, Snakemake};
use crate::home::ConfigHome;
use crate::instance::{PipelineInstance, RunOutcome, RunRequest};
use crate::repo::Repository;

/// Modular, versioned data pipelines over a sample catalog.
#[derive(Parser)]
#[command(name = "modflow")]
#[command(about = "Run modular, versioned data pipelines over a sample catalog")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Build engine executable.
    #[arg(long, env = "MODFLOW_SNAKEMAKE", default_value = "snakemake", global = true)]
    pub snakemake: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Create a repository (and the configuration home if missing).
    Init(InitArgs),

    /// Attach an installed pipeline to the repository.
    Add(AddArgs),

    /// Build a pipeline's endpoints for the repository's samples.
    Run(RunArgs),

    /// Show pipelines.
    View(ViewArgs),

    /// Record a finished result in the catalog. Called by generated rules.
    Register(RegisterArgs),

    /// Edit the sample catalog.
    Catalog(CatalogArgs),

    /// Edit user-level settings.
    Config(ConfigArgs),

    /// Keep configured repositories up to date.
    Daemon(DaemonArgs),
}

/// Arguments for `modflow init`.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Repository directory.
    #[arg(default_value = ".")]
    pub root: PathBuf,
}

/// Arguments for `modflow add`.
#[derive(Parser, Debug)]
pub struct AddArgs {
    /// Installed pipeline name.
    pub pipeline: String,

    /// Version to attach; defaults to the highest installed.
    #[arg(short = 'v', long)]
    pub version: Option<String>,

    /// Replace the version already attached.
    #[arg(long)]
    pub modify: bool,

    /// Repository root; defaults to the enclosing repository.
    #[arg(long)]
    pub root: Option<PathBuf>,
}

/// Arguments for `modflow run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Attached pipeline name.
    pub pipeline: String,

    /// Expected attached version.
    #[arg(short = 'v', long)]
    pub version: Option<String>,

    /// Endpoints to build (comma-separated); defaults to the declared ones.
    #[arg(short = 'e', long, value_delimiter = ',')]
    pub endpoints: Option<Vec<String>>,

    /// Endpoints to leave out (comma-separated).
    #[arg(short = 'x', long, value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Samples to process (comma-separated).
    #[arg(short = 's', long, value_delimiter = ',')]
    pub samples: Option<Vec<String>>,

    /// Groups to process (comma-separated).
    #[arg(short = 'g', long, value_delimiter = ',')]
    pub groups: Option<Vec<String>>,

    /// Plan without building.
    #[arg(short = 'n', long)]
    pub dryrun: bool,

    /// Remove a stale engine lock.
    #[arg(long)]
    pub unlock: bool,

    /// Concurrent job budget.
    #[arg(short = 'j', long, default_value = "1")]
    pub jobs: usize,

    /// Submit jobs with the configured cluster command.
    #[arg(long)]
    pub cluster: bool,

    /// Benchmark every module.
    #[arg(long)]
    pub benchmark: bool,

    /// Config overlay merged over the pipeline's base config.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Output JSON summary.
    #[arg(long)]
    pub json: bool,

    /// Repository root; defaults to the enclosing repository.
    #[arg(long)]
    pub root: Option<PathBuf>,
}

/// Arguments for `modflow view`.
#[derive(Parser, Debug)]
pub struct ViewArgs {
    #[command(subcommand)]
    pub command: ViewSubcommand,
}

/// View subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum ViewSubcommand {
    /// List attached (or installed) pipelines.
    Pipelines {
        /// List every installed version instead.
        #[arg(long)]
        installed: bool,

        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Describe an installed pipeline.
    Detail {
        pipeline: String,

        #[arg(short = 'v', long)]
        version: Option<String>,
    },
}

/// Arguments for `modflow register`.
#[derive(Parser, Debug)]
pub struct RegisterArgs {
    /// Repository root.
    #[arg(long)]
    pub root: PathBuf,

    /// SAMPLE or GROUP.
    #[arg(long)]
    pub level: String,

    /// Owning sample or group.
    #[arg(long)]
    pub entity: String,

    /// Result type being registered.
    #[arg(long)]
    pub schema: String,

    /// Files as `role:type=path`.
    #[arg(long = "file")]
    pub files: Vec<String>,
}

/// Arguments for `modflow catalog`.
#[derive(Parser, Debug)]
pub struct CatalogArgs {
    #[command(subcommand)]
    pub command: CatalogSubcommand,

    #[arg(long, global = true)]
    pub root: Option<PathBuf>,
}

/// Catalog subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum CatalogSubcommand {
    /// Add a sample.
    AddSample { name: String, sample_type: String },

    /// Add a group of existing samples.
    AddGroup {
        name: String,
        #[arg(required = true)]
        members: Vec<String>,
    },

    /// Add a file type.
    AddFileType {
        name: String,
        /// Extension; defaults to the name.
        #[arg(long)]
        ext: Option<String>,
    },

    /// Register an origin result for a sample.
    AddResult {
        sample: String,
        result_type: String,
        /// Files as `role:type=path`.
        #[arg(long = "file", required = true)]
        files: Vec<String>,
    },
}

/// Arguments for `modflow config`.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

/// Config subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Set the command used to submit jobs to a cluster.
    ClusterSubmit { script: String },
}

/// Arguments for `modflow daemon`.
#[derive(Parser, Debug)]
pub struct DaemonArgs {
    #[command(subcommand)]
    pub command: DaemonSubcommand,

    /// Daemon config; defaults to `MODFLOW_DAEMON_CONFIG` or the home's.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

/// Daemon subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum DaemonSubcommand {
    /// Print outstanding jobs per repository and pipeline.
    Status,
    /// Run one cycle.
    Run,
    /// Run cycles until interrupted.
    Serve,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let home = ConfigHome::from_env().ok_or_else(|| {
        anyhow::anyhow!("Cannot locate a configuration home; set MODFLOW_CONFIG")
    })?;
    let engine: Arc<dyn BuildEngine> = Arc::new(Snakemake::with_program(cli.snakemake));

    match cli.command {
        Commands::Init(args) => run_init_command(args, home).await,
        Commands::Add(args) => run_add_command(args, home).await,
        Commands::Run(args) => run_run_command(args, home, engine.as_ref()).await,
        Commands::View(args) => run_view_command(args, home),
        Commands::Register(args) => run_register_command(args, home).await,
        Commands::Catalog(args) => run_catalog_command(args, home).await,
        Commands::Config(args) => run_config_command(args, home),
        Commands::Daemon(args) => run_daemon_command(args, home, engine).await,
    }
}

fn open_repo(root: Option<&Path>, home: ConfigHome) -> anyhow::Result<Repository> {
    let repo = match root {
        Some(root) => Repository::open(root, home)?,
        None => Repository::discover(&std::env::current_dir()?, home)?,
    };
    Ok(repo)
}

/// Parses `role:type=path`.
fn parse_file_arg(raw: &str) -> anyhow::Result<(String, String, PathBuf)> {
    let (key, path) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Expected role:type=path, got '{}'", raw))?;
    let (role, file_type) = key
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("Expected role:type=path, got '{}'", raw))?;
    if role.is_empty() || file_type.is_empty() || path.is_empty() {
        anyhow::bail!("Expected role:type=path, got '{}'", raw);
    }
    Ok((role.to_string(), file_type.to_string(), PathBuf::from(path)))
}

fn parse_files(raw: &[String]) -> anyhow::Result<BTreeMap<String, FileRecord>> {
    let mut files = BTreeMap::new();
    for arg in raw {
        let (role, file_type, path) = parse_file_arg(arg)?;
        let path = std::path::absolute(&path)?;
        files.insert(role, FileRecord::from_path(path, file_type));
    }
    Ok(files)
}

fn log_registration(what: &str, name: &str, registration: Registration) {
    match registration {
        Registration::Created => info!(name = %name, "Registered {}", what),
        Registration::AlreadyPresent => warn!(name = %name, "{} already registered", what),
        Registration::Updated => info!(name = %name, "Updated {}", what),
    }
}

async fn run_init_command(args: InitArgs, home: ConfigHome) -> anyhow::Result<()> {
    if home.init()? {
        info!(home = %home.root().display(), "Created configuration home");
    }
    let repo = Repository::init(&args.root, home).await?;
    println!("Initialized repository at {}", repo.root().display());
    Ok(())
}

async fn run_add_command(args: AddArgs, home: ConfigHome) -> anyhow::Result<()> {
    let repo = open_repo(args.root.as_deref(), home)?;
    let catalog = repo.catalog().await?;
    let version = repo
        .add_pipeline(&catalog, &args.pipeline, args.version.as_deref(), args.modify)
        .await?;
    println!("Attached {} {}", args.pipeline, version);
    Ok(())
}

#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    status: &'static str,
    #[serde(flatten)]
    outcome: &'a RunOutcome,
}

async fn run_run_command(
    args: RunArgs,
    home: ConfigHome,
    engine: &dyn BuildEngine,
) -> anyhow::Result<()> {
    let repo = open_repo(args.root.as_deref(), home)?;
    let catalog = repo.catalog().await?;
    let instance = PipelineInstance::load(&repo, &args.pipeline, args.version.as_deref())?;

    let mut request = RunRequest::new()
        .excluding(args.exclude)
        .with_dryrun(args.dryrun)
        .with_unlock(args.unlock)
        .with_jobs(args.jobs)
        .with_local(!args.cluster)
        .with_benchmark(args.benchmark)
        .with_overlay(args.config);
    if let Some(endpoints) = args.endpoints {
        request = request.with_endpoints(endpoints);
    }
    if let Some(samples) = args.samples {
        request = request.with_samples(samples);
    }
    if let Some(groups) = args.groups {
        request = request.with_groups(groups);
    }

    let outcome = instance.run(&catalog, engine, &request).await?;

    if args.json {
        let summary = RunSummary {
            status: "success",
            outcome: &outcome,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "{} {}: {} endpoint(s), {} target(s)",
        outcome.pipeline,
        outcome.version,
        outcome.endpoints.len(),
        outcome.final_targets.len()
    );
    for exclusion in &outcome.excluded {
        println!("  skipped {} ({})", exclusion.entity, exclusion.reason);
    }
    if outcome.engine_invoked && args.dryrun {
        println!("  {} job(s) outstanding", outcome.outstanding());
    }
    Ok(())
}

fn run_view_command(args: ViewArgs, home: ConfigHome) -> anyhow::Result<()> {
    match args.command {
        ViewSubcommand::Pipelines { installed: true, .. } => {
            for (name, versions) in home.installed_pipelines()? {
                println!("{}\t{}", name, versions.join(", "));
            }
        }
        ViewSubcommand::Pipelines {
            installed: false,
            root,
        } => {
            let repo = open_repo(root.as_deref(), home)?;
            for (name, version) in repo.pipelines()? {
                println!("{}\t{}", name, version);
            }
        }
        ViewSubcommand::Detail { pipeline, version } => {
            let installed = home.load_pipeline(&pipeline, version.as_deref())?;
            let definition = &installed.definition;
            println!("{} {}", definition.name, definition.version);
            println!("  directory: {}", installed.dir.display());
            let origins: Vec<String> = definition.origins.iter().map(|o| o.to_string()).collect();
            println!("  origins: {}", origins.join(", "));
            let endpoints: Vec<&str> = definition.endpoints.iter().map(String::as_str).collect();
            println!("  endpoints: {}", endpoints.join(", "));
            for schema in &definition.result_schemas {
                let deps: Vec<&str> = schema.dependencies.iter().map(String::as_str).collect();
                println!(
                    "  {} [{}] module={} depends on: {}",
                    schema.name,
                    schema.level.as_str(),
                    schema.module,
                    if deps.is_empty() {
                        "-".to_string()
                    } else {
                        deps.join(", ")
                    }
                );
            }
        }
    }
    Ok(())
}

async fn run_register_command(args: RegisterArgs, home: ConfigHome) -> anyhow::Result<()> {
    let level: Level = args
        .level
        .parse()
        .map_err(|other| anyhow::anyhow!("Unknown level '{}'", other))?;
    let repo = Repository::open(&args.root, home)?;
    let catalog = repo.catalog().await?;

    let result = NewResult {
        owner: args.entity,
        level,
        result_type: args.schema,
        files: parse_files(&args.files)?,
    };
    let registration = catalog.register_result(&result).await?;
    log_registration("result", &result.name(), registration);
    Ok(())
}

async fn run_catalog_command(args: CatalogArgs, home: ConfigHome) -> anyhow::Result<()> {
    let repo = open_repo(args.root.as_deref(), home)?;
    let catalog = repo.catalog().await?;

    match args.command {
        CatalogSubcommand::AddSample { name, sample_type } => {
            let registration = catalog.add_sample(&name, &sample_type).await?;
            log_registration("sample", &name, registration);
        }
        CatalogSubcommand::AddGroup { name, members } => {
            let registration = catalog.add_group(&name, &members).await?;
            log_registration("group", &name, registration);
        }
        CatalogSubcommand::AddFileType { name, ext } => {
            let extension = ext.unwrap_or_else(|| name.clone());
            let registration = catalog
                .add_file_type(&FileType::new(name.clone(), extension))
                .await?;
            log_registration("file type", &name, registration);
        }
        CatalogSubcommand::AddResult {
            sample,
            result_type,
            files,
        } => {
            let result = NewResult {
                owner: sample,
                level: Level::Sample,
                result_type,
                files: parse_files(&files)?,
            };
            let registration = catalog.register_result(&result).await?;
            log_registration("result", &result.name(), registration);
        }
    }
    Ok(())
}

fn run_config_command(args: ConfigArgs, home: ConfigHome) -> anyhow::Result<()> {
    match args.command {
        ConfigSubcommand::ClusterSubmit { script } => {
            home.set_cluster_submit_script(&script)?;
            println!("Cluster submit command set");
        }
    }
    Ok(())
}

async fn run_daemon_command(
    args: DaemonArgs,
    home: ConfigHome,
    engine: Arc<dyn BuildEngine>,
) -> anyhow::Result<()> {
    let config_path = args.config.unwrap_or_else(|| home.daemon_config_path());
    let runner: Arc<dyn daemon::PipelineRunner> = Arc::new(RepoRunner::new(home, engine));

    match args.command {
        DaemonSubcommand::Status => {
            let config = DaemonConfig::load(&config_path)?;
            let jobs = daemon::job_budget(config.num_jobs, config.repos.len());
            let snapshot = daemon::collect_status(&config, runner, jobs).await;
            let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
            for report in &snapshot.reports {
                match &report.status {
                    RepoStatus::Ready(counts) => {
                        for count in counts {
                            println!(
                                "[{}] {} {} {}: {} job(s) outstanding (tolerance {})",
                                now,
                                report.repo,
                                count.name,
                                count.version,
                                count.outstanding,
                                count.tolerance
                            );
                        }
                    }
                    RepoStatus::Failed(error) => {
                        println!("[{}] {}: failed: {}", now, report.repo, error);
                    }
                    RepoStatus::TimedOut => {
                        println!("[{}] {}: timed out", now, report.repo);
                    }
                }
            }
        }
        DaemonSubcommand::Run => {
            let config = DaemonConfig::load(&config_path)?;
            let outcome = daemon::run_cycle(&config, runner).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        DaemonSubcommand::Serve => {
            daemon::serve(&config_path, runner).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_file_arg() {
        let (role, file_type, path) = parse_file_arg("read1:fastq=/raw/s1.fq").unwrap();
        assert_eq!(role, "read1");
        assert_eq!(file_type, "fastq");
        assert_eq!(path, PathBuf::from("/raw/s1.fq"));

        assert!(parse_file_arg("read1=/raw/s1.fq").is_err());
        assert!(parse_file_arg("read1:fastq").is_err());
        assert!(parse_file_arg(":fastq=/x").is_err());
    }

    #[test]
    fn test_run_args() {
        let cli = Cli::try_parse_from([
            "modflow", "run", "meta", "-e", "qc,assembly", "-x", "binning", "-n", "-j", "4",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.pipeline, "meta");
                assert_eq!(
                    args.endpoints,
                    Some(vec!["qc".to_string(), "assembly".to_string()])
                );
                assert_eq!(args.exclude, vec!["binning"]);
                assert!(args.dryrun);
                assert_eq!(args.jobs, 4);
                assert!(!args.cluster);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_register_args() {
        let cli = Cli::try_parse_from([
            "modflow",
            "register",
            "--root",
            "/data/repo",
            "--level",
            "sample",
            "--entity",
            "s1",
            "--schema",
            "qc",
            "--file",
            "report:report=s1/s1.qc.report.tsv",
        ])
        .unwrap();
        match cli.command {
            Commands::Register(args) => {
                assert_eq!(args.entity, "s1");
                assert_eq!(args.files.len(), 1);
                assert_eq!(args.level.parse::<Level>(), Ok(Level::Sample));
            }
            _ => panic!("expected register"),
        }
    }
}
