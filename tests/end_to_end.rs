//! End-to-end tests: a repository, an installed pipeline, a fake build engine
//! and one daemon cycle.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use modflow::catalog::{FileRecord, NewResult};
use modflow::daemon::{self, CycleOutcome, DaemonConfig, RepoRunner, RepoStatus};
use modflow::engine::{Invocation, Report};
use modflow::{
    BuildEngine, Catalog, ConfigHome, EngineError, Level, PipelineInstance, Repository,
    RunRequest,
};

const DEFINITION: &str = r#"{
    "NAME": "meta",
    "VERSION": "1.0",
    "FILE_TYPES": ["fastq", {"NAME": "report", "EXT": "tsv"}],
    "SAMPLE_TYPES": ["metagenome"],
    "ORIGINS": ["raw"],
    "END_POINTS": ["qc"],
    "RESULT_TYPES": [
        {"NAME": "raw", "FILES": {"read1": "fastq"}},
        {"NAME": "qc", "DEPENDENCIES": ["raw"], "FILES": {"report": "report"}}
    ]
}"#;

/// Engine that reports a fixed number of outstanding jobs on dry runs.
struct FakeEngine {
    outstanding: u64,
    calls: Mutex<Vec<Invocation>>,
}

impl FakeEngine {
    fn new(outstanding: u64) -> Self {
        Self {
            outstanding,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildEngine for FakeEngine {
    async fn execute(&self, invocation: &Invocation) -> Result<Report, EngineError> {
        self.calls.lock().unwrap().push(invocation.clone());
        let mut report = Report::default();
        if invocation.dryrun {
            report.plan.jobs.insert("qc".to_string(), self.outstanding);
        }
        Ok(report)
    }
}

fn install_pipeline(home: &ConfigHome) -> PathBuf {
    let dir = home.pipeline_dir("meta", "1.0");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("pipeline_definition.json"), DEFINITION).unwrap();
    std::fs::write(
        dir.join("qc.snkmk"),
        "rule qc:\n    input: lambda wc: config['origins']['raw'][wc.sample_name]['read1']\n    output: config['qc']['report']\n    shell: 'touch {output}'\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("snakemake_config.json"),
        r#"{"threads": "`echo 3`", "db": {"path": "/ref/db", "version": 2}}"#,
    )
    .unwrap();
    dir
}

async fn populated_repo(root: &Path, home: ConfigHome) -> Repository {
    let repo = Repository::init(root, home).await.unwrap();
    let catalog = repo.catalog().await.unwrap();
    repo.add_pipeline(&catalog, "meta", None, false).await.unwrap();

    for sample in ["s1", "s2", "s3"] {
        catalog.add_sample(sample, "metagenome").await.unwrap();
    }
    catalog
        .add_group("pair", &["s1".to_string(), "s2".to_string()])
        .await
        .unwrap();
    for sample in ["s1", "s2"] {
        let mut files = BTreeMap::new();
        files.insert(
            "read1".to_string(),
            FileRecord::from_path(format!("/raw/{sample}.fastq"), "fastq"),
        );
        catalog
            .register_result(&NewResult {
                owner: sample.to_string(),
                level: Level::Sample,
                result_type: "raw".to_string(),
                files,
            })
            .await
            .unwrap();
    }
    repo
}

#[tokio::test]
async fn test_run_writes_workflow_and_config() {
    let dir = tempfile::tempdir().unwrap();
    let home = ConfigHome::new(dir.path().join("home"));
    install_pipeline(&home);
    let repo = populated_repo(&dir.path().join("repo"), home).await;
    let catalog = repo.catalog().await.unwrap();
    let engine = FakeEngine::new(2);

    let instance = PipelineInstance::load(&repo, "meta", Some("1.0")).unwrap();
    let outcome = instance
        .run(&catalog, &engine, &RunRequest::new())
        .await
        .unwrap();

    assert!(outcome.engine_invoked);
    assert_eq!(outcome.outstanding(), 0);
    assert_eq!(
        outcome.final_targets,
        vec!["s1/s1.qc.flag.registered", "s2/s2.qc.flag.registered"]
    );
    assert_eq!(outcome.excluded.len(), 1);
    assert_eq!(outcome.excluded[0].entity, "s3");
    assert!(outcome.warnings.is_empty());

    let config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(repo.config_path("meta")).unwrap()).unwrap();
    assert_eq!(config["threads"], "3");
    assert_eq!(config["db"]["version"], "2");
    assert_eq!(config["origins"]["raw"]["s2"]["read1"], "/raw/s2.fastq");
    assert_eq!(config["groups"]["pair"], serde_json::json!(["s1", "s2"]));
    assert!(config["samples"].get("s3").is_none());

    let snakefile = std::fs::read_to_string(repo.snakefile_path("meta")).unwrap();
    assert!(snakefile.contains("qc.snkmk"));
    assert!(snakefile.contains("rule register_qc:"));

    let calls = engine.calls();
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].dryrun);
    assert_eq!(calls[0].workdir, repo.root());
    assert_eq!(calls[0].result_dir, repo.result_dir());
    assert_eq!(calls[0].snakefile, repo.snakefile_path("meta"));
}

#[tokio::test]
async fn test_dryrun_counts_without_writing_to_repo() {
    let dir = tempfile::tempdir().unwrap();
    let home = ConfigHome::new(dir.path().join("home"));
    install_pipeline(&home);
    let repo = populated_repo(&dir.path().join("repo"), home).await;
    let catalog = repo.catalog().await.unwrap();

    let instance = PipelineInstance::load(&repo, "meta", None).unwrap();
    let outcome = instance
        .run(&catalog, &FakeEngine::new(2), &RunRequest::new().with_dryrun(true))
        .await
        .unwrap();

    assert_eq!(outcome.outstanding(), 2);
    assert!(!repo.snakefile_path("meta").exists());
    assert!(!repo.config_path("meta").exists());
}

#[tokio::test]
async fn test_existing_markers_are_not_targets() {
    let dir = tempfile::tempdir().unwrap();
    let home = ConfigHome::new(dir.path().join("home"));
    install_pipeline(&home);
    let repo = populated_repo(&dir.path().join("repo"), home).await;
    let catalog = repo.catalog().await.unwrap();

    let marker_dir = repo.result_dir().join("s1");
    std::fs::create_dir_all(&marker_dir).unwrap();
    std::fs::write(marker_dir.join("s1.qc.flag.registered"), "").unwrap();

    let instance = PipelineInstance::load(&repo, "meta", None).unwrap();
    let outcome = instance
        .run(&catalog, &FakeEngine::new(1), &RunRequest::new().with_dryrun(true))
        .await
        .unwrap();
    assert_eq!(outcome.final_targets, vec!["s2/s2.qc.flag.registered"]);
}

#[tokio::test]
async fn test_daemon_cycle_runs_repo_with_work() {
    let dir = tempfile::tempdir().unwrap();
    let home = ConfigHome::new(dir.path().join("home"));
    install_pipeline(&home);
    let repo_root = dir.path().join("repo");
    populated_repo(&repo_root, home.clone()).await;

    let config = DaemonConfig::from_yaml_str(&format!(
        "repos:\n  - name: cohort\n    path: {}\n    pipelines:\n      - name: meta\n        version: 1.0\n  - name: missing\n    path: {}\n    pipelines:\n      - name: meta\n        version: 1.0\nnum_jobs: 6\n",
        repo_root.display(),
        dir.path().join("nowhere").display()
    ))
    .unwrap();

    let engine = Arc::new(FakeEngine::new(4));
    let runner = Arc::new(RepoRunner::new(home, engine.clone()));

    let snapshot = daemon::collect_status(&config, runner.clone(), 3).await;
    assert!(matches!(
        snapshot.report("missing").unwrap().status,
        RepoStatus::Failed(_)
    ));
    let counts: Vec<(&str, u64)> = snapshot.counts().map(|(r, c)| (r, c.outstanding)).collect();
    assert_eq!(counts, vec![("cohort", 4)]);

    match daemon::run_cycle(&config, runner).await {
        CycleOutcome::Advanced { candidate } => {
            assert_eq!(candidate.repo, "cohort");
            assert_eq!(candidate.version, "1.0");
        }
        other => panic!("expected a run, got {other:?}"),
    }

    let real: Vec<Invocation> = engine.calls().into_iter().filter(|c| !c.dryrun).collect();
    assert_eq!(real.len(), 1);
    assert_eq!(real[0].jobs, 3);
    assert!(real[0].cluster.is_none());
}

#[tokio::test]
async fn test_daemon_attaches_pipeline_on_first_use() {
    let dir = tempfile::tempdir().unwrap();
    let home = ConfigHome::new(dir.path().join("home"));
    install_pipeline(&home);
    let repo = Repository::init(&dir.path().join("repo"), home.clone())
        .await
        .unwrap();
    assert!(repo.pipelines().unwrap().is_empty());

    let config = DaemonConfig::from_yaml_str(&format!(
        "repos:\n  - name: fresh\n    path: {}\n    pipelines:\n      - {{name: meta, version: '1.0', tolerance: 3}}\n",
        repo.root().display()
    ))
    .unwrap();

    let runner = Arc::new(RepoRunner::new(home, Arc::new(FakeEngine::new(0))));
    assert_eq!(daemon::run_cycle(&config, runner).await, CycleOutcome::Idle);
    assert_eq!(repo.pipeline_version("meta").unwrap().as_deref(), Some("1.0"));
}
