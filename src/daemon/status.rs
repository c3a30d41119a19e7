//! Status phase: how much work each repository has left.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::config::{DaemonConfig, PipelineConfig, RepoConfig};
use crate::engine::BuildEngine;
use crate::error::DaemonError;
use crate::home::ConfigHome;
use crate::instance::{PipelineInstance, RunOutcome, RunRequest};
use crate::repo::Repository;

/// Runs a pipeline on behalf of the daemon.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn run(
        &self,
        repo: &RepoConfig,
        pipeline: &PipelineConfig,
        request: RunRequest,
    ) -> Result<RunOutcome, DaemonError>;
}

/// Runs pipelines in real repositories with a build engine.
///
/// A pipeline that is not yet attached to the repository is attached at the
/// configured version on first use.
pub struct RepoRunner {
    home: ConfigHome,
    engine: Arc<dyn BuildEngine>,
}

impl RepoRunner {
    pub fn new(home: ConfigHome, engine: Arc<dyn BuildEngine>) -> Self {
        Self { home, engine }
    }
}

#[async_trait]
impl PipelineRunner for RepoRunner {
    async fn run(
        &self,
        repo: &RepoConfig,
        pipeline: &PipelineConfig,
        request: RunRequest,
    ) -> Result<RunOutcome, DaemonError> {
        let repository = Repository::open(&repo.path, self.home.clone())?;
        let catalog = repository.catalog().await?;
        repository
            .ensure_pipeline(&catalog, &pipeline.name, &pipeline.version)
            .await?;

        let instance = PipelineInstance::load(&repository, &pipeline.name, Some(&pipeline.version))?;
        Ok(instance.run(&catalog, self.engine.as_ref(), &request).await?)
    }
}

/// Builds the run request the daemon uses for a configured pipeline.
pub fn request_for(config: &DaemonConfig, pipeline: &PipelineConfig, jobs: usize) -> RunRequest {
    let mut request = RunRequest::new()
        .excluding(pipeline.exclude_endpoints.iter().cloned())
        .with_local(config.run_locally())
        .with_jobs(jobs)
        .with_overlay(config.overlay_for(pipeline));
    if let Some(endpoints) = &pipeline.endpoints {
        request = request.with_endpoints(endpoints.iter().cloned());
    }
    request
}

/// Outstanding work for one pipeline version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineCount {
    pub name: String,
    pub version: String,
    pub outstanding: u64,
    pub tolerance: u64,
}

impl PipelineCount {
    pub fn needs_run(&self) -> bool {
        self.outstanding > self.tolerance
    }
}

/// Result of checking one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum RepoStatus {
    Ready(Vec<PipelineCount>),
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoReport {
    pub repo: String,
    pub status: RepoStatus,
}

/// Status of every configured repository for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub reports: Vec<RepoReport>,
}

impl StatusSnapshot {
    /// Counts of the repositories that reported in time.
    pub fn counts(&self) -> impl Iterator<Item = (&str, &PipelineCount)> {
        self.reports.iter().flat_map(|report| {
            let counts: &[PipelineCount] = match &report.status {
                RepoStatus::Ready(counts) => counts,
                _ => &[],
            };
            counts.iter().map(move |c| (report.repo.as_str(), c))
        })
    }

    pub fn report(&self, repo: &str) -> Option<&RepoReport> {
        self.reports.iter().find(|r| r.repo == repo)
    }
}

/// Dry-runs every pipeline of one repository, one after another.
async fn check_repo(
    runner: &dyn PipelineRunner,
    repo: &RepoConfig,
    requests: &[(PipelineConfig, RunRequest)],
) -> Result<Vec<PipelineCount>, DaemonError> {
    let mut counts = Vec::with_capacity(requests.len());
    for (pipeline, request) in requests {
        let outcome = runner
            .run(repo, pipeline, request.clone().with_dryrun(true))
            .await?;
        debug!(
            repo = %repo.name,
            pipeline = %pipeline.name,
            version = %pipeline.version,
            outstanding = outcome.outstanding(),
            "Checked pipeline"
        );
        counts.push(PipelineCount {
            name: pipeline.name.clone(),
            version: pipeline.version.clone(),
            outstanding: outcome.outstanding(),
            tolerance: pipeline.tolerance,
        });
    }
    Ok(counts)
}

/// Checks all repositories concurrently.
///
/// At most `num_jobs` checks run at once and each is bounded by the status
/// timeout. A repository that fails or times out reports no counts.
pub async fn collect_status(
    config: &DaemonConfig,
    runner: Arc<dyn PipelineRunner>,
    jobs: usize,
) -> StatusSnapshot {
    collect_status_with_timeout(config, runner, jobs, config.status_timeout()).await
}

pub(crate) async fn collect_status_with_timeout(
    config: &DaemonConfig,
    runner: Arc<dyn PipelineRunner>,
    jobs: usize,
    timeout: Duration,
) -> StatusSnapshot {
    let semaphore = Arc::new(Semaphore::new(config.num_jobs));
    let mut tasks = JoinSet::new();

    for repo in config.repos.iter().cloned() {
        let requests: Vec<(PipelineConfig, RunRequest)> = repo
            .pipelines
            .iter()
            .map(|p| (p.clone(), request_for(config, p, jobs)))
            .collect();
        let runner = Arc::clone(&runner);
        let semaphore = Arc::clone(&semaphore);

        tasks.spawn(async move {
            let start = Instant::now();
            // The deadline covers waiting for a slot as well as the check.
            let checked = tokio::time::timeout(timeout, async {
                let _permit = semaphore.acquire_owned().await.ok();
                check_repo(runner.as_ref(), &repo, &requests).await
            })
            .await;
            let status = match checked {
                Ok(Ok(counts)) => RepoStatus::Ready(counts),
                Ok(Err(e)) => {
                    warn!(repo = %repo.name, error = %e, "Repository check failed");
                    RepoStatus::Failed(e.to_string())
                }
                Err(_) => {
                    warn!(
                        repo = %repo.name,
                        timeout_secs = timeout.as_secs_f64(),
                        "Repository check timed out"
                    );
                    RepoStatus::TimedOut
                }
            };
            debug!(
                repo = %repo.name,
                duration_ms = start.elapsed().as_millis() as u64,
                "Repository check finished"
            );
            RepoReport {
                repo: repo.name,
                status,
            }
        });
    }

    let mut reports = Vec::with_capacity(config.repos.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => warn!(error = %e, "Repository check task panicked"),
        }
    }

    let order = |name: &str| config.repos.iter().position(|r| r.name == name);
    reports.sort_by_key(|r| order(&r.repo));
    StatusSnapshot { reports }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::Report;
    use crate::error::RepoError;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Runner returning canned counts per repository.
    #[derive(Default)]
    pub(crate) struct FakeRunner {
        pub counts: BTreeMap<String, u64>,
        pub failing: Vec<String>,
        pub hanging: Vec<String>,
        pub delays: BTreeMap<String, Duration>,
        pub calls: Mutex<Vec<(String, String, RunRequest)>>,
    }

    impl FakeRunner {
        pub(crate) fn with_count(mut self, repo: &str, count: u64) -> Self {
            self.counts.insert(repo.to_string(), count);
            self
        }
    }

    #[async_trait]
    impl PipelineRunner for FakeRunner {
        async fn run(
            &self,
            repo: &RepoConfig,
            pipeline: &PipelineConfig,
            request: RunRequest,
        ) -> Result<RunOutcome, DaemonError> {
            self.calls
                .lock()
                .unwrap()
                .push((repo.name.clone(), pipeline.name.clone(), request));
            if self.hanging.contains(&repo.name) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if let Some(delay) = self.delays.get(&repo.name) {
                tokio::time::sleep(*delay).await;
            }
            if self.failing.contains(&repo.name) {
                return Err(RepoError::NotFound(repo.path.clone()).into());
            }
            let mut report = Report::default();
            let count = self.counts.get(&repo.name).copied().unwrap_or(0);
            if count > 0 {
                report.plan.jobs.insert("qc".to_string(), count);
            }
            Ok(RunOutcome {
                pipeline: pipeline.name.clone(),
                version: pipeline.version.clone(),
                engine_invoked: true,
                report,
                ..RunOutcome::default()
            })
        }
    }

    pub(crate) fn repo(name: &str, tolerance: u64) -> RepoConfig {
        RepoConfig {
            name: name.to_string(),
            path: PathBuf::from(format!("/data/{name}")),
            pipelines: vec![PipelineConfig {
                name: "meta".to_string(),
                version: "1.0".to_string(),
                tolerance,
                endpoints: None,
                exclude_endpoints: vec!["binning".to_string()],
                config: None,
            }],
        }
    }

    fn config(repos: Vec<RepoConfig>) -> DaemonConfig {
        DaemonConfig {
            repos,
            ..DaemonConfig::default()
        }
    }

    #[tokio::test]
    async fn test_status_counts_with_dryrun() {
        let runner = Arc::new(FakeRunner::default().with_count("r1", 3));
        let config = config(vec![repo("r1", 0), repo("r2", 0)]);
        let snapshot = collect_status(&config, runner.clone(), 5).await;

        assert_eq!(snapshot.reports.len(), 2);
        assert_eq!(snapshot.reports[0].repo, "r1");
        let counts: Vec<(&str, u64)> = snapshot.counts().map(|(r, c)| (r, c.outstanding)).collect();
        assert_eq!(counts, vec![("r1", 3), ("r2", 0)]);

        let calls = runner.calls.lock().unwrap();
        assert!(calls.iter().all(|(_, _, request)| request.dryrun && request.jobs == 5));
        assert!(calls[0].2.excluded.contains("binning"));
    }

    #[tokio::test]
    async fn test_failed_repo_is_isolated() {
        let mut runner = FakeRunner::default().with_count("r2", 4);
        runner.failing.push("r1".to_string());
        let config = config(vec![repo("r1", 0), repo("r2", 0)]);
        let snapshot = collect_status(&config, Arc::new(runner), 1).await;

        assert!(matches!(
            snapshot.report("r1").unwrap().status,
            RepoStatus::Failed(_)
        ));
        let counts: Vec<&str> = snapshot.counts().map(|(r, _)| r).collect();
        assert_eq!(counts, vec!["r2"]);
    }

    #[tokio::test]
    async fn test_timed_out_repo_is_absent() {
        let mut runner = FakeRunner::default().with_count("r2", 1);
        runner.hanging.push("r1".to_string());
        let config = config(vec![repo("r1", 0), repo("r2", 0)]);
        let snapshot =
            collect_status_with_timeout(&config, Arc::new(runner), 1, Duration::from_millis(100))
                .await;

        assert_eq!(snapshot.report("r1").unwrap().status, RepoStatus::TimedOut);
        assert!(snapshot.counts().all(|(r, _)| r != "r1"));
        assert!(snapshot.report("r2").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_for_a_slot_counts_against_the_timeout() {
        let mut runner = FakeRunner::default().with_count("r2", 1);
        runner.hanging.push("r1".to_string());
        runner
            .delays
            .insert("r2".to_string(), Duration::from_millis(150));
        let mut config = config(vec![repo("r1", 0), repo("r2", 0)]);
        config.num_jobs = 1;

        let timeout = Duration::from_millis(100);
        let start = tokio::time::Instant::now();
        let snapshot = collect_status_with_timeout(&config, Arc::new(runner), 1, timeout).await;

        assert!(start.elapsed() < timeout * 3 / 2);
        assert_eq!(snapshot.report("r1").unwrap().status, RepoStatus::TimedOut);
        assert_eq!(snapshot.report("r2").unwrap().status, RepoStatus::TimedOut);
        assert_eq!(snapshot.counts().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_repo_finishes_when_slot_frees_in_time() {
        let mut runner = FakeRunner::default().with_count("r1", 2).with_count("r2", 5);
        runner
            .delays
            .insert("r1".to_string(), Duration::from_millis(20));
        runner
            .delays
            .insert("r2".to_string(), Duration::from_millis(20));
        let mut config = config(vec![repo("r1", 0), repo("r2", 0)]);
        config.num_jobs = 1;

        let snapshot =
            collect_status_with_timeout(&config, Arc::new(runner), 1, Duration::from_millis(100))
                .await;
        let counts: Vec<(&str, u64)> = snapshot.counts().map(|(r, c)| (r, c.outstanding)).collect();
        assert_eq!(counts, vec![("r1", 2), ("r2", 5)]);
    }

    #[test]
    fn test_request_for_uses_daemon_settings() {
        let mut config = config(vec![]);
        config.run_on_cluster = true;
        config
            .pipeline_configs
            .insert("meta::1.0".to_string(), PathBuf::from("/etc/meta.yml"));
        let pipeline = &repo("r1", 0).pipelines[0];

        let request = request_for(&config, pipeline, 4);
        assert!(!request.local);
        assert!(!request.dryrun);
        assert_eq!(request.jobs, 4);
        assert_eq!(request.config_overlay, Some(PathBuf::from("/etc/meta.yml")));
        assert!(request.endpoints.is_none());
    }
}
