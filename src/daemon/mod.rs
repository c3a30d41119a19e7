//! Scheduling daemon.
//!
//! Each cycle is stateless: the status of every configured repository is
//! collected, one pipeline with more outstanding jobs than it tolerates is
//! picked at random, and that pipeline is run for real. Failures are logged
//! and the next cycle starts from scratch.

mod config;
mod status;

use std::path::Path;
use std::sync::Arc;

use rand::seq::IndexedRandom;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::DaemonError;

pub use config::{DaemonConfig, PipelineConfig, RepoConfig, DEFAULT_NUM_JOBS};
pub use status::{
    collect_status, request_for, PipelineCount, PipelineRunner, RepoReport, RepoRunner,
    RepoStatus, StatusSnapshot,
};

/// A pipeline in a repository that has work left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub repo: String,
    pub pipeline: String,
    pub version: String,
    pub outstanding: u64,
}

/// Pipelines whose outstanding job count exceeds their tolerance.
pub fn candidates(snapshot: &StatusSnapshot) -> Vec<Candidate> {
    snapshot
        .counts()
        .filter(|(_, count)| count.needs_run())
        .map(|(repo, count)| Candidate {
            repo: repo.to_string(),
            pipeline: count.name.clone(),
            version: count.version.clone(),
            outstanding: count.outstanding,
        })
        .collect()
}

/// Picks one candidate uniformly at random; `None` means idle.
pub fn select(snapshot: &StatusSnapshot) -> Option<Candidate> {
    candidates(snapshot).choose(&mut rand::rng()).cloned()
}

/// Job budget for one repository: the total split evenly, at least one.
pub fn job_budget(total: usize, repos: usize) -> usize {
    if repos == 0 {
        return total.max(1);
    }
    (total / repos).max(1)
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// No pipeline had more work than it tolerates.
    Idle,
    Advanced { candidate: Candidate },
    Failed { candidate: Candidate, error: String },
}

/// Runs one status, selection and run cycle.
pub async fn run_cycle(config: &DaemonConfig, runner: Arc<dyn PipelineRunner>) -> CycleOutcome {
    let cycle_id = Uuid::new_v4();
    let span = info_span!("cycle", id = %cycle_id);
    async move {
        let jobs = job_budget(config.num_jobs, config.repos.len());
        let snapshot = collect_status(config, Arc::clone(&runner), jobs).await;

        let Some(candidate) = select(&snapshot) else {
            info!(repos = snapshot.reports.len(), "Nothing to do");
            return CycleOutcome::Idle;
        };

        let Some((repo, pipeline)) = config.repo(&candidate.repo).and_then(|repo| {
            repo.pipelines
                .iter()
                .find(|p| p.name == candidate.pipeline)
                .map(|p| (repo, p))
        }) else {
            let error = format!("'{}' is no longer configured", candidate.repo);
            warn!(repo = %candidate.repo, "{}", error);
            return CycleOutcome::Failed { candidate, error };
        };

        info!(
            repo = %candidate.repo,
            pipeline = %candidate.pipeline,
            version = %candidate.version,
            outstanding = candidate.outstanding,
            jobs,
            "Running pipeline"
        );
        match runner.run(repo, pipeline, request_for(config, pipeline, jobs)).await {
            Ok(outcome) => {
                info!(
                    repo = %candidate.repo,
                    pipeline = %candidate.pipeline,
                    targets = outcome.final_targets.len(),
                    "Pipeline run finished"
                );
                CycleOutcome::Advanced { candidate }
            }
            Err(e) => {
                error!(
                    repo = %candidate.repo,
                    pipeline = %candidate.pipeline,
                    error = %e,
                    "Pipeline run failed"
                );
                CycleOutcome::Failed {
                    candidate,
                    error: e.to_string(),
                }
            }
        }
    }
    .instrument(span)
    .await
}

/// Runs cycles until interrupted, reloading the config before each one.
pub async fn serve(config_path: &Path, runner: Arc<dyn PipelineRunner>) -> Result<(), DaemonError> {
    let mut config = DaemonConfig::load(config_path)?;
    info!(
        config = %config_path.display(),
        repos = config.repos.len(),
        interval_secs = config.interval_secs,
        "Daemon started"
    );

    loop {
        run_cycle(&config, Arc::clone(&runner)).await;

        tokio::select! {
            _ = tokio::time::sleep(config.interval()) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Daemon stopping");
                return Ok(());
            }
        }

        match DaemonConfig::load(config_path) {
            Ok(reloaded) => config = reloaded,
            Err(e) => warn!(error = %e, "Keeping previous daemon config"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::status::tests::{repo, FakeRunner};
    use super::*;

    fn snapshot(entries: &[(&str, u64, u64)]) -> StatusSnapshot {
        StatusSnapshot {
            reports: entries
                .iter()
                .map(|(repo, outstanding, tolerance)| RepoReport {
                    repo: repo.to_string(),
                    status: RepoStatus::Ready(vec![PipelineCount {
                        name: "meta".to_string(),
                        version: "1.0".to_string(),
                        outstanding: *outstanding,
                        tolerance: *tolerance,
                    }]),
                })
                .collect(),
        }
    }

    #[test]
    fn test_single_candidate_is_selected() {
        let selected = select(&snapshot(&[("r1", 3, 0)])).unwrap();
        assert_eq!(selected.repo, "r1");
        assert_eq!(selected.outstanding, 3);
    }

    #[test]
    fn test_within_tolerance_idles() {
        assert!(select(&snapshot(&[("r1", 2, 5)])).is_none());
        assert!(select(&snapshot(&[("r1", 5, 5), ("r2", 0, 0)])).is_none());
        assert!(select(&StatusSnapshot::default()).is_none());
    }

    #[test]
    fn test_selection_only_among_candidates() {
        let snapshot = snapshot(&[("r1", 1, 4), ("r2", 7, 0), ("r3", 0, 0)]);
        assert_eq!(candidates(&snapshot).len(), 1);
        for _ in 0..20 {
            assert_eq!(select(&snapshot).unwrap().repo, "r2");
        }
    }

    #[test]
    fn test_failed_and_timed_out_repos_are_never_selected() {
        let snapshot = StatusSnapshot {
            reports: vec![
                RepoReport {
                    repo: "r1".to_string(),
                    status: RepoStatus::TimedOut,
                },
                RepoReport {
                    repo: "r2".to_string(),
                    status: RepoStatus::Failed("boom".to_string()),
                },
            ],
        };
        assert!(select(&snapshot).is_none());
    }

    #[test]
    fn test_job_budget() {
        assert_eq!(job_budget(10, 2), 5);
        assert_eq!(job_budget(10, 3), 3);
        assert_eq!(job_budget(1, 4), 1);
        assert_eq!(job_budget(8, 0), 8);
    }

    #[tokio::test]
    async fn test_cycle_runs_selected_pipeline() {
        let runner = Arc::new(FakeRunner::default().with_count("r1", 3));
        let config = DaemonConfig {
            repos: vec![repo("r1", 0), repo("r2", 0)],
            num_jobs: 10,
            ..DaemonConfig::default()
        };

        let outcome = run_cycle(&config, runner.clone()).await;
        match outcome {
            CycleOutcome::Advanced { candidate } => assert_eq!(candidate.repo, "r1"),
            other => panic!("expected a run, got {other:?}"),
        }

        let calls = runner.calls.lock().unwrap();
        let real: Vec<_> = calls.iter().filter(|(_, _, r)| !r.dryrun).collect();
        assert_eq!(real.len(), 1);
        assert_eq!(real[0].0, "r1");
        assert_eq!(real[0].2.jobs, 5);
        assert!(real[0].2.local);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_status_is_not_selected() {
        let mut runner = FakeRunner::default().with_count("r1", 5);
        runner
            .delays
            .insert("r1".to_string(), std::time::Duration::from_secs(2));
        let runner = Arc::new(runner);
        let config = DaemonConfig {
            repos: vec![repo("r1", 0), repo("r2", 0)],
            status_timeout_secs: 1,
            ..DaemonConfig::default()
        };

        assert_eq!(run_cycle(&config, runner.clone()).await, CycleOutcome::Idle);
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        assert!(runner.calls.lock().unwrap().iter().all(|(_, _, r)| r.dryrun));
    }

    #[tokio::test]
    async fn test_cycle_idles_without_work() {
        let runner = Arc::new(FakeRunner::default().with_count("r1", 2));
        let config = DaemonConfig {
            repos: vec![repo("r1", 5)],
            ..DaemonConfig::default()
        };
        assert_eq!(run_cycle(&config, runner.clone()).await, CycleOutcome::Idle);
        assert!(runner.calls.lock().unwrap().iter().all(|(_, _, r)| r.dryrun));
    }
}
