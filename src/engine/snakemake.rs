//! Snakemake adapter.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{parse_run_plan, BuildEngine, Invocation, Report};
use crate::error::EngineError;

/// Runs the `snakemake` executable as a subprocess.
#[derive(Debug, Clone)]
pub struct Snakemake {
    program: String,
}

impl Snakemake {
    pub fn new() -> Self {
        Self {
            program: "snakemake".to_string(),
        }
    }

    /// Uses a specific executable instead of `snakemake` from `PATH`.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Command-line arguments for an invocation.
    pub fn args(invocation: &Invocation) -> Vec<String> {
        let mut args = vec![
            "--snakefile".to_string(),
            invocation.snakefile.to_string_lossy().into_owned(),
            "--configfile".to_string(),
            invocation.configfile.to_string_lossy().into_owned(),
            "--directory".to_string(),
            invocation.result_dir.to_string_lossy().into_owned(),
        ];

        match &invocation.cluster {
            Some(cluster) => {
                args.push("--jobs".to_string());
                args.push(invocation.jobs.to_string());
                args.push("--cluster".to_string());
                args.push(cluster.clone());
            }
            None => {
                args.push("--cores".to_string());
                args.push(invocation.jobs.to_string());
            }
        }

        args.extend(
            ["--keep-going", "--printshellcmds", "--rerun-incomplete"]
                .into_iter()
                .map(String::from),
        );
        if invocation.dryrun {
            args.push("--dryrun".to_string());
        }
        if invocation.unlock {
            args.push("--unlock".to_string());
        }
        args
    }
}

impl Default for Snakemake {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects a child output stream, forwarding each line to the log.
async fn drain<R>(reader: Option<R>, stream: &'static str, verbose: bool) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    let mut lines = BufReader::new(reader).lines();
    let mut content = String::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if verbose {
                    info!(target: "modflow::engine", stream, "{}", line);
                } else {
                    debug!(target: "modflow::engine", stream, "{}", line);
                }
                content.push_str(&line);
                content.push('\n');
            }
            Ok(None) => break,
            Err(e) => {
                warn!(stream, error = %e, "Error reading engine output");
                break;
            }
        }
    }
    content
}

#[async_trait]
impl BuildEngine for Snakemake {
    async fn execute(&self, invocation: &Invocation) -> Result<Report, EngineError> {
        let start = Instant::now();
        let args = Self::args(invocation);

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .current_dir(&invocation.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            program = %self.program,
            workdir = %invocation.workdir.display(),
            args = ?args,
            "Starting build engine"
        );

        let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let verbose = !invocation.dryrun;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (stdout, stderr, status) = tokio::join!(
            drain(stdout, "stdout", verbose),
            drain(stderr, "stderr", verbose),
            child.wait()
        );
        let status = status?;

        info!(
            dryrun = invocation.dryrun,
            duration_ms = start.elapsed().as_millis() as u64,
            code = ?status.code(),
            "Build engine finished"
        );

        if !status.success() {
            let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(EngineError::Failed {
                code: status.code(),
                stderr: tail.join("\n"),
            });
        }

        // Snakemake prints its job table to stderr; older releases used stdout.
        let mut plan = parse_run_plan(&stderr);
        if plan.jobs.is_empty() {
            plan = parse_run_plan(&stdout);
        }
        Ok(Report { plan })
    }
}
