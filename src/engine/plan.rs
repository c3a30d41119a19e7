//! Parsing of the job table Snakemake prints before executing.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// Pseudo-rules that do not represent real work.
const IGNORED_RULES: [&str; 2] = ["all", "total"];

/// Remaining jobs per rule, as reported by a dry run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunPlan {
    pub jobs: BTreeMap<String, u64>,
}

impl RunPlan {
    /// Total outstanding jobs.
    pub fn outstanding(&self) -> u64 {
        self.jobs.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding() == 0
    }
}

fn legacy_row() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d+)\s+([A-Za-z_][\w.]*)\s*$").expect("valid regex"))
}

fn stats_row() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][\w.]*)\s+(\d+)(?:\s+\d+)*\s*$").expect("valid regex")
    })
}

#[derive(Clone, Copy)]
enum Table {
    /// `Job counts:` with `count jobs` columns.
    Counts,
    /// `Job stats:` with `job count ...` columns.
    Stats,
}

/// Parses the first job table in engine output.
///
/// Output without a table means there is nothing to do.
pub fn parse_run_plan(output: &str) -> RunPlan {
    let mut plan = RunPlan::default();
    let mut lines = output.lines();

    let table = loop {
        match lines.next() {
            None => return plan,
            Some(line) => match line.trim() {
                "Job counts:" => break Table::Counts,
                "Job stats:" => break Table::Stats,
                _ => {}
            },
        }
    };

    let mut seen_row = false;
    for line in lines {
        if line.trim().is_empty() {
            if seen_row {
                break;
            }
            continue;
        }

        let captures = match table {
            Table::Counts => legacy_row()
                .captures(line)
                .map(|c| (c[2].to_string(), c[1].to_string())),
            Table::Stats => stats_row()
                .captures(line)
                .map(|c| (c[1].to_string(), c[2].to_string())),
        };

        match captures {
            Some((rule, count)) => {
                seen_row = true;
                if IGNORED_RULES.contains(&rule.as_str()) {
                    continue;
                }
                if let Ok(count) = count.parse::<u64>() {
                    *plan.jobs.entry(rule).or_insert(0) += count;
                }
            }
            // Header, separator or total-only line.
            None if !seen_row => continue,
            None => {
                let trimmed = line.trim();
                if trimmed.chars().all(|c| c.is_ascii_digit()) {
                    continue;
                }
                break;
            }
        }
    }

    plan
}
