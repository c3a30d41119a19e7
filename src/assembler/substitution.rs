//! Backtick command substitution in configuration values.
//!
//! Every backtick-delimited region of a string is run as a shell command and
//! replaced by its trimmed standard output. A failing command is replaced by
//! `""` and reported as a warning; assembly carries on.

use std::path::Path;
use std::process::Command;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::AssemblyError;

/// Replacement text for a command that failed.
pub const FAILED_SUBSTITUTION: &str = "\"\"";

/// A command substitution that fell back to the empty replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubstitutionWarning {
    /// Dotted path of the config value holding the command.
    pub key: String,
    pub command: String,
    pub message: String,
}

/// Runs `command` through `sh -c` in `cwd`, returning trimmed stdout.
pub fn run_shell(command: &str, cwd: &Path) -> Result<String, String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .output()
        .map_err(|e| format!("failed to start shell: {e}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "exited with {}: {}",
            output.status,
            stderr.trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Splices command output into every backtick region of `text`.
///
/// Returns the new text and the `(command, error)` pairs that failed. An
/// unterminated region is treated as a failed command.
pub fn splice<F>(text: &str, run: &mut F) -> (String, Vec<(String, String)>)
where
    F: FnMut(&str) -> Result<String, String>,
{
    let mut out = String::with_capacity(text.len());
    let mut failures = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find('`') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('`') {
            Some(close) => {
                let command = &after[..close];
                match run(command) {
                    Ok(stdout) => out.push_str(&stdout),
                    Err(message) => {
                        out.push_str(FAILED_SUBSTITUTION);
                        failures.push((command.to_string(), message));
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(FAILED_SUBSTITUTION);
                failures.push((after.to_string(), "unterminated backtick".to_string()));
                rest = "";
            }
        }
    }
    out.push_str(rest);
    (out, failures)
}

/// Resolves substitutions throughout a config tree.
///
/// Numbers and booleans are coerced to strings; `null` leaves are rejected.
pub fn resolve_tree<F>(
    value: Value,
    run: &mut F,
) -> Result<(Value, Vec<SubstitutionWarning>), AssemblyError>
where
    F: FnMut(&str) -> Result<String, String>,
{
    let mut warnings = Vec::new();
    let resolved = resolve_value(value, "", run, &mut warnings)?;
    Ok((resolved, warnings))
}

fn child_key(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn resolve_value<F>(
    value: Value,
    key: &str,
    run: &mut F,
    warnings: &mut Vec<SubstitutionWarning>,
) -> Result<Value, AssemblyError>
where
    F: FnMut(&str) -> Result<String, String>,
{
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                let resolved = resolve_value(v, &child_key(key, &k), run, warnings)?;
                out.insert(k, resolved);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, v)| resolve_value(v, &format!("{key}[{i}]"), run, warnings))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::String(s) => {
            if !s.contains('`') {
                return Ok(Value::String(s));
            }
            let (text, failures) = splice(&s, run);
            for (command, message) in failures {
                warn!(key = %key, command = %command, error = %message, "Command substitution failed");
                warnings.push(SubstitutionWarning {
                    key: key.to_string(),
                    command,
                    message,
                });
            }
            Ok(Value::String(text))
        }
        Value::Number(n) => Ok(Value::String(n.to_string())),
        Value::Bool(b) => Ok(Value::String(b.to_string())),
        Value::Null => Err(AssemblyError::UnsupportedLeaf {
            key: key.to_string(),
            kind: "null",
        }),
    }
}
