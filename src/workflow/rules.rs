//! Structured rule descriptors and their Snakefile serialization.

use std::fmt::{self, Write as _};
use std::sync::OnceLock;

use regex::Regex;

/// A value written into a rule: either a string literal or a raw expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Literal(String),
    Expr(String),
}

impl Term {
    pub fn literal(s: impl Into<String>) -> Self {
        Term::Literal(s.into())
    }

    pub fn expr(s: impl Into<String>) -> Self {
        Term::Expr(s.into())
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Expr(e) => f.write_str(e),
            Term::Literal(s) => {
                f.write_char('"')?;
                for c in s.chars() {
                    match c {
                        '\\' => f.write_str("\\\\")?,
                        '"' => f.write_str("\\\"")?,
                        '\n' => f.write_str("\\n")?,
                        c => f.write_char(c)?,
                    }
                }
                f.write_char('"')
            }
        }
    }
}

/// One build rule.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuleDescriptor {
    pub name: String,
    /// Named inputs; an empty name is positional.
    pub inputs: Vec<(String, Term)>,
    pub outputs: Vec<Term>,
    pub shell: Option<Term>,
}

impl RuleDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn input(mut self, name: impl Into<String>, value: Term) -> Self {
        self.inputs.push((name.into(), value));
        self
    }

    pub fn output(mut self, value: Term) -> Self {
        self.outputs.push(value);
        self
    }

    pub fn shell(mut self, command: impl Into<String>) -> Self {
        self.shell = Some(Term::Literal(command.into()));
        self
    }
}

/// A top-level statement of a generated Snakefile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `wildcard_constraints:` with (wildcard, regex) pairs.
    WildcardConstraints(Vec<(String, String)>),
    Include(String),
    Rule(RuleDescriptor),
    /// Re-declares `rule` as `alias` with a benchmark file.
    Benchmark {
        rule: String,
        alias: String,
        benchmark: String,
    },
    /// `ruleorder: a > b`.
    RuleOrder(Vec<String>),
}

/// An ordered list of directives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snakefile {
    pub directives: Vec<Directive>,
}

impl Snakefile {
    pub fn push(&mut self, directive: Directive) {
        self.directives.push(directive);
    }

    pub fn rules(&self) -> impl Iterator<Item = &RuleDescriptor> {
        self.directives.iter().filter_map(|d| match d {
            Directive::Rule(rule) => Some(rule),
            _ => None,
        })
    }

    pub fn includes(&self) -> impl Iterator<Item = &str> {
        self.directives.iter().filter_map(|d| match d {
            Directive::Include(path) => Some(path.as_str()),
            _ => None,
        })
    }
}

const INDENT: &str = "    ";

fn write_section(f: &mut fmt::Formatter<'_>, label: &str, terms: &[(String, Term)]) -> fmt::Result {
    if terms.is_empty() {
        return Ok(());
    }
    if let [(name, term)] = terms {
        if name.is_empty() {
            return writeln!(f, "{INDENT}{label}: {term}");
        }
    }
    writeln!(f, "{INDENT}{label}:")?;
    for (name, term) in terms {
        if name.is_empty() {
            writeln!(f, "{INDENT}{INDENT}{term},")?;
        } else {
            writeln!(f, "{INDENT}{INDENT}{name}={term},")?;
        }
    }
    Ok(())
}

impl fmt::Display for RuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "rule {}:", self.name)?;
        write_section(f, "input", &self.inputs)?;
        let outputs: Vec<_> = self
            .outputs
            .iter()
            .map(|t| (String::new(), t.clone()))
            .collect();
        write_section(f, "output", &outputs)?;
        if let Some(shell) = &self.shell {
            writeln!(f, "{INDENT}shell:")?;
            writeln!(f, "{INDENT}{INDENT}{shell}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::WildcardConstraints(pairs) => {
                writeln!(f, "wildcard_constraints:")?;
                for (wildcard, regex) in pairs {
                    writeln!(f, "{INDENT}{wildcard}={},", Term::literal(regex.as_str()))?;
                }
                Ok(())
            }
            Directive::Include(path) => writeln!(f, "include: {}", Term::literal(path.as_str())),
            Directive::Rule(rule) => write!(f, "{rule}"),
            Directive::Benchmark {
                rule,
                alias,
                benchmark,
            } => {
                writeln!(f, "use rule {rule} as {alias} with:")?;
                writeln!(f, "{INDENT}benchmark:")?;
                writeln!(f, "{INDENT}{INDENT}{}", Term::literal(benchmark.as_str()))
            }
            Directive::RuleOrder(order) => writeln!(f, "ruleorder: {}", order.join(" > ")),
        }
    }
}

impl fmt::Display for Snakefile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# Generated by modflow. Do not edit.")?;
        for directive in &self.directives {
            writeln!(f)?;
            write!(f, "{directive}")?;
        }
        Ok(())
    }
}

/// Quotes a value for a POSIX shell if it needs quoting.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@+,%".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

/// Doubles braces so Snakemake's shell formatting leaves them alone.
pub fn escape_braces(value: &str) -> String {
    value.replace('{', "{{").replace('}', "}}")
}

fn non_identifier_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_]").expect("valid regex"))
}

/// Turns an arbitrary name into a valid rule identifier.
pub fn rule_identifier(name: &str) -> String {
    let mut ident = non_identifier_chars().replace_all(name, "_").into_owned();
    if ident.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    ident
}
