//! Workflow emission.
//!
//! Turns a resolved endpoint set and the eligible samples and groups into the
//! concrete targets the build engine must produce and the generated rule file
//! that includes each module's rules and registers finished results back into
//! the catalog.

pub mod pattern;
pub mod rules;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tracing::debug;

use crate::definition::{Level, ResultSchema};
use crate::eligibility::Eligible;
use crate::error::{DefinitionError, RunError};
use crate::resolver::ResolvedEndpoints;

pub use rules::{Directive, RuleDescriptor, Snakefile, Term};

/// Regex every sample and group name must match inside the engine.
pub const ENTITY_NAME_REGEX: &str = "[a-zA-Z0-9_-]+";

/// Extension of a module's rule file.
pub const MODULE_RULES_EXTENSION: &str = "snkmk";

/// Inputs to [`emit`].
#[derive(Debug, Clone, Copy)]
pub struct EmitContext<'a> {
    pub resolved: &'a ResolvedEndpoints,
    pub eligible: &'a Eligible,
    /// File type name -> extension.
    pub extensions: &'a BTreeMap<String, String>,
    /// Directory holding `<module>.snkmk` files.
    pub rules_dir: &'a Path,
    /// Directory targets are relative to; existing targets are dropped.
    pub result_dir: &'a Path,
    /// Repository root handed to the registration command.
    pub repo_root: &'a Path,
    /// Executable invoked by registration rules.
    pub registrar: &'a Path,
    /// Benchmark every module, not only those that ask for it.
    pub benchmark_all: bool,
}

/// Everything a run hands to the build engine.
#[derive(Debug, Clone, Default)]
pub struct BuildPlan {
    /// Files still to be produced, relative to the result directory.
    pub final_targets: Vec<String>,
    /// Module -> file role -> path pattern.
    pub module_patterns: BTreeMap<String, BTreeMap<String, String>>,
    pub snakefile: Snakefile,
}

impl BuildPlan {
    pub fn is_empty(&self) -> bool {
        self.final_targets.is_empty()
    }
}

/// Path of a module's rule file.
pub fn module_rules_path(rules_dir: &Path, module: &str) -> std::path::PathBuf {
    rules_dir.join(format!("{module}.{MODULE_RULES_EXTENSION}"))
}

/// Entity names a schema's patterns are expanded over.
fn entities<'a>(schema: &ResultSchema, eligible: &'a Eligible) -> Vec<&'a str> {
    match schema.level {
        Level::Sample => eligible.samples.iter().map(|s| s.name.as_str()).collect(),
        Level::Group => eligible.groups.iter().map(|g| g.name.as_str()).collect(),
    }
}

/// Patterns whose expansion marks a schema as finished.
fn target_patterns(
    schema: &ResultSchema,
    extensions: &BTreeMap<String, String>,
) -> Result<Vec<String>, RunError> {
    if schema.registers() {
        Ok(vec![pattern::marker_pattern(schema)])
    } else {
        Ok(pattern::role_patterns(schema, extensions)?
            .into_values()
            .collect())
    }
}

/// Builds the registration rule for one schema.
fn register_rule(
    schema: &ResultSchema,
    extensions: &BTreeMap<String, String>,
    ctx: &EmitContext<'_>,
) -> Result<RuleDescriptor, RunError> {
    let wildcard = schema.level.wildcard();
    let patterns = pattern::role_patterns(schema, extensions)?;

    let mut command = format!(
        "{} register --root {} --level {} --entity {{wildcards.{wildcard}}} --schema {}",
        rules::escape_braces(&rules::shell_quote(&ctx.registrar.to_string_lossy())),
        rules::escape_braces(&rules::shell_quote(&ctx.repo_root.to_string_lossy())),
        schema.level.as_str().to_lowercase(),
        rules::escape_braces(&rules::shell_quote(&schema.name)),
    );

    let mut rule = RuleDescriptor::new(format!(
        "register_{}",
        rules::rule_identifier(&schema.name)
    ));
    let mut idents: BTreeMap<String, String> = BTreeMap::new();
    for (role, pattern) in patterns {
        let file_type = &schema.files[&role];
        let ident = rules::rule_identifier(&role);
        if let Some(first) = idents.insert(ident.clone(), role.clone()) {
            return Err(DefinitionError::IdentifierCollision {
                first,
                second: role,
                identifier: ident,
            }
            .into());
        }
        command.push_str(&format!(
            " --file {}={{input.{ident}}}",
            rules::escape_braces(&rules::shell_quote(&format!("{role}:{file_type}")))
        ));
        rule = rule.input(ident, Term::literal(pattern));
    }
    command.push_str(" && touch {output}");

    Ok(rule
        .output(Term::literal(pattern::marker_pattern(schema)))
        .shell(command))
}

/// Emits final targets and the generated rule file for one run.
pub fn emit(ctx: &EmitContext<'_>) -> Result<BuildPlan, RunError> {
    let mut plan = BuildPlan::default();

    for schema in ctx.resolved.iter() {
        let patterns = pattern::role_patterns(schema, ctx.extensions)?;
        plan.module_patterns
            .entry(schema.module.clone())
            .or_default()
            .extend(patterns);
    }

    for schema in ctx.resolved.buildable() {
        let names = entities(schema, ctx.eligible);
        for target_pattern in target_patterns(schema, ctx.extensions)? {
            for entity in &names {
                let target = pattern::expand(&target_pattern, schema.level, entity);
                if ctx.result_dir.join(&target).exists() {
                    continue;
                }
                plan.final_targets.push(target);
            }
        }
    }

    let snakefile = &mut plan.snakefile;
    snakefile.push(Directive::WildcardConstraints(vec![
        (Level::Sample.wildcard().to_string(), ENTITY_NAME_REGEX.to_string()),
        (Level::Group.wildcard().to_string(), ENTITY_NAME_REGEX.to_string()),
    ]));
    snakefile.push(Directive::Rule(
        RuleDescriptor::new("all").input("", Term::expr("config[\"final_inputs\"]")),
    ));

    let mut included = BTreeSet::new();
    let mut benchmarked = BTreeSet::new();
    let mut registered: BTreeMap<String, String> = BTreeMap::new();
    for schema in ctx.resolved.buildable() {
        if included.insert(schema.module.clone()) {
            let path = module_rules_path(ctx.rules_dir, &schema.module);
            snakefile.push(Directive::Include(path.to_string_lossy().into_owned()));
        }

        if (schema.benchmarked || ctx.benchmark_all) && benchmarked.insert(schema.module.clone()) {
            let alias = format!("{}_benchmarked", schema.module);
            snakefile.push(Directive::Benchmark {
                rule: schema.module.clone(),
                alias: alias.clone(),
                benchmark: format!(
                    "benchmarks/{}/{{{}}}.tsv",
                    schema.module,
                    schema.level.wildcard()
                ),
            });
            snakefile.push(Directive::RuleOrder(vec![alias, schema.module.clone()]));
        }

        if schema.registers() {
            let rule = register_rule(schema, ctx.extensions, ctx)?;
            if let Some(first) = registered.insert(rule.name.clone(), schema.name.clone()) {
                return Err(DefinitionError::IdentifierCollision {
                    first,
                    second: schema.name.clone(),
                    identifier: rule.name,
                }
                .into());
            }
            snakefile.push(Directive::Rule(rule));
        }
    }

    debug!(
        schemas = ctx.resolved.len(),
        targets = plan.final_targets.len(),
        modules = included.len(),
        "Emitted workflow"
    );
    Ok(plan)
}
