//! Output path patterns.
//!
//! Every file a module produces lives at
//! `{<wildcard>}/{<wildcard>}.<module>.<role>.<ext>` relative to the result
//! directory, where the wildcard is `sample_name` or `group_name` depending
//! on the schema level. Completion markers use the schema name in place of
//! the module so schemas sharing a module never share a marker.

use std::collections::BTreeMap;

use crate::definition::{Level, ResultSchema, FLAG_EXTENSION, FLAG_ROLE};
use crate::error::RunError;

/// Pattern for one file role of a schema.
pub fn file_pattern(schema: &ResultSchema, role: &str, extension: &str) -> String {
    let wildcard = schema.level.wildcard();
    format!(
        "{{{wildcard}}}/{{{wildcard}}}.{}.{}.{}",
        schema.module, role, extension
    )
}

/// Pattern of the completion marker written once a result is registered.
pub fn marker_pattern(schema: &ResultSchema) -> String {
    let wildcard = schema.level.wildcard();
    format!(
        "{{{wildcard}}}/{{{wildcard}}}.{}.{FLAG_ROLE}.{FLAG_EXTENSION}",
        schema.name
    )
}

/// Substitutes an entity name into a pattern.
pub fn expand(pattern: &str, level: Level, entity: &str) -> String {
    pattern.replace(&format!("{{{}}}", level.wildcard()), entity)
}

/// Role -> pattern for every declared file of a schema.
///
/// Origin schemas are built elsewhere, so their roles map to `""`.
pub fn role_patterns(
    schema: &ResultSchema,
    extensions: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, RunError> {
    schema
        .files
        .iter()
        .map(|(role, file_type)| {
            if schema.is_origin {
                return Ok((role.clone(), String::new()));
            }
            let ext = extensions
                .get(file_type)
                .ok_or_else(|| RunError::UnknownFileType(file_type.clone()))?;
            Ok((role.clone(), file_pattern(schema, role, ext)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extensions() -> BTreeMap<String, String> {
        [("fastq", "fq.gz"), ("report", "tsv")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_sample_and_group_patterns() {
        let sample = ResultSchema::new("filtered").with_module("filter");
        assert_eq!(
            file_pattern(&sample, "read1", "fq.gz"),
            "{sample_name}/{sample_name}.filter.read1.fq.gz"
        );

        let group = ResultSchema::new("matrix").with_level(Level::Group);
        assert_eq!(
            marker_pattern(&group),
            "{group_name}/{group_name}.matrix.flag.registered"
        );
    }

    #[test]
    fn test_marker_uses_schema_name() {
        let contigs = ResultSchema::new("contigs").with_module("assembly");
        let scaffolds = ResultSchema::new("scaffolds").with_module("assembly");
        assert_eq!(
            marker_pattern(&contigs),
            "{sample_name}/{sample_name}.contigs.flag.registered"
        );
        assert_ne!(marker_pattern(&contigs), marker_pattern(&scaffolds));
    }

    #[test]
    fn test_expand() {
        let schema = ResultSchema::new("qc");
        let target = expand(&marker_pattern(&schema), Level::Sample, "s1");
        assert_eq!(target, "s1/s1.qc.flag.registered");
    }

    #[test]
    fn test_role_patterns() {
        let schema = ResultSchema::new("taxa").with_file("report", "report");
        let patterns = role_patterns(&schema, &extensions()).unwrap();
        assert_eq!(patterns["report"], "{sample_name}/{sample_name}.taxa.report.tsv");

        let origin = ResultSchema::new("raw").with_file("read1", "fastq").with_origin(true);
        assert_eq!(role_patterns(&origin, &extensions()).unwrap()["read1"], "");
    }

    #[test]
    fn test_unknown_file_type() {
        let schema = ResultSchema::new("taxa").with_file("report", "bam");
        assert!(matches!(
            role_patterns(&schema, &extensions()),
            Err(RunError::UnknownFileType(t)) if t == "bam"
        ));
    }
}
