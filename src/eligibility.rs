//! Sample and group eligibility.
//!
//! A run only processes samples that already hold the pipeline's origin
//! data. A sample is eligible when, for every origin group, it holds a
//! result of at least one of the group's types. A group is eligible only when
//! all of its members are.

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::catalog::{GroupRecord, SampleRecord};
use crate::definition::OriginGroup;

/// Kind of entity an exclusion refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Sample,
    Group,
}

/// Why an entity was left out of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExclusionReason {
    /// The sample holds no result of any type in this origin group.
    MissingOrigin(OriginGroup),
    /// A member sample of the group is itself ineligible.
    IneligibleMember(String),
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionReason::MissingOrigin(group) => {
                write!(f, "no result of origin group [{group}]")
            }
            ExclusionReason::IneligibleMember(sample) => {
                write!(f, "member sample '{sample}' is ineligible")
            }
        }
    }
}

/// An entity dropped from a run, with the first failing requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exclusion {
    pub entity: String,
    pub kind: EntityKind,
    pub reason: ExclusionReason,
}

/// Samples and groups that may take part in a run.
#[derive(Debug, Clone, Default)]
pub struct Eligible {
    pub samples: Vec<SampleRecord>,
    pub groups: Vec<GroupRecord>,
    pub excluded: Vec<Exclusion>,
}

/// Returns the first origin group the sample fails, if any.
fn first_unmet<'a>(origins: &'a [OriginGroup], sample: &SampleRecord) -> Option<&'a OriginGroup> {
    origins
        .iter()
        .find(|group| !group.is_satisfied_by(sample.result_types()))
}

/// Narrows candidate samples and groups to those holding the origin data.
///
/// Input order is preserved. Every exclusion is logged and returned.
pub fn filter_eligible(
    origins: &[OriginGroup],
    samples: Vec<SampleRecord>,
    groups: Vec<GroupRecord>,
) -> Eligible {
    let mut eligible = Eligible::default();

    for sample in samples {
        match first_unmet(origins, &sample) {
            None => eligible.samples.push(sample),
            Some(group) => eligible.excluded.push(Exclusion {
                entity: sample.name,
                kind: EntityKind::Sample,
                reason: ExclusionReason::MissingOrigin(group.clone()),
            }),
        }
    }

    for group in groups {
        let bad_member = group
            .members
            .iter()
            .find(|m| first_unmet(origins, m).is_some());
        match bad_member {
            None => eligible.groups.push(group),
            Some(member) => eligible.excluded.push(Exclusion {
                reason: ExclusionReason::IneligibleMember(member.name.clone()),
                entity: group.name,
                kind: EntityKind::Group,
            }),
        }
    }

    for exclusion in &eligible.excluded {
        warn!(
            entity = %exclusion.entity,
            kind = ?exclusion.kind,
            reason = %exclusion.reason,
            "Excluded from run"
        );
    }
    debug!(
        samples = eligible.samples.len(),
        groups = eligible.groups.len(),
        excluded = eligible.excluded.len(),
        "Eligibility filter applied"
    );

    eligible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ResultRecord;
    use crate::definition::Level;
    use std::collections::BTreeMap;

    fn sample(name: &str, result_types: &[&str]) -> SampleRecord {
        let mut record = SampleRecord::new(name, "metagenome");
        record.results = result_types
            .iter()
            .map(|t| ResultRecord {
                name: format!("{name}::{t}"),
                result_type: t.to_string(),
                owner: name.to_string(),
                level: Level::Sample,
                files: BTreeMap::new(),
            })
            .collect();
        record
    }

    fn origins() -> Vec<OriginGroup> {
        vec![
            OriginGroup::new(["short_reads", "long_reads"]),
            OriginGroup::new(["metadata"]),
        ]
    }

    #[test]
    fn test_and_across_groups_or_within() {
        let eligible = filter_eligible(
            &origins(),
            vec![
                sample("a", &["long_reads", "metadata"]),
                sample("b", &["short_reads"]),
                sample("c", &["metadata"]),
            ],
            vec![],
        );
        let names: Vec<_> = eligible.samples.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a"]);
        assert_eq!(eligible.excluded.len(), 2);
        assert_eq!(
            eligible.excluded[0].reason,
            ExclusionReason::MissingOrigin(OriginGroup::new(["metadata"]))
        );
        assert_eq!(
            eligible.excluded[1].reason,
            ExclusionReason::MissingOrigin(OriginGroup::new(["short_reads", "long_reads"]))
        );
    }

    #[test]
    fn test_group_with_ineligible_member_is_dropped() {
        let s1 = sample("s1", &["short_reads", "metadata"]);
        let s2 = sample("s2", &["short_reads"]);
        let group = GroupRecord {
            name: "g".to_string(),
            members: vec![s1.clone(), s2.clone()],
            results: vec![],
        };

        let eligible = filter_eligible(&origins(), vec![s1, s2], vec![group]);
        assert_eq!(eligible.samples.len(), 1);
        assert_eq!(eligible.samples[0].name, "s1");
        assert!(eligible.groups.is_empty());
        assert!(eligible.excluded.iter().any(|e| e.entity == "g"
            && e.kind == EntityKind::Group
            && e.reason == ExclusionReason::IneligibleMember("s2".to_string())));
    }

    #[test]
    fn test_no_origins_admits_everything() {
        let group = GroupRecord {
            name: "g".to_string(),
            members: vec![sample("s1", &[])],
            results: vec![],
        };
        let eligible = filter_eligible(&[], vec![sample("s1", &[])], vec![group]);
        assert_eq!(eligible.samples.len(), 1);
        assert_eq!(eligible.groups.len(), 1);
        assert!(eligible.excluded.is_empty());
    }
}
