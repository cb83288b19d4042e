//! Data mapping stage.
//!
//! Rules apply in ascending priority. Each rule is a (predicate,
//! assignments) pair evaluated against the record as left by the previous
//! rule; a false predicate makes the rule a no-op.

use super::model::{Assignment, Channel, Field, MappingRule};

/// Applies all rules, in priority order, to every channel.
pub fn apply_mapping(channels: &mut [Channel], rules: &[MappingRule]) {
    let mut ordered: Vec<&MappingRule> = rules.iter().collect();
    ordered.sort_by_key(|rule| rule.priority);

    for channel in channels.iter_mut() {
        for rule in &ordered {
            let applies = rule
                .predicate
                .as_ref()
                .map_or(true, |predicate| predicate.matches(channel));
            if !applies {
                continue;
            }
            for assignment in &rule.assignments {
                assign(channel, assignment);
            }
        }
    }
}

fn assign(channel: &mut Channel, assignment: &Assignment) {
    let value = assignment.value.clone();
    match assignment.field {
        Field::TvgId => channel.tvg_id = value,
        Field::TvgName => channel.tvg_name = value,
        Field::Name => channel.name = value,
        Field::Group => channel.group = Some(value),
        Field::LogoUrl => channel.logo_url = Some(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::model::{MatchOp, Predicate};

    fn channel(name: &str) -> Channel {
        Channel {
            id: "c".into(),
            tvg_id: "id".into(),
            tvg_name: name.into(),
            name: name.into(),
            logo_url: None,
            group: None,
            stream_url: "http://e".into(),
            source_id: "s".into(),
            source_priority: 0,
            number: None,
        }
    }

    fn rule(priority: i32, predicate: Option<Predicate>, field: Field, value: &str) -> MappingRule {
        MappingRule {
            priority,
            predicate,
            assignments: vec![Assignment {
                field,
                value: value.into(),
            }],
        }
    }

    #[test]
    fn rules_apply_in_priority_order() {
        let mut channels = vec![channel("BBC One")];
        // Declared out of order; priority decides.
        let rules = vec![
            rule(20, None, Field::Group, "second"),
            rule(10, None, Field::Group, "first"),
        ];
        apply_mapping(&mut channels, &rules);
        assert_eq!(channels[0].group.as_deref(), Some("second"));
    }

    #[test]
    fn later_rule_sees_earlier_rule_output() {
        let mut channels = vec![channel("BBC One")];
        let rules = vec![
            rule(1, None, Field::Group, "UK"),
            // Matches only because rule 1 assigned the group.
            rule(
                2,
                Some(Predicate {
                    field: Field::Group,
                    op: MatchOp::Equals,
                    value: "UK".into(),
                }),
                Field::TvgName,
                "BBC One UK",
            ),
        ];
        apply_mapping(&mut channels, &rules);
        assert_eq!(channels[0].tvg_name, "BBC One UK");
    }

    #[test]
    fn false_predicate_is_a_noop() {
        let mut channels = vec![channel("BBC One")];
        let rules = vec![rule(
            1,
            Some(Predicate {
                field: Field::Name,
                op: MatchOp::Equals,
                value: "does not match".into(),
            }),
            Field::Group,
            "never",
        )];
        apply_mapping(&mut channels, &rules);
        assert_eq!(channels[0].group, None);
    }
}
