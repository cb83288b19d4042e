//! Filtering stage.
//!
//! Include rules narrow the set (a channel survives if it matches any
//! include rule); exclude rules then remove from the narrowed set.
//! Include-before-exclude ordering is fixed.

use super::model::{Channel, FilterKind, FilterRule};

/// Applies the filter rules, returning the surviving channels.
#[must_use]
pub fn apply_filters(channels: Vec<Channel>, rules: &[FilterRule]) -> Vec<Channel> {
    let includes: Vec<&FilterRule> = rules
        .iter()
        .filter(|r| r.kind == FilterKind::Include)
        .collect();
    let excludes: Vec<&FilterRule> = rules
        .iter()
        .filter(|r| r.kind == FilterKind::Exclude)
        .collect();

    channels
        .into_iter()
        .filter(|channel| {
            let included =
                includes.is_empty() || includes.iter().any(|r| r.predicate.matches(channel));
            included && !excludes.iter().any(|r| r.predicate.matches(channel))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::model::{Field, MatchOp, Predicate};

    fn channel(name: &str, group: &str) -> Channel {
        Channel {
            id: name.into(),
            tvg_id: name.into(),
            tvg_name: name.into(),
            name: name.into(),
            logo_url: None,
            group: Some(group.into()),
            stream_url: "http://e".into(),
            source_id: "s".into(),
            source_priority: 0,
            number: None,
        }
    }

    fn rule(kind: FilterKind, field: Field, value: &str) -> FilterRule {
        FilterRule {
            kind,
            predicate: Predicate {
                field,
                op: MatchOp::Contains,
                value: value.into(),
            },
        }
    }

    #[test]
    fn no_rules_keeps_everything() {
        let channels = vec![channel("A", "x"), channel("B", "y")];
        assert_eq!(apply_filters(channels, &[]).len(), 2);
    }

    #[test]
    fn include_narrows_then_exclude_removes() {
        let channels = vec![
            channel("News One", "news"),
            channel("News Two HD", "news"),
            channel("Movies", "film"),
        ];
        let rules = vec![
            rule(FilterKind::Include, Field::Group, "news"),
            rule(FilterKind::Exclude, Field::Name, "HD"),
        ];
        let result = apply_filters(channels, &rules);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, "News One");
    }

    #[test]
    fn exclude_applies_even_without_includes() {
        let channels = vec![channel("A", "x"), channel("B", "y")];
        let rules = vec![rule(FilterKind::Exclude, Field::Group, "y")];
        let result = apply_filters(channels, &rules);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, "A");
    }
}
