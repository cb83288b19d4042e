//! Pipeline data model and collaborator seams.
//!
//! Persistent storage of proxies, sources, and rules is outside the core;
//! the router injects [`ChannelSource`], [`ProgramSource`], and
//! [`IngestionTracker`] implementations backed by whatever store it uses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// A curated channel flowing through the pipeline stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub tvg_id: String,
    pub tvg_name: String,
    pub name: String,
    pub logo_url: Option<String>,
    pub group: Option<String>,
    pub stream_url: String,
    pub source_id: String,
    /// Lower value wins duplicate resolution in `preserve` numbering.
    pub source_priority: i32,
    pub number: Option<u32>,
}

/// An EPG programme, streamed through to the guide writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Programme {
    pub channel_tvg_id: String,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub title: String,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
}

/// Channel numbering strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NumberingMode {
    /// Keep source numbers; duplicates resolved by source priority, then
    /// original order.
    Preserve,
    /// 1..N in source order, stable.
    Sequential,
    /// Each source gets a disjoint 1000-wide range starting at 1.
    SourceBased,
}

/// Fields addressable by mapping and filter rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    TvgId,
    TvgName,
    Name,
    Group,
    LogoUrl,
}

/// Predicate operators. The full expression language lives outside the
/// core; rules arrive pre-lowered to these primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOp {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    pub field: Field,
    pub op: MatchOp,
    pub value: String,
}

impl Predicate {
    /// Case-insensitive evaluation against a channel.
    #[must_use]
    pub fn matches(&self, channel: &Channel) -> bool {
        let actual = match self.field {
            Field::TvgId => &channel.tvg_id,
            Field::TvgName => &channel.tvg_name,
            Field::Name => &channel.name,
            Field::Group => channel.group.as_deref().unwrap_or(""),
            Field::LogoUrl => channel.logo_url.as_deref().unwrap_or(""),
        };
        let actual = actual.to_ascii_lowercase();
        let expected = self.value.to_ascii_lowercase();
        match self.op {
            MatchOp::Equals => actual == expected,
            MatchOp::Contains => actual.contains(&expected),
            MatchOp::StartsWith => actual.starts_with(&expected),
            MatchOp::EndsWith => actual.ends_with(&expected),
        }
    }
}

/// One field assignment applied when a rule's predicate holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub field: Field,
    pub value: String,
}

/// A mapping rule: applied in ascending priority; a false predicate makes
/// the rule a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingRule {
    pub priority: i32,
    pub predicate: Option<Predicate>,
    pub assignments: Vec<Assignment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Include,
    Exclude,
}

/// A filter rule; include rules narrow the set before exclude rules
/// remove from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub kind: FilterKind,
    pub predicate: Predicate,
}

/// A proxy: the unit a generation run produces artifacts for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub id: String,
    pub name: String,
    pub stream_source_ids: Vec<String>,
    pub epg_source_ids: Vec<String>,
    pub mapping_rules: Vec<MappingRule>,
    pub filter_rules: Vec<FilterRule>,
    pub numbering: NumberingMode,
    /// EPG date window, in days from now.
    pub epg_days: u32,
}

/// Streams the channel set for a proxy's linked stream sources.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    async fn load_channels(&self, source_ids: &[String]) -> Result<Vec<Channel>, String>;
}

/// Streams EPG programmes in batches over a date window.
pub trait ProgramSource: Send + Sync {
    fn load_programs(
        &self,
        source_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        batch_size: usize,
    ) -> BoxStream<'_, Result<Vec<Programme>, String>>;
}

/// Blocks generations while ingestions touching the same sources run.
#[async_trait]
pub trait IngestionTracker: Send + Sync {
    /// Resolves when every ingestion job touching the sources has reached
    /// a terminal state.
    async fn await_idle(&self, source_ids: &[String]) -> Result<(), String>;
}

/// Tracker for deployments without an ingestion subsystem.
pub struct NoopIngestionTracker;

#[async_trait]
impl IngestionTracker for NoopIngestionTracker {
    async fn await_idle(&self, _source_ids: &[String]) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(name: &str, group: Option<&str>) -> Channel {
        Channel {
            id: "c1".into(),
            tvg_id: "one.example".into(),
            tvg_name: name.into(),
            name: name.into(),
            logo_url: None,
            group: group.map(str::to_string),
            stream_url: "http://e/1".into(),
            source_id: "s1".into(),
            source_priority: 0,
            number: None,
        }
    }

    #[test]
    fn predicates_are_case_insensitive() {
        let c = channel("News HD", Some("News"));
        assert!(Predicate {
            field: Field::Name,
            op: MatchOp::Contains,
            value: "news".into(),
        }
        .matches(&c));
        assert!(Predicate {
            field: Field::Group,
            op: MatchOp::Equals,
            value: "NEWS".into(),
        }
        .matches(&c));
    }

    #[test]
    fn missing_optional_fields_compare_as_empty() {
        let c = channel("News", None);
        assert!(!Predicate {
            field: Field::Group,
            op: MatchOp::Equals,
            value: "news".into(),
        }
        .matches(&c));
        assert!(Predicate {
            field: Field::LogoUrl,
            op: MatchOp::Equals,
            value: "".into(),
        }
        .matches(&c));
    }
}
