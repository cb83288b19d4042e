//! File-backed catalog of channels, proxies and programmes.
//!
//! The core treats persistent entity storage as an injected collaborator;
//! the standalone server backs it with one YAML file, good enough for
//! deployments that manage their catalog as configuration. The file is
//! re-read on each lookup series so edits apply without a restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Deserialize;

use prismcast_core::api::ProxyStore;
use prismcast_core::pipeline::{
    Channel, ChannelSource, FilterRule, MappingRule, NumberingMode, ProgramSource, Programme,
    Proxy,
};
use prismcast_core::relay::manager::OriginResolver;

#[derive(Debug, Clone, Deserialize)]
struct ChannelEntry {
    id: String,
    #[serde(default)]
    tvg_id: Option<String>,
    name: String,
    url: String,
    #[serde(default)]
    logo: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    source_id: Option<String>,
    #[serde(default)]
    source_priority: i32,
    #[serde(default)]
    number: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProxyEntry {
    id: String,
    name: String,
    #[serde(default)]
    stream_sources: Vec<String>,
    #[serde(default)]
    epg_sources: Vec<String>,
    #[serde(default)]
    mapping_rules: Vec<MappingRule>,
    #[serde(default)]
    filter_rules: Vec<FilterRule>,
    #[serde(default = "default_numbering")]
    numbering: NumberingMode,
    #[serde(default = "default_epg_days")]
    epg_days: u32,
}

fn default_numbering() -> NumberingMode {
    NumberingMode::Sequential
}

fn default_epg_days() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
struct ProgrammeEntry {
    channel: String,
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
    title: String,
    #[serde(default)]
    subtitle: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    source_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    channels: Vec<ChannelEntry>,
    #[serde(default)]
    proxies: Vec<ProxyEntry>,
    #[serde(default)]
    programmes: Vec<ProgrammeEntry>,
}

/// YAML-file catalog implementing the core's storage seams.
pub struct Catalog {
    path: PathBuf,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        // Fail fast on startup if the file is unreadable or malformed.
        let catalog = Self {
            path: path.to_path_buf(),
        };
        catalog.read()?;
        Ok(Arc::new(catalog))
    }

    fn read(&self) -> Result<CatalogFile> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read catalog: {}", self.path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse catalog: {}", self.path.display()))
    }

    fn read_or_empty(&self) -> CatalogFile {
        match self.read() {
            Ok(catalog) => catalog,
            Err(e) => {
                log::error!("[Catalog] {e:#}; serving empty catalog");
                CatalogFile::default()
            }
        }
    }

    fn to_channel(entry: &ChannelEntry) -> Channel {
        Channel {
            id: entry.id.clone(),
            tvg_id: entry.tvg_id.clone().unwrap_or_else(|| entry.id.clone()),
            tvg_name: entry.name.clone(),
            name: entry.name.clone(),
            logo_url: entry.logo.clone(),
            group: entry.group.clone(),
            stream_url: entry.url.clone(),
            source_id: entry
                .source_id
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            source_priority: entry.source_priority,
            number: entry.number,
        }
    }
}

impl OriginResolver for Catalog {
    fn origin_url(&self, channel_id: &str) -> Option<String> {
        self.read_or_empty()
            .channels
            .iter()
            .find(|c| c.id == channel_id)
            .map(|c| c.url.clone())
    }
}

impl ProxyStore for Catalog {
    fn proxy(&self, proxy_id: &str) -> Option<Proxy> {
        self.read_or_empty()
            .proxies
            .iter()
            .find(|p| p.id == proxy_id)
            .map(|p| Proxy {
                id: p.id.clone(),
                name: p.name.clone(),
                stream_source_ids: p.stream_sources.clone(),
                epg_source_ids: p.epg_sources.clone(),
                mapping_rules: p.mapping_rules.clone(),
                filter_rules: p.filter_rules.clone(),
                numbering: p.numbering,
                epg_days: p.epg_days,
            })
    }
}

#[async_trait]
impl ChannelSource for Catalog {
    async fn load_channels(&self, source_ids: &[String]) -> Result<Vec<Channel>, String> {
        let catalog = self.read().map_err(|e| e.to_string())?;
        Ok(catalog
            .channels
            .iter()
            .filter(|entry| {
                source_ids.is_empty()
                    || source_ids.contains(
                        &entry
                            .source_id
                            .clone()
                            .unwrap_or_else(|| "default".to_string()),
                    )
            })
            .map(Self::to_channel)
            .collect())
    }
}

impl ProgramSource for Catalog {
    fn load_programs(
        &self,
        source_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        batch_size: usize,
    ) -> BoxStream<'_, Result<Vec<Programme>, String>> {
        let source_ids = source_ids.to_vec();
        let result = self.read().map_err(|e| e.to_string()).map(|catalog| {
            let programmes: Vec<Programme> = catalog
                .programmes
                .iter()
                .filter(|p| {
                    let in_window = p.stop > from && p.start < to;
                    let in_sources = source_ids.is_empty()
                        || source_ids.contains(
                            &p.source_id.clone().unwrap_or_else(|| "default".to_string()),
                        );
                    in_window && in_sources
                })
                .map(|p| Programme {
                    channel_tvg_id: p.channel.clone(),
                    start: p.start,
                    stop: p.stop,
                    title: p.title.clone(),
                    subtitle: p.subtitle.clone(),
                    description: p.description.clone(),
                    category: p.category.clone(),
                })
                .collect();
            programmes
        });

        match result {
            Err(e) => Box::pin(futures::stream::once(async move { Err(e) })),
            Ok(programmes) => {
                let batches: Vec<Result<Vec<Programme>, String>> = programmes
                    .chunks(batch_size.max(1))
                    .map(|chunk| Ok(chunk.to_vec()))
                    .collect();
                Box::pin(futures::stream::iter(batches))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_catalog(content: &str) -> (tempfile::TempDir, Arc<Catalog>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("catalog.yaml");
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(content.as_bytes()).expect("write");
        let catalog = Catalog::open(&path).expect("open");
        (dir, catalog)
    }

    #[test]
    fn malformed_catalog_fails_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("catalog.yaml");
        std::fs::write(&path, ": not yaml :").expect("write");
        assert!(Catalog::open(&path).is_err());
    }

    #[tokio::test]
    async fn channels_filter_by_source() {
        let (_dir, catalog) = write_catalog(
            r#"
channels:
  - id: ch1
    name: One
    url: http://upstream/1.ts
    source_id: s1
  - id: ch2
    name: Two
    url: http://upstream/2.ts
    source_id: s2
"#,
        );
        let channels = catalog
            .load_channels(&["s1".to_string()])
            .await
            .expect("load");
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "One");
        assert_eq!(catalog.origin_url("ch2").as_deref(), Some("http://upstream/2.ts"));
        assert_eq!(catalog.origin_url("nope"), None);
    }

    #[test]
    fn proxies_resolve_with_defaults() {
        let (_dir, catalog) = write_catalog(
            r#"
proxies:
  - id: p1
    name: Main
    stream_sources: [s1]
"#,
        );
        let proxy = catalog.proxy("p1").expect("proxy");
        assert_eq!(proxy.numbering, NumberingMode::Sequential);
        assert_eq!(proxy.epg_days, 3);
    }
}
