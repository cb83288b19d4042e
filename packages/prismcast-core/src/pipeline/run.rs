//! Generation run orchestration.
//!
//! Stages execute strictly in order; runs for the same proxy are
//! serialized behind a per-proxy async mutex while different proxies run
//! concurrently. Any stage failure aborts the run and leaves published
//! outputs untouched.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::state::PipelineConfig;
use crate::utils::now_millis;

use super::filtering::apply_filters;
use super::guard::await_ingestions;
use super::logos::LogoCache;
use super::mapping::apply_mapping;
use super::model::{ChannelSource, IngestionTracker, ProgramSource, Proxy};
use super::numbering::apply_numbering;
use super::output::{publish, ArtifactPaths, GuideWriter, PlaylistWriter};
use super::StageError;

/// Status of a generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
struct StageTiming {
    stage: String,
    started_ms: u64,
    ended_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct RunState {
    status: RunStatus,
    stage: String,
    error: Option<String>,
    stages: Vec<StageTiming>,
}

/// Record of one generation run.
pub struct GenerationRun {
    pub id: String,
    pub proxy_id: String,
    state: Mutex<RunState>,
}

impl GenerationRun {
    fn new(proxy_id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            proxy_id: proxy_id.to_string(),
            state: Mutex::new(RunState {
                status: RunStatus::Queued,
                stage: String::new(),
                error: None,
                stages: Vec::new(),
            }),
        })
    }

    fn enter_stage(&self, stage: &str) {
        let mut state = self.state.lock();
        let now = now_millis();
        if let Some(last) = state.stages.last_mut() {
            last.ended_ms.get_or_insert(now);
        }
        state.status = RunStatus::Running;
        state.stage = stage.to_string();
        state.stages.push(StageTiming {
            stage: stage.to_string(),
            started_ms: now,
            ended_ms: None,
        });
        log::info!("[Generate] run {} -> stage {stage}", self.id);
    }

    fn finish(&self, status: RunStatus, error: Option<String>) {
        let mut state = self.state.lock();
        let now = now_millis();
        if let Some(last) = state.stages.last_mut() {
            last.ended_ms.get_or_insert(now);
        }
        state.status = status;
        state.error = error;
    }

    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.state.lock().status
    }

    #[must_use]
    pub fn current_stage(&self) -> String {
        self.state.lock().stage.clone()
    }

    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// JSON view for the API.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let state = self.state.lock();
        serde_json::json!({
            "id": self.id,
            "proxyId": self.proxy_id,
            "status": state.status,
            "stage": state.stage,
            "error": state.error,
            "stages": state.stages,
        })
    }
}

/// Ordered stage runner producing playlist and guide artifacts.
pub struct GenerationPipeline {
    config: PipelineConfig,
    channels: Arc<dyn ChannelSource>,
    programs: Arc<dyn ProgramSource>,
    tracker: Arc<dyn IngestionTracker>,
    logos: Arc<LogoCache>,
    proxy_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    runs: DashMap<String, Arc<GenerationRun>>,
}

impl GenerationPipeline {
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        channels: Arc<dyn ChannelSource>,
        programs: Arc<dyn ProgramSource>,
        tracker: Arc<dyn IngestionTracker>,
    ) -> Arc<Self> {
        let logos = Arc::new(LogoCache::new(
            config.logo_dir.clone(),
            config.logo_parallelism,
            config.logo_retention_days,
        ));
        Arc::new(Self {
            config,
            channels,
            programs,
            tracker,
            logos,
            proxy_locks: DashMap::new(),
            runs: DashMap::new(),
        })
    }

    #[must_use]
    pub fn logo_cache(&self) -> &Arc<LogoCache> {
        &self.logos
    }

    #[must_use]
    pub fn run(&self, run_id: &str) -> Option<Arc<GenerationRun>> {
        self.runs.get(run_id).map(|r| Arc::clone(r.value()))
    }

    /// Published artifact paths for a proxy.
    #[must_use]
    pub fn artifact_paths(&self, proxy_id: &str) -> ArtifactPaths {
        ArtifactPaths::for_proxy(&self.config.output_dir, proxy_id)
    }

    /// Executes a full generation run for the proxy. Returns the run
    /// record; on failure the error is also recorded on it.
    pub async fn generate(
        &self,
        proxy: &Proxy,
        cancel: CancellationToken,
    ) -> (Arc<GenerationRun>, Result<(), StageError>) {
        let run = GenerationRun::new(&proxy.id);
        self.runs.insert(run.id.clone(), Arc::clone(&run));

        // Runs for the same proxy are serialized; the lock entry is
        // created on first use and shared by later runs.
        let lock = Arc::clone(
            self.proxy_locks
                .entry(proxy.id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .value(),
        );
        let _serialized = lock.lock().await;

        let result = self.execute(proxy, &run, &cancel).await;
        match &result {
            Ok(()) => {
                run.finish(RunStatus::Succeeded, None);
                log::info!("[Generate] run {} succeeded", run.id);
            }
            Err(StageError::Cancelled) => {
                run.finish(RunStatus::Cancelled, None);
                log::info!("[Generate] run {} cancelled", run.id);
            }
            Err(e) => {
                run.finish(RunStatus::Failed, Some(e.to_string()));
                log::warn!(
                    "[Generate] run {} failed in stage {}: {e}",
                    run.id,
                    e.stage_name()
                );
            }
        }
        (run, result)
    }

    async fn execute(
        &self,
        proxy: &Proxy,
        run: &Arc<GenerationRun>,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        let stage_timeout = Duration::from_secs(self.config.stage_timeout_secs);
        let check_cancel = || {
            if cancel.is_cancelled() {
                Err(StageError::Cancelled)
            } else {
                Ok(())
            }
        };

        // 1. Ingestion guard.
        run.enter_stage("ingestion_guard");
        let mut guarded_sources = proxy.stream_source_ids.clone();
        guarded_sources.extend(proxy.epg_source_ids.iter().cloned());
        await_ingestions(
            &self.tracker,
            &guarded_sources,
            Duration::from_secs(self.config.guard_timeout_secs),
        )
        .await?;
        check_cancel()?;

        // 2. Load channels.
        run.enter_stage("load_channels");
        let mut channels = tokio::time::timeout(
            stage_timeout,
            self.channels.load_channels(&proxy.stream_source_ids),
        )
        .await
        .map_err(|_| StageError::Timeout("load_channels".to_string()))?
        .map_err(StageError::Source)?;
        log::info!(
            "[Generate] run {} loaded {} channels",
            run.id,
            channels.len()
        );
        check_cancel()?;

        // 3-5. Mapping, filtering, numbering.
        run.enter_stage("data_mapping");
        apply_mapping(&mut channels, &proxy.mapping_rules);
        run.enter_stage("filtering");
        let mut channels = apply_filters(channels, &proxy.filter_rules);
        run.enter_stage("numbering");
        apply_numbering(&mut channels, proxy.numbering);
        check_cancel()?;

        // 6. Logo caching.
        run.enter_stage("logo_caching");
        tokio::time::timeout(stage_timeout, self.logos.cache_channel_logos(&mut channels))
            .await
            .map_err(|_| StageError::Timeout("logo_caching".to_string()))?;
        check_cancel()?;

        // 7. Generation: stream artifacts to temp files.
        run.enter_stage("generation");
        let paths = self.artifact_paths(&proxy.id);
        if let Some(parent) = paths.playlist.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StageError::Io(e.to_string()))?;
        }
        let temp = paths.temp();

        let mut playlist = PlaylistWriter::create(&temp.playlist).await?;
        for channel in &channels {
            playlist.write_channel(channel).await?;
        }
        playlist.finish().await?;

        let mut guide = GuideWriter::create(&temp.guide, &channels).await?;
        let known_ids: HashSet<&str> = channels.iter().map(|c| c.tvg_id.as_str()).collect();
        let from = Utc::now();
        let to = from + chrono::Duration::days(i64::from(proxy.epg_days));
        let mut batches = self.programs.load_programs(
            &proxy.epg_source_ids,
            from,
            to,
            self.config.program_batch_size,
        );
        let mut programme_count = 0usize;
        while let Some(batch) = batches.next().await {
            check_cancel()?;
            let batch = batch.map_err(StageError::Source)?;
            let relevant: Vec<_> = batch
                .into_iter()
                .filter(|p| known_ids.contains(p.channel_tvg_id.as_str()))
                .collect();
            programme_count += relevant.len();
            guide.write_batch(&relevant).await?;
        }
        guide.finish().await?;
        log::info!(
            "[Generate] run {} wrote {} channels, {} programmes",
            run.id,
            channels.len(),
            programme_count
        );
        check_cancel()?;

        // 8. Atomic publish.
        run.enter_stage("publish");
        publish(&paths).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::model::{
        Channel, FilterKind, FilterRule, Field, MatchOp, NoopIngestionTracker, NumberingMode,
        Predicate, Programme,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use futures::stream::BoxStream;

    struct FakeChannels(Vec<Channel>);

    #[async_trait]
    impl ChannelSource for FakeChannels {
        async fn load_channels(&self, _source_ids: &[String]) -> Result<Vec<Channel>, String> {
            Ok(self.0.clone())
        }
    }

    struct FakePrograms(Vec<Programme>);

    impl ProgramSource for FakePrograms {
        fn load_programs(
            &self,
            _source_ids: &[String],
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
            batch_size: usize,
        ) -> BoxStream<'_, Result<Vec<Programme>, String>> {
            let batches: Vec<Result<Vec<Programme>, String>> = self
                .0
                .chunks(batch_size.max(1))
                .map(|chunk| Ok(chunk.to_vec()))
                .collect();
            Box::pin(futures::stream::iter(batches))
        }
    }

    struct FailingChannels;

    #[async_trait]
    impl ChannelSource for FailingChannels {
        async fn load_channels(&self, _source_ids: &[String]) -> Result<Vec<Channel>, String> {
            Err("source exploded".to_string())
        }
    }

    fn channel(name: &str, tvg_id: &str) -> Channel {
        Channel {
            id: name.into(),
            tvg_id: tvg_id.into(),
            tvg_name: name.into(),
            name: name.into(),
            logo_url: None,
            group: Some("News".into()),
            stream_url: format!("http://upstream/{name}.ts"),
            source_id: "s1".into(),
            source_priority: 0,
            number: None,
        }
    }

    fn programme(tvg_id: &str, title: &str) -> Programme {
        Programme {
            channel_tvg_id: tvg_id.into(),
            start: Utc::now(),
            stop: Utc::now() + chrono::Duration::hours(1),
            title: title.into(),
            subtitle: None,
            description: None,
            category: None,
        }
    }

    fn proxy() -> Proxy {
        Proxy {
            id: "p1".into(),
            name: "Proxy One".into(),
            stream_source_ids: vec!["s1".into()],
            epg_source_ids: vec!["e1".into()],
            mapping_rules: vec![],
            filter_rules: vec![],
            numbering: NumberingMode::Sequential,
            epg_days: 2,
        }
    }

    fn pipeline_with(
        dir: &std::path::Path,
        channels: Vec<Channel>,
        programmes: Vec<Programme>,
    ) -> Arc<GenerationPipeline> {
        let config = PipelineConfig {
            output_dir: dir.join("out"),
            logo_dir: dir.join("logos"),
            ..Default::default()
        };
        GenerationPipeline::new(
            config,
            Arc::new(FakeChannels(channels)),
            Arc::new(FakePrograms(programmes)),
            Arc::new(NoopIngestionTracker),
        )
    }

    #[tokio::test]
    async fn full_run_publishes_both_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline_with(
            dir.path(),
            vec![channel("One", "one.tv"), channel("Two", "two.tv")],
            vec![programme("one.tv", "Show"), programme("ghost.tv", "Dropped")],
        );
        let (run, result) = pipeline.generate(&proxy(), CancellationToken::new()).await;
        result.expect("run succeeds");
        assert_eq!(run.status(), RunStatus::Succeeded);

        let paths = pipeline.artifact_paths("p1");
        let playlist = tokio::fs::read_to_string(&paths.playlist).await.expect("playlist");
        assert!(playlist.contains("tvg-id=\"one.tv\""));
        assert!(playlist.contains("tvg-chno=\"2\""));
        let guide = tokio::fs::read_to_string(&paths.guide).await.expect("guide");
        assert!(guide.contains("<title>Show</title>"));
        // Programmes for unknown channels are dropped.
        assert!(!guide.contains("Dropped"));
    }

    #[tokio::test]
    async fn failing_stage_leaves_prior_outputs_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        // First a successful run to publish artifacts.
        let pipeline = pipeline_with(
            dir.path(),
            vec![channel("One", "one.tv")],
            vec![],
        );
        let (_, result) = pipeline.generate(&proxy(), CancellationToken::new()).await;
        result.expect("seed run");
        let paths = pipeline.artifact_paths("p1");
        let before = tokio::fs::read(&paths.playlist).await.expect("read");

        // Now a failing run against the same output dir.
        let config = PipelineConfig {
            output_dir: dir.path().join("out"),
            logo_dir: dir.path().join("logos"),
            ..Default::default()
        };
        let failing = GenerationPipeline::new(
            config,
            Arc::new(FailingChannels),
            Arc::new(FakePrograms(vec![])),
            Arc::new(NoopIngestionTracker),
        );
        let (run, result) = failing.generate(&proxy(), CancellationToken::new()).await;
        assert!(result.is_err());
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(run.error().is_some());

        let after = tokio::fs::read(&paths.playlist).await.expect("read");
        assert_eq!(before, after, "published artifacts untouched");
    }

    #[tokio::test]
    async fn cancelled_run_is_marked_cancelled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline_with(dir.path(), vec![channel("One", "one.tv")], vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (run, result) = pipeline.generate(&proxy(), cancel).await;
        assert!(matches!(result, Err(StageError::Cancelled)));
        assert_eq!(run.status(), RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn filters_apply_before_numbering() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline_with(
            dir.path(),
            vec![channel("Keep", "keep.tv"), channel("Drop", "drop.tv")],
            vec![],
        );
        let mut p = proxy();
        p.filter_rules = vec![FilterRule {
            kind: FilterKind::Exclude,
            predicate: Predicate {
                field: Field::Name,
                op: MatchOp::Equals,
                value: "Drop".into(),
            },
        }];
        let (_, result) = pipeline.generate(&p, CancellationToken::new()).await;
        result.expect("run succeeds");
        let playlist = tokio::fs::read_to_string(&pipeline.artifact_paths("p1").playlist)
            .await
            .expect("playlist");
        assert!(playlist.contains("Keep"));
        assert!(!playlist.contains("Drop"));
        // Numbering restarts at 1 after the exclusion.
        assert!(playlist.contains("tvg-chno=\"1\""));
    }
}
