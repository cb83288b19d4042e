//! Per-channel session: origin lifecycle and variant multiplexing.
//!
//! A session owns the origin connection, the source variant it feeds, and
//! all demand-created target variants. Transcode jobs are reached only
//! through the [`TranscodeBackend`] seam and hold nothing but variant
//! handles, so job termination never touches session state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::state::RelayConfig;
use crate::transcode::TranscodeSpec;

use super::origin::{spawn_origin, OriginConfig};
use super::variant::{Variant, VariantKey, VariantReader};
use super::RelayError;

/// Seam between sessions and the transcode coordinator.
///
/// Implemented by the scheduler. Jobs created through this interface hold
/// only the two variant handles; they never call back into the session.
pub trait TranscodeBackend: Send + Sync {
    /// Schedules a job feeding `target` from `source`.
    ///
    /// Fails fast when no known executor advertises the required encoders;
    /// capacity starvation leaves the job pending instead.
    fn submit(
        &self,
        spec: TranscodeSpec,
        source: Arc<Variant>,
        target: Arc<Variant>,
    ) -> Result<String, RelayError>;

    /// Cancels a previously submitted job. Idempotent.
    fn cancel(&self, job_id: &str);
}

/// A client's request for a particular rendition of a channel.
#[derive(Debug, Clone)]
pub struct VariantRequest {
    pub key: VariantKey,
    /// Preferred hardware accelerator ("cuda", "vaapi", ...).
    pub hw_accel: Option<String>,
    /// Target video bitrate hint in kbit/s.
    pub video_bitrate: Option<u32>,
    /// Target audio bitrate hint in kbit/s.
    pub audio_bitrate: Option<u32>,
}

impl VariantRequest {
    #[must_use]
    pub fn passthrough(key: VariantKey) -> Self {
        Self {
            key,
            hw_accel: None,
            video_bitrate: None,
            audio_bitrate: None,
        }
    }
}

/// One session per channel: origin ingress, source variant, target variants.
pub struct Session {
    channel_id: String,
    config: RelayConfig,
    source: Arc<Variant>,
    source_key: watch::Receiver<Option<VariantKey>>,
    targets: Mutex<HashMap<VariantKey, Arc<Variant>>>,
    /// Media-sequence floors per variant key, surviving variant recreation
    /// so playlist numbering stays strictly increasing for the session.
    sequence_floors: Mutex<HashMap<VariantKey, u64>>,
    last_activity: Mutex<Instant>,
    transcoder: Arc<dyn TranscodeBackend>,
    cancel: CancellationToken,
}

impl Session {
    /// Creates the session and spawns its origin reader.
    pub fn spawn(
        channel_id: String,
        origin_url: String,
        config: RelayConfig,
        client: reqwest::Client,
        transcoder: Arc<dyn TranscodeBackend>,
    ) -> Arc<Self> {
        let source = Arc::new(Variant::new(
            // Key is unknown until the PMT arrives; the watch channel below
            // carries the detected pair. The placeholder never matches a
            // client request because requests are validated non-empty.
            VariantKey::new("source", "source"),
            config.video_ring_capacity,
            config.audio_ring_capacity,
        ));
        let (codecs_tx, codecs_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let origin_config = OriginConfig {
            url: origin_url,
            dial_timeout: Duration::from_secs(config.origin_dial_timeout_secs),
            read_idle: Duration::from_secs(config.origin_read_idle_secs),
            max_backoff: Duration::from_secs(config.session_idle_secs),
        };
        spawn_origin(
            client,
            origin_config,
            Arc::clone(&source),
            codecs_tx,
            cancel.clone(),
        );

        Arc::new(Self {
            channel_id,
            config,
            source,
            source_key: codecs_rx,
            targets: Mutex::new(HashMap::new()),
            sequence_floors: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(Instant::now()),
            transcoder,
            cancel,
        })
    }

    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// The session's source variant (origin passthrough).
    #[must_use]
    pub fn source(&self) -> &Arc<Variant> {
        &self.source
    }

    /// Detected source codec pair, once the PMT has been parsed.
    #[must_use]
    pub fn source_codecs(&self) -> Option<VariantKey> {
        self.source_key.borrow().clone()
    }

    /// Marks client activity, deferring idle teardown.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Opens a reader on the source variant, waiting briefly for the origin
    /// to come up if it has not yet delivered a PMT.
    pub async fn source_reader(&self) -> Result<VariantReader, RelayError> {
        self.await_source_codecs().await?;
        self.touch();
        Ok(self.source.reader())
    }

    async fn await_source_codecs(&self) -> Result<VariantKey, RelayError> {
        if let Some(key) = self.source_codecs() {
            return Ok(key);
        }
        let mut rx = self.source_key.clone();
        let wait = Duration::from_secs(self.config.origin_dial_timeout_secs);
        let result = tokio::time::timeout(wait, rx.wait_for(|k| k.is_some())).await;
        let unavailable = || {
            RelayError::UpstreamUnavailable(format!(
                "origin for channel {} produced no program data",
                self.channel_id
            ))
        };
        match result {
            Ok(Ok(_)) => self.source_codecs().ok_or_else(unavailable),
            Ok(Err(_)) | Err(_) => Err(unavailable()),
        }
    }

    /// Resolves a variant request per the demand algorithm:
    /// passthrough short-circuit, then lookup-or-create with an associated
    /// transcode job.
    pub async fn ensure_variant(
        self: &Arc<Self>,
        request: VariantRequest,
    ) -> Result<VariantReader, RelayError> {
        let source_key = self.await_source_codecs().await?;
        self.touch();

        // Passthrough: requested pair matches the origin's elementary streams.
        if request.key == source_key {
            return Ok(self.source.reader());
        }

        let existing = {
            let targets = self.targets.lock();
            targets.get(&request.key).cloned()
        };
        if let Some(variant) = existing {
            if variant.is_errored() {
                return Err(RelayError::VariantErrored(request.key.to_string()));
            }
            return Ok(variant.reader());
        }

        // Create the target variant and schedule its job. The map lock is
        // not held across submit; a racing creator loses and reuses ours.
        let variant = Arc::new(Variant::new(
            request.key.clone(),
            self.config.video_ring_capacity,
            self.config.audio_ring_capacity,
        ));

        {
            let mut targets = self.targets.lock();
            if let Some(winner) = targets.get(&request.key) {
                let winner = Arc::clone(winner);
                drop(targets);
                if winner.is_errored() {
                    return Err(RelayError::VariantErrored(request.key.to_string()));
                }
                return Ok(winner.reader());
            }
            targets.insert(request.key.clone(), Arc::clone(&variant));
        }

        let spec = TranscodeSpec {
            channel_id: self.channel_id.clone(),
            source: source_key,
            target: request.key.clone(),
            hw_accel: request.hw_accel,
            video_bitrate: request.video_bitrate,
            audio_bitrate: request.audio_bitrate,
        };

        match self
            .transcoder
            .submit(spec, Arc::clone(&self.source), Arc::clone(&variant))
        {
            Ok(job_id) => {
                variant.set_job(job_id);
                Ok(variant.reader())
            }
            Err(err) => {
                variant.mark_errored();
                self.targets.lock().remove(&request.key);
                Err(err)
            }
        }
    }

    /// Looks up an existing variant without creating one.
    #[must_use]
    pub fn get_variant(&self, key: &VariantKey) -> Option<Arc<Variant>> {
        if self
            .source_codecs()
            .is_some_and(|source_key| source_key == *key)
        {
            return Some(Arc::clone(&self.source));
        }
        self.targets.lock().get(key).cloned()
    }

    /// Returns the media-sequence floor for a variant key and advances it
    /// to `next`. Keeps playlist numbering monotonic across variant
    /// recreation within the session.
    pub fn sequence_floor(&self, key: &VariantKey) -> u64 {
        *self.sequence_floors.lock().get(key).unwrap_or(&0)
    }

    /// Records the next media sequence for a variant key.
    pub fn record_sequence_floor(&self, key: &VariantKey, next: u64) {
        let mut floors = self.sequence_floors.lock();
        let entry = floors.entry(key.clone()).or_insert(0);
        if next > *entry {
            *entry = next;
        }
    }

    /// Destroys idle target variants, cancelling their jobs.
    ///
    /// Called by the manager's reaper. Returns the number of live target
    /// variants remaining.
    pub fn sweep_variants(&self) -> usize {
        let idle = Duration::from_secs(self.config.variant_idle_secs);
        let mut destroyed = Vec::new();
        let remaining = {
            let mut targets = self.targets.lock();
            targets.retain(|key, variant| {
                let expired =
                    variant.reader_count() == 0 && variant.last_read_at().elapsed() >= idle;
                if expired {
                    destroyed.push((key.clone(), Arc::clone(variant)));
                }
                !expired
            });
            targets.len()
        };

        for (key, variant) in destroyed {
            log::info!(
                "[Session] {} destroying idle variant {}",
                self.channel_id,
                key
            );
            if let Some(job_id) = variant.job() {
                self.transcoder.cancel(&job_id);
            }
            variant.close();
        }
        remaining
    }

    /// Whether any variant currently has readers.
    #[must_use]
    pub fn has_readers(&self) -> bool {
        if self.source.reader_count() > 0 {
            return true;
        }
        self.targets
            .lock()
            .values()
            .any(|v| v.reader_count() > 0)
    }

    /// Tears the session down: cancels the origin, cancels jobs, closes
    /// all variants.
    pub fn shutdown(&self) {
        log::info!("[Session] {} shutting down", self.channel_id);
        self.cancel.cancel();
        let targets: Vec<_> = {
            let mut map = self.targets.lock();
            map.drain().collect()
        };
        for (_, variant) in targets {
            if let Some(job_id) = variant.job() {
                self.transcoder.cancel(&job_id);
            }
            variant.close();
        }
        self.source.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct FakeBackend {
        submitted: PlMutex<Vec<TranscodeSpec>>,
        cancelled: PlMutex<Vec<String>>,
        reject: bool,
    }

    impl FakeBackend {
        fn new(reject: bool) -> Arc<Self> {
            Arc::new(Self {
                submitted: PlMutex::new(Vec::new()),
                cancelled: PlMutex::new(Vec::new()),
                reject,
            })
        }
    }

    impl TranscodeBackend for FakeBackend {
        fn submit(
            &self,
            spec: TranscodeSpec,
            _source: Arc<Variant>,
            _target: Arc<Variant>,
        ) -> Result<String, RelayError> {
            if self.reject {
                return Err(RelayError::VariantErrored(spec.target.to_string()));
            }
            let id = format!("job-{}", self.submitted.lock().len());
            self.submitted.lock().push(spec);
            Ok(id)
        }

        fn cancel(&self, job_id: &str) {
            self.cancelled.lock().push(job_id.to_string());
        }
    }

    fn test_session(backend: Arc<FakeBackend>) -> Arc<Session> {
        // Unroutable origin; these tests never read through it.
        Session::spawn(
            "ch1".to_string(),
            "http://127.0.0.1:9/stream".to_string(),
            RelayConfig::default(),
            reqwest::Client::new(),
            backend,
        )
    }

    #[tokio::test]
    async fn stored_target_variant_is_reused() {
        let backend = FakeBackend::new(false);
        let session = test_session(Arc::clone(&backend));
        let key = VariantKey::new("hevc", "aac");
        let variant = Arc::new(Variant::new(key.clone(), 8, 8));
        session
            .targets
            .lock()
            .insert(key.clone(), Arc::clone(&variant));

        // A second resolution reuses the stored variant.
        let again = session.get_variant(&key).expect("variant");
        assert!(Arc::ptr_eq(&variant, &again));
        assert_eq!(variant.reader_count(), 0);
    }

    #[tokio::test]
    async fn sweep_destroys_idle_variants_and_cancels_jobs() {
        let backend = FakeBackend::new(false);
        let session = test_session(Arc::clone(&backend));
        let key = VariantKey::new("hevc", "aac");
        let variant = Arc::new(Variant::new(key.clone(), 8, 8));
        variant.set_job("job-7".to_string());
        session
            .targets
            .lock()
            .insert(key.clone(), Arc::clone(&variant));

        // Zero readers but not yet idle: survives.
        assert_eq!(session.sweep_variants(), 1);

        // Force the idle window to zero via a fresh session config.
        let mut config = RelayConfig::default();
        config.variant_idle_secs = 0;
        let idle_session = Session::spawn(
            "ch2".to_string(),
            "http://127.0.0.1:9/stream".to_string(),
            config,
            reqwest::Client::new(),
            Arc::clone(&backend) as Arc<dyn TranscodeBackend>,
        );
        let variant2 = Arc::new(Variant::new(key.clone(), 8, 8));
        variant2.set_job("job-9".to_string());
        idle_session
            .targets
            .lock()
            .insert(key, Arc::clone(&variant2));
        assert_eq!(idle_session.sweep_variants(), 0);
        assert!(backend.cancelled.lock().contains(&"job-9".to_string()));
        assert!(variant2.is_closed());
    }

    #[tokio::test]
    async fn sequence_floor_is_monotonic() {
        let backend = FakeBackend::new(false);
        let session = test_session(backend);
        let key = VariantKey::new("h264", "aac");
        assert_eq!(session.sequence_floor(&key), 0);
        session.record_sequence_floor(&key, 17);
        session.record_sequence_floor(&key, 11); // never regresses
        assert_eq!(session.sequence_floor(&key), 17);
    }

    #[tokio::test]
    async fn shutdown_cancels_jobs_and_closes_source() {
        let backend = FakeBackend::new(false);
        let session = test_session(Arc::clone(&backend));
        let key = VariantKey::new("hevc", "aac");
        let variant = Arc::new(Variant::new(key.clone(), 8, 8));
        variant.set_job("job-3".to_string());
        session.targets.lock().insert(key, variant);

        session.shutdown();
        assert!(backend.cancelled.lock().contains(&"job-3".to_string()));
        assert!(session.source().video_ring().is_closed());
    }
}
