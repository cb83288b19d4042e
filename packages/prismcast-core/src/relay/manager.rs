//! Session registry: lookup, creation, reference counting, idle reaping.
//!
//! The channel-id to session map is the only process-wide relay structure.
//! Its lock covers lookup/insert/remove only; session-internal operations
//! never hold it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::state::RelayConfig;

use super::session::{Session, TranscodeBackend};
use super::RelayError;

/// Resolves a channel id to its origin URL.
///
/// Persistent storage of channel entities is outside the core; the router
/// injects an implementation backed by whatever store it uses.
pub trait OriginResolver: Send + Sync {
    fn origin_url(&self, channel_id: &str) -> Option<String>;
}

struct SessionSlot {
    session: Arc<Session>,
    refs: Arc<AtomicUsize>,
}

/// Process-wide session registry.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionSlot>>,
    config: RelayConfig,
    client: reqwest::Client,
    resolver: Arc<dyn OriginResolver>,
    transcoder: Arc<dyn TranscodeBackend>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        config: RelayConfig,
        resolver: Arc<dyn OriginResolver>,
        transcoder: Arc<dyn TranscodeBackend>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            config,
            client: reqwest::Client::new(),
            resolver,
            transcoder,
        })
    }

    /// Acquires a handle on the channel's session, creating it (and dialing
    /// the origin) if absent. The handle keeps the session referenced until
    /// dropped.
    pub fn acquire(self: &Arc<Self>, channel_id: &str) -> Result<SessionHandle, RelayError> {
        let mut sessions = self.sessions.lock();
        if let Some(slot) = sessions.get(channel_id) {
            slot.refs.fetch_add(1, Ordering::SeqCst);
            slot.session.touch();
            return Ok(SessionHandle {
                session: Arc::clone(&slot.session),
                refs: Arc::clone(&slot.refs),
            });
        }

        let origin_url = self
            .resolver
            .origin_url(channel_id)
            .ok_or_else(|| RelayError::UpstreamUnavailable(format!("unknown channel {channel_id}")))?;

        log::info!("[SessionManager] creating session for channel {channel_id}");
        let session = Session::spawn(
            channel_id.to_string(),
            origin_url,
            self.config.clone(),
            self.client.clone(),
            Arc::clone(&self.transcoder),
        );
        let refs = Arc::new(AtomicUsize::new(1));
        sessions.insert(
            channel_id.to_string(),
            SessionSlot {
                session: Arc::clone(&session),
                refs: Arc::clone(&refs),
            },
        );
        Ok(SessionHandle { session, refs })
    }

    /// Looks up a live session without creating one.
    #[must_use]
    pub fn get(&self, channel_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .get(channel_id)
            .map(|slot| Arc::clone(&slot.session))
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Spawns the background reaper. Every `reaper_interval_secs` it sweeps
    /// idle variants inside each session and tears down sessions that have
    /// been unreferenced past the idle window.
    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_secs(manager.config.reaper_interval_secs);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                manager.reap();
            }
            log::debug!("[SessionManager] reaper exited");
        })
    }

    /// One reaper sweep. Public for tests.
    pub fn reap(&self) {
        let idle = Duration::from_secs(self.config.session_idle_secs);
        let candidates: Vec<(String, Arc<Session>)> = {
            let sessions = self.sessions.lock();
            sessions
                .iter()
                .map(|(id, slot)| (id.clone(), Arc::clone(&slot.session)))
                .collect()
        };

        // Variant sweeps happen outside the registry lock.
        for (_, session) in &candidates {
            session.sweep_variants();
        }

        let mut doomed = Vec::new();
        {
            let mut sessions = self.sessions.lock();
            sessions.retain(|id, slot| {
                let expired = slot.refs.load(Ordering::SeqCst) == 0
                    && !slot.session.has_readers()
                    && slot.session.last_activity().elapsed() >= idle;
                if expired {
                    doomed.push((id.clone(), Arc::clone(&slot.session)));
                }
                !expired
            });
        }

        for (id, session) in doomed {
            log::info!("[SessionManager] reaping idle session {id}");
            session.shutdown();
        }
    }

    /// Tears down every session. Used on coordinator shutdown.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut map = self.sessions.lock();
            map.drain().map(|(_, slot)| slot.session).collect()
        };
        for session in sessions {
            session.shutdown();
        }
    }
}

/// Refcounted handle on a session. Dropping releases the reference;
/// the reaper collects sessions once unreferenced past the idle window.
pub struct SessionHandle {
    session: Arc<Session>,
    refs: Arc<AtomicUsize>,
}

impl SessionHandle {
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
        self.session.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::variant::Variant;
    use crate::transcode::TranscodeSpec;
    use std::collections::HashMap as StdHashMap;

    struct MapResolver(StdHashMap<String, String>);

    impl OriginResolver for MapResolver {
        fn origin_url(&self, channel_id: &str) -> Option<String> {
            self.0.get(channel_id).cloned()
        }
    }

    struct NullBackend;

    impl TranscodeBackend for NullBackend {
        fn submit(
            &self,
            _spec: TranscodeSpec,
            _source: Arc<Variant>,
            _target: Arc<Variant>,
        ) -> Result<String, RelayError> {
            Ok("job".to_string())
        }
        fn cancel(&self, _job_id: &str) {}
    }

    fn manager_with(channels: &[(&str, &str)]) -> Arc<SessionManager> {
        let map: StdHashMap<String, String> = channels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SessionManager::new(
            RelayConfig::default(),
            Arc::new(MapResolver(map)),
            Arc::new(NullBackend),
        )
    }

    #[tokio::test]
    async fn acquire_is_idempotent_per_channel() {
        let manager = manager_with(&[("ch1", "http://127.0.0.1:9/a")]);
        let h1 = manager.acquire("ch1").expect("first");
        let h2 = manager.acquire("ch1").expect("second");
        assert!(Arc::ptr_eq(h1.session(), h2.session()));
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test]
    async fn unknown_channel_is_rejected() {
        let manager = manager_with(&[]);
        assert!(manager.acquire("nope").is_err());
    }

    #[tokio::test]
    async fn reap_skips_referenced_sessions() {
        let manager = manager_with(&[("ch1", "http://127.0.0.1:9/a")]);
        let handle = manager.acquire("ch1").expect("acquire");
        manager.reap();
        assert_eq!(manager.session_count(), 1);
        drop(handle);
    }

    #[tokio::test]
    async fn reap_collects_idle_unreferenced_sessions() {
        let mut config = RelayConfig::default();
        config.session_idle_secs = 0;
        let map: StdHashMap<String, String> =
            [("ch1".to_string(), "http://127.0.0.1:9/a".to_string())].into();
        let manager = SessionManager::new(
            config,
            Arc::new(MapResolver(map)),
            Arc::new(NullBackend),
        );
        let handle = manager.acquire("ch1").expect("acquire");
        drop(handle);
        manager.reap();
        assert_eq!(manager.session_count(), 0);
    }
}
