//! HTTP surface of the coordinator.
//!
//! Relay endpoints serve live manifests, segments and continuous streams;
//! proxy endpoints trigger generations and serve published artifacts.

pub mod relay;
pub mod proxy;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::packagers::Segmenter;
use crate::pipeline::{GenerationPipeline, Proxy};
use crate::relay::{SessionManager, VariantKey};
use crate::state::Config;

/// Resolves proxy ids to their definitions. Persistent proxy storage is
/// outside the core.
pub trait ProxyStore: Send + Sync {
    fn proxy(&self, proxy_id: &str) -> Option<Proxy>;
}

/// Shared state behind the router.
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub pipeline: Arc<GenerationPipeline>,
    pub proxies: Arc<dyn ProxyStore>,
    pub config: Config,
    /// Segment indices per (channel, variant); rebuilt when the variant is
    /// recreated, seeded so media sequences keep increasing.
    pub(crate) segmenters: DashMap<(String, VariantKey), Arc<Segmenter>>,
    pub shutdown: CancellationToken,
}

impl AppState {
    #[must_use]
    pub fn new(
        sessions: Arc<SessionManager>,
        pipeline: Arc<GenerationPipeline>,
        proxies: Arc<dyn ProxyStore>,
        config: Config,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            pipeline,
            proxies,
            config,
            segmenters: DashMap::new(),
            shutdown,
        })
    }
}

/// Builds the router over the shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/relay/channel/{id}/stream", get(relay::stream))
        .route("/relay/channel/{id}/{artifact}", get(relay::artifact))
        .route("/proxies/{id}/generate", post(proxy::generate))
        .route("/proxy/{id}/playlist.m3u8", get(proxy::playlist))
        .route("/proxy/{id}/epg.xml", get(proxy::guide))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds and serves the HTTP API until cancelled.
pub async fn start_server(
    state: Arc<AppState>,
    listener: tokio::net::TcpListener,
) -> Result<(), std::io::Error> {
    let shutdown = state.shutdown.clone();
    let app = router(state);
    log::info!(
        "[Http] listening on {}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
