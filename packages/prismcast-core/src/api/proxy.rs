//! Proxy endpoints: generation trigger and published artifacts.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;

use crate::error::{PrismError, PrismResult};

use super::AppState;

/// `POST /proxies/{id}/generate` - starts a generation run and returns
/// its record; the run continues in the background.
pub async fn generate(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> PrismResult<(StatusCode, Json<serde_json::Value>)> {
    let proxy = state
        .proxies
        .proxy(&id)
        .ok_or_else(|| PrismError::ProxyNotFound(id.clone()))?;

    let pipeline = Arc::clone(&state.pipeline);
    let cancel = state.shutdown.child_token();
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (run, _result) = pipeline.generate(&proxy, cancel).await;
        // The caller only needs the record; failures live on the run.
        let _ = tx.send(run.to_json());
    });

    // Wait briefly so fast runs return their final state; long runs
    // return 202 and are polled via the run record.
    match tokio::time::timeout(std::time::Duration::from_millis(200), rx).await {
        Ok(Ok(run)) => Ok((StatusCode::OK, Json(run))),
        _ => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "proxyId": id, "status": "running" })),
        )),
    }
}

/// `GET /proxy/{id}/playlist.m3u8` - the published playlist.
pub async fn playlist(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> PrismResult<Response> {
    serve_artifact(&state, &id, true).await
}

/// `GET /proxy/{id}/epg.xml` - the published guide.
pub async fn guide(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> PrismResult<Response> {
    serve_artifact(&state, &id, false).await
}

async fn serve_artifact(state: &AppState, proxy_id: &str, playlist: bool) -> PrismResult<Response> {
    if state.proxies.proxy(proxy_id).is_none() {
        return Err(PrismError::ProxyNotFound(proxy_id.to_string()));
    }
    let paths = state.pipeline.artifact_paths(proxy_id);
    let (path, content_type) = if playlist {
        (paths.playlist, "application/vnd.apple.mpegurl")
    } else {
        (paths.guide, "application/xml")
    };
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| PrismError::ProxyNotFound(format!("{proxy_id} has no published artifacts")))?;
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(bytes))
        .map_err(|e| PrismError::Internal(e.to_string()))
}
