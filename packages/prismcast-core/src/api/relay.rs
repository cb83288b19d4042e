//! Relay endpoints: manifests, segments, and continuous streams.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::Response;
use futures::StreamExt;
use serde::Deserialize;

use crate::error::{PrismError, PrismResult};
use crate::packagers::{continuous_ts, dash, fmp4, hls, mpegts, Segmenter};
use crate::relay::{MediaType, Session, VariantKey, VariantRequest};

use super::AppState;

/// Variant selection and transcode hints, all optional: absent codecs
/// mean origin passthrough.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamQuery {
    pub format: Option<String>,
    pub video: Option<String>,
    pub audio: Option<String>,
    pub accel: Option<String>,
    pub video_bitrate: Option<u32>,
    pub audio_bitrate: Option<u32>,
}

impl StreamQuery {
    /// Rebuilds the query-string suffix that keeps a non-default variant
    /// addressable from playlist segment URIs.
    fn uri_suffix(&self) -> String {
        let mut parts = Vec::new();
        if let Some(video) = &self.video {
            parts.push(format!("video={video}"));
        }
        if let Some(audio) = &self.audio {
            parts.push(format!("audio={audio}"));
        }
        if let Some(accel) = &self.accel {
            parts.push(format!("accel={accel}"));
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!("?{}", parts.join("&"))
        }
    }
}

/// Resolves the requested variant, scheduling a transcode when needed,
/// and returns a reader plus the resolved key.
async fn resolve_variant(
    state: &AppState,
    session: &Arc<Session>,
    query: &StreamQuery,
) -> PrismResult<(crate::relay::VariantReader, VariantKey)> {
    match (&query.video, &query.audio) {
        (None, None) => {
            let reader = session.source_reader().await?;
            let key = session
                .source_codecs()
                .ok_or_else(|| PrismError::UpstreamUnavailable("no program data".to_string()))?;
            Ok((reader, key))
        }
        (video, audio) => {
            // Wait for the origin's program data; partially specified
            // requests default the missing codec to the source's.
            let source_reader = session.source_reader().await?;
            drop(source_reader);
            let source = session
                .source_codecs()
                .ok_or_else(|| PrismError::UpstreamUnavailable("no program data".to_string()))?;
            let key = VariantKey::new(
                video.as_deref().unwrap_or(source.video.as_str()),
                audio.as_deref().unwrap_or(source.audio.as_str()),
            );
            let request = VariantRequest {
                key: key.clone(),
                hw_accel: query.accel.clone(),
                video_bitrate: query.video_bitrate,
                audio_bitrate: query.audio_bitrate,
            };
            let reader = session.ensure_variant(request).await?;
            Ok((reader, key))
        }
    }
}

/// Segmenter for a (channel, variant) pair, rebuilt if the variant was
/// recreated, with the media-sequence floor carried over.
fn segmenter_for(
    state: &AppState,
    session: &Arc<Session>,
    key: &VariantKey,
) -> PrismResult<Arc<Segmenter>> {
    let variant = session
        .get_variant(key)
        .ok_or_else(|| PrismError::ChannelNotFound(session.channel_id().to_string()))?;
    if variant.is_errored() {
        return Err(PrismError::VariantErrored(key.to_string()));
    }

    let map_key = (session.channel_id().to_string(), key.clone());
    if let Some(existing) = state.segmenters.get(&map_key) {
        if Arc::ptr_eq(existing.variant(), &variant) {
            return Ok(Arc::clone(existing.value()));
        }
    }

    let segmenter = Arc::new(Segmenter::new(
        variant,
        state.config.relay.segment_target_secs,
        state.config.relay.playlist_window,
        session.sequence_floor(key),
    ));
    state.segmenters.insert(map_key, Arc::clone(&segmenter));
    Ok(segmenter)
}

fn advance_and_record(session: &Arc<Session>, key: &VariantKey, segmenter: &Segmenter) {
    segmenter.advance();
    session.record_sequence_floor(key, segmenter.next_index());
}

/// `GET /relay/channel/{id}/stream?format=...` - manifest or continuous
/// stream in the requested format.
pub async fn stream(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> PrismResult<Response> {
    let format = query.format.clone().unwrap_or_else(|| "hls-ts".to_string());
    match format.as_str() {
        "ts" => continuous(state, id, query).await,
        "hls-ts" => manifest_hls_ts(state, id, query).await,
        "hls-fmp4" => manifest_hls_fmp4(state, id, query).await,
        "dash" => manifest_dash(state, id, query).await,
        other => Err(PrismError::InvalidRequest(format!(
            "unknown format {other}"
        ))),
    }
}

/// `GET /relay/channel/{id}/{artifact}` - named manifests, the init
/// segment, and `segment_{n}.{ts|m4s}`.
pub async fn artifact(
    Path((id, artifact)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> PrismResult<Response> {
    match artifact.as_str() {
        "manifest.m3u8" => manifest_hls_ts(state, id, query).await,
        "manifest-fmp4.m3u8" => manifest_hls_fmp4(state, id, query).await,
        "dash.mpd" => manifest_dash(state, id, query).await,
        "init.mp4" => init_segment(state, id, query).await,
        name => {
            let (index, extension) = parse_segment_name(name)?;
            segment(state, id, query, index, extension).await
        }
    }
}

fn parse_segment_name(name: &str) -> PrismResult<(u64, &str)> {
    let rest = name
        .strip_prefix("segment_")
        .ok_or_else(|| PrismError::InvalidRequest(format!("unknown artifact {name}")))?;
    let (index, extension) = rest
        .split_once('.')
        .ok_or_else(|| PrismError::InvalidRequest(format!("malformed segment name {name}")))?;
    let index: u64 = index
        .parse()
        .map_err(|_| PrismError::InvalidRequest(format!("malformed segment index in {name}")))?;
    match extension {
        "ts" | "m4s" => Ok((index, extension)),
        other => Err(PrismError::InvalidRequest(format!(
            "unknown segment extension {other}"
        ))),
    }
}

async fn manifest_hls_ts(
    state: Arc<AppState>,
    id: String,
    query: StreamQuery,
) -> PrismResult<Response> {
    let handle = state.sessions.acquire(&id)?;
    let session = handle.session();
    let (reader, key) = resolve_variant(&state, session, &query).await?;
    let segmenter = segmenter_for(&state, session, &key)?;
    advance_and_record(session, &key, &segmenter);
    let records = segmenter.window(state.config.relay.playlist_window);
    let playlist = hls::media_playlist_ts(
        &records,
        state.config.relay.segment_target_secs,
        &query.uri_suffix(),
        segmenter.finished(),
    );
    drop(reader);
    respond_text(playlist, "application/vnd.apple.mpegurl")
}

async fn manifest_hls_fmp4(
    state: Arc<AppState>,
    id: String,
    query: StreamQuery,
) -> PrismResult<Response> {
    let handle = state.sessions.acquire(&id)?;
    let session = handle.session();
    let (reader, key) = resolve_variant(&state, session, &query).await?;
    let segmenter = segmenter_for(&state, session, &key)?;
    advance_and_record(session, &key, &segmenter);
    let records = segmenter.window(state.config.relay.playlist_window);
    let playlist = hls::media_playlist_fmp4(
        &records,
        state.config.relay.segment_target_secs,
        "init.mp4",
        &query.uri_suffix(),
        segmenter.finished(),
    );
    drop(reader);
    respond_text(playlist, "application/vnd.apple.mpegurl")
}

async fn manifest_dash(
    state: Arc<AppState>,
    id: String,
    query: StreamQuery,
) -> PrismResult<Response> {
    let handle = state.sessions.acquire(&id)?;
    let session = handle.session();
    let (reader, key) = resolve_variant(&state, session, &query).await?;
    let segmenter = segmenter_for(&state, session, &key)?;
    advance_and_record(session, &key, &segmenter);
    let records = segmenter.window(state.config.relay.playlist_window);
    let mpd = dash::mpd(
        &records,
        state.config.relay.segment_target_secs,
        &key.video,
        &key.audio,
    );
    drop(reader);
    respond_text(mpd, "application/dash+xml")
}

async fn init_segment(
    state: Arc<AppState>,
    id: String,
    query: StreamQuery,
) -> PrismResult<Response> {
    let handle = state.sessions.acquire(&id)?;
    let session = handle.session();
    let (reader, key) = resolve_variant(&state, session, &query).await?;
    let variant = reader.variant();
    let init = fmp4::init_segment(
        variant.init_data().get(MediaType::Video).as_ref(),
        variant.init_data().get(MediaType::Audio).as_ref(),
        &key.video,
    );
    respond_bytes(init, "video/mp4")
}

async fn segment(
    state: Arc<AppState>,
    id: String,
    query: StreamQuery,
    index: u64,
    extension: &str,
) -> PrismResult<Response> {
    let handle = state.sessions.acquire(&id)?;
    let session = handle.session();
    let (reader, key) = resolve_variant(&state, session, &query).await?;
    let segmenter = segmenter_for(&state, session, &key)?;
    advance_and_record(session, &key, &segmenter);

    let record = segmenter
        .record(index)
        .ok_or(PrismError::SegmentNotFound(index))?;
    let (video, audio) = segmenter.samples(&record);
    let bytes = match extension {
        "ts" => mpegts::mux_segment(&video, &audio, &key.video, &key.audio),
        _ => fmp4::media_fragment(
            // Fragment sequence tracks the media sequence for players.
            (record.index + 1) as u32,
            &video,
            &audio,
            key.video.as_str() == "hevc",
        ),
    };
    drop(reader);
    let content_type = if extension == "ts" {
        "video/mp2t"
    } else {
        "video/iso.segment"
    };
    respond_bytes(bytes, content_type)
}

async fn continuous(
    state: Arc<AppState>,
    id: String,
    query: StreamQuery,
) -> PrismResult<Response> {
    let handle = state.sessions.acquire(&id)?;
    let session = Arc::clone(handle.session());
    let (reader, key) = resolve_variant(&state, &session, &query).await?;

    let client_idle = Duration::from_secs(state.config.relay.client_read_idle_secs);
    let stream = continuous_ts(reader, key.video.clone(), key.audio.clone(), client_idle);
    // The handle rides inside the stream so the session stays referenced
    // for the client's lifetime.
    let stream = stream.map(move |item| {
        let _keep_alive = (&handle, &session);
        item
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "video/mp2t")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|e| PrismError::Internal(e.to_string()))
}

fn respond_text(body: String, content_type: &str) -> PrismResult<Response> {
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(body))
        .map_err(|e| PrismError::Internal(e.to_string()))
}

fn respond_bytes(body: bytes::Bytes, content_type: &str) -> PrismResult<Response> {
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(body))
        .map_err(|e| PrismError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_names_parse() {
        assert_eq!(parse_segment_name("segment_12.ts").unwrap(), (12, "ts"));
        assert_eq!(parse_segment_name("segment_0.m4s").unwrap(), (0, "m4s"));
        assert!(parse_segment_name("segment_x.ts").is_err());
        assert!(parse_segment_name("other.ts").is_err());
        assert!(parse_segment_name("segment_1.mp4").is_err());
    }

    #[test]
    fn uri_suffix_round_trips_variant_selection() {
        let query = StreamQuery {
            video: Some("hevc".into()),
            audio: Some("aac".into()),
            ..Default::default()
        };
        assert_eq!(query.uri_suffix(), "?video=hevc&audio=aac");
        assert_eq!(StreamQuery::default().uri_suffix(), "");
    }
}
