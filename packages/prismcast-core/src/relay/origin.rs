//! Origin ingress: dials the upstream channel, demuxes the transport
//! stream, and feeds elementary samples into the session's source variant.
//!
//! The connection is established at most once at a time; transient failures
//! reconnect with exponential backoff bounded by the session idle window.
//! Cancellation closes the variant and exits the task.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::demux::{DemuxEvent, TsDemuxer};
use super::sample::MediaType;
use super::variant::{Variant, VariantKey};

/// Tunables for one origin connection.
#[derive(Debug, Clone)]
pub struct OriginConfig {
    pub url: String,
    pub dial_timeout: Duration,
    pub read_idle: Duration,
    /// Backoff ceiling; also the give-up horizon for a dead upstream.
    pub max_backoff: Duration,
}

/// Spawns the origin reader task for a session's source variant.
///
/// `codecs_tx` publishes the codec pair detected from the PMT so the
/// session can answer passthrough questions before serving readers.
pub fn spawn_origin(
    client: reqwest::Client,
    config: OriginConfig,
    variant: Arc<Variant>,
    codecs_tx: watch::Sender<Option<VariantKey>>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run_origin(client, config, variant, codecs_tx, cancel).await;
    })
}

async fn run_origin(
    client: reqwest::Client,
    config: OriginConfig,
    variant: Arc<Variant>,
    codecs_tx: watch::Sender<Option<VariantKey>>,
    cancel: CancellationToken,
) {
    let mut backoff = Duration::from_millis(500);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match connect_and_pump(&client, &config, &variant, &codecs_tx, &cancel).await {
            PumpEnd::Cancelled => break,
            PumpEnd::Error(reason) => {
                log::warn!(
                    "[Origin] {} failed ({}), reconnecting in {:?}",
                    config.url,
                    reason,
                    backoff
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(config.max_backoff);
            }
            PumpEnd::Eof => {
                // A healthy read resets the backoff before EOF handling,
                // so a flapping upstream still backs off.
                log::info!("[Origin] {} reached end of stream, reconnecting", config.url);
                backoff = Duration::from_millis(500);
            }
        }
    }

    variant.close();
    log::debug!("[Origin] reader for {} exited", config.url);
}

enum PumpEnd {
    Cancelled,
    Eof,
    Error(String),
}

async fn connect_and_pump(
    client: &reqwest::Client,
    config: &OriginConfig,
    variant: &Arc<Variant>,
    codecs_tx: &watch::Sender<Option<VariantKey>>,
    cancel: &CancellationToken,
) -> PumpEnd {
    let dial = client.get(&config.url).send();
    let response = tokio::select! {
        _ = cancel.cancelled() => return PumpEnd::Cancelled,
        result = tokio::time::timeout(config.dial_timeout, dial) => match result {
            Err(_) => return PumpEnd::Error("dial timeout".to_string()),
            Ok(Err(e)) => return PumpEnd::Error(e.to_string()),
            Ok(Ok(resp)) => match resp.error_for_status() {
                Err(e) => return PumpEnd::Error(e.to_string()),
                Ok(resp) => resp,
            },
        },
    };

    log::info!("[Origin] connected to {}", config.url);

    let mut stream = response.bytes_stream();
    let mut demux = TsDemuxer::new();
    let mut events = Vec::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return PumpEnd::Cancelled,
            chunk = tokio::time::timeout(config.read_idle, stream.next()) => chunk,
        };

        let chunk = match chunk {
            Err(_) => return PumpEnd::Error("read idle timeout".to_string()),
            Ok(None) => {
                demux.flush(&mut events);
                deliver(&mut events, variant, codecs_tx);
                return PumpEnd::Eof;
            }
            Ok(Some(Err(e))) => return PumpEnd::Error(e.to_string()),
            Ok(Some(Ok(chunk))) => chunk,
        };

        if let Err(e) = demux.push(&chunk, &mut events) {
            return PumpEnd::Error(e.to_string());
        }
        deliver(&mut events, variant, codecs_tx);
    }
}

fn deliver(
    events: &mut Vec<DemuxEvent>,
    variant: &Arc<Variant>,
    codecs_tx: &watch::Sender<Option<VariantKey>>,
) {
    for event in events.drain(..) {
        match event {
            DemuxEvent::Codecs { video, audio } => {
                let key = VariantKey { video, audio };
                log::info!("[Origin] detected source codecs {}", key);
                let _ = codecs_tx.send(Some(key));
            }
            DemuxEvent::VideoInit(data) => variant.init_data().set(MediaType::Video, data),
            DemuxEvent::AudioInit(data) => variant.init_data().set(MediaType::Audio, data),
            DemuxEvent::Video(input) => {
                variant.push(MediaType::Video, input);
            }
            DemuxEvent::Audio(input) => {
                variant.push(MediaType::Audio, input);
            }
        }
    }
}
