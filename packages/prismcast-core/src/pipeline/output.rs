//! Artifact emission and atomic publish.
//!
//! The playlist (M3U8) and guide (XMLTV) are streamed to temporary files
//! and published with atomic renames: either both artifacts replace their
//! predecessors, or the prior generation stays authoritative.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tokio::io::AsyncWriteExt;

use super::model::{Channel, Programme};
use super::StageError;

/// XMLTV timestamp layout.
const XMLTV_TIME: &str = "%Y%m%d%H%M%S %z";

fn io_err(e: impl std::fmt::Display) -> StageError {
    StageError::Io(e.to_string())
}

/// Streaming playlist writer.
pub struct PlaylistWriter {
    file: tokio::fs::File,
}

impl PlaylistWriter {
    pub async fn create(path: &Path) -> Result<Self, StageError> {
        let mut file = tokio::fs::File::create(path).await.map_err(io_err)?;
        file.write_all(b"#EXTM3U\n").await.map_err(io_err)?;
        Ok(Self { file })
    }

    /// Appends one channel entry with its tvg attributes.
    pub async fn write_channel(&mut self, channel: &Channel) -> Result<(), StageError> {
        let mut line = String::with_capacity(160);
        line.push_str("#EXTINF:-1");
        push_attr(&mut line, "tvg-id", &channel.tvg_id);
        push_attr(&mut line, "tvg-name", &channel.tvg_name);
        if let Some(logo) = &channel.logo_url {
            push_attr(&mut line, "tvg-logo", logo);
        }
        if let Some(group) = &channel.group {
            push_attr(&mut line, "group-title", group);
        }
        if let Some(number) = channel.number {
            push_attr(&mut line, "tvg-chno", &number.to_string());
        }
        line.push(',');
        line.push_str(&channel.name);
        line.push('\n');
        line.push_str(&channel.stream_url);
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .await
            .map_err(io_err)
    }

    pub async fn finish(mut self) -> Result<(), StageError> {
        self.file.flush().await.map_err(io_err)?;
        self.file.sync_all().await.map_err(io_err)
    }
}

fn push_attr(line: &mut String, key: &str, value: &str) {
    // Quotes inside attribute values would corrupt the line.
    let clean = value.replace('"', "'");
    line.push(' ');
    line.push_str(key);
    line.push_str("=\"");
    line.push_str(&clean);
    line.push('"');
}

/// Streaming XMLTV writer. Channels are written up front; programme
/// batches follow, so the full programme set is never held in memory.
pub struct GuideWriter {
    file: tokio::fs::File,
}

impl GuideWriter {
    pub async fn create(path: &Path, channels: &[Channel]) -> Result<Self, StageError> {
        let mut header = Writer::new(Vec::new());
        let _ = header.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)));
        let mut tv = BytesStart::new("tv");
        tv.push_attribute(("generator-info-name", "prismcast"));
        let _ = header.write_event(Event::Start(tv));

        for channel in channels {
            let mut elem = BytesStart::new("channel");
            elem.push_attribute(("id", channel.tvg_id.as_str()));
            let _ = header.write_event(Event::Start(elem));
            let _ = header.write_event(Event::Start(BytesStart::new("display-name")));
            let _ = header.write_event(Event::Text(BytesText::new(&channel.name)));
            let _ = header.write_event(Event::End(BytesEnd::new("display-name")));
            if let Some(logo) = &channel.logo_url {
                let mut icon = BytesStart::new("icon");
                icon.push_attribute(("src", logo.as_str()));
                let _ = header.write_event(Event::Empty(icon));
            }
            let _ = header.write_event(Event::End(BytesEnd::new("channel")));
        }

        let mut file = tokio::fs::File::create(path).await.map_err(io_err)?;
        file.write_all(&header.into_inner()).await.map_err(io_err)?;
        Ok(Self { file })
    }

    /// Appends one batch of programmes.
    pub async fn write_batch(&mut self, programmes: &[Programme]) -> Result<(), StageError> {
        let mut writer = Writer::new(Vec::new());
        for programme in programmes {
            let mut elem = BytesStart::new("programme");
            elem.push_attribute(("start", xmltv_time(&programme.start).as_str()));
            elem.push_attribute(("stop", xmltv_time(&programme.stop).as_str()));
            elem.push_attribute(("channel", programme.channel_tvg_id.as_str()));
            let _ = writer.write_event(Event::Start(elem));

            let _ = writer.write_event(Event::Start(BytesStart::new("title")));
            let _ = writer.write_event(Event::Text(BytesText::new(&programme.title)));
            let _ = writer.write_event(Event::End(BytesEnd::new("title")));

            if let Some(subtitle) = &programme.subtitle {
                let _ = writer.write_event(Event::Start(BytesStart::new("sub-title")));
                let _ = writer.write_event(Event::Text(BytesText::new(subtitle)));
                let _ = writer.write_event(Event::End(BytesEnd::new("sub-title")));
            }
            if let Some(description) = &programme.description {
                let _ = writer.write_event(Event::Start(BytesStart::new("desc")));
                let _ = writer.write_event(Event::Text(BytesText::new(description)));
                let _ = writer.write_event(Event::End(BytesEnd::new("desc")));
            }
            if let Some(category) = &programme.category {
                let _ = writer.write_event(Event::Start(BytesStart::new("category")));
                let _ = writer.write_event(Event::Text(BytesText::new(category)));
                let _ = writer.write_event(Event::End(BytesEnd::new("category")));
            }
            let _ = writer.write_event(Event::End(BytesEnd::new("programme")));
        }
        self.file
            .write_all(&writer.into_inner())
            .await
            .map_err(io_err)
    }

    pub async fn finish(mut self) -> Result<(), StageError> {
        let mut writer = Writer::new(Vec::new());
        let _ = writer.write_event(Event::End(BytesEnd::new("tv")));
        self.file
            .write_all(&writer.into_inner())
            .await
            .map_err(io_err)?;
        self.file.flush().await.map_err(io_err)?;
        self.file.sync_all().await.map_err(io_err)
    }
}

fn xmltv_time(time: &DateTime<Utc>) -> String {
    time.format(XMLTV_TIME).to_string()
}

/// Published artifact paths for a proxy.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub playlist: PathBuf,
    pub guide: PathBuf,
}

impl ArtifactPaths {
    #[must_use]
    pub fn for_proxy(output_dir: &Path, proxy_id: &str) -> Self {
        let base = output_dir.join(proxy_id);
        Self {
            playlist: base.join("playlist.m3u8"),
            guide: base.join("epg.xml"),
        }
    }

    #[must_use]
    pub fn temp(&self) -> Self {
        Self {
            playlist: self.playlist.with_extension("m3u8.tmp"),
            guide: self.guide.with_extension("xml.tmp"),
        }
    }
}

/// Atomically replaces both published artifacts with the temp files.
///
/// If the second rename fails after the first succeeded, the first is
/// rolled back from a backup so the prior generation stays complete.
pub async fn publish(paths: &ArtifactPaths) -> Result<(), StageError> {
    let temp = paths.temp();
    let backup = paths.playlist.with_extension("m3u8.bak");

    let had_playlist = tokio::fs::metadata(&paths.playlist).await.is_ok();
    if had_playlist {
        tokio::fs::copy(&paths.playlist, &backup)
            .await
            .map_err(|e| StageError::Publish(format!("backup failed: {e}")))?;
    }

    tokio::fs::rename(&temp.playlist, &paths.playlist)
        .await
        .map_err(|e| StageError::Publish(format!("playlist rename failed: {e}")))?;

    if let Err(e) = tokio::fs::rename(&temp.guide, &paths.guide).await {
        // Roll the playlist back; the prior pair stays authoritative.
        if had_playlist {
            if let Err(restore) = tokio::fs::rename(&backup, &paths.playlist).await {
                log::error!("[Publish] rollback failed: {restore}");
            }
        } else {
            let _ = tokio::fs::remove_file(&paths.playlist).await;
        }
        return Err(StageError::Publish(format!("guide rename failed: {e}")));
    }

    let _ = tokio::fs::remove_file(&backup).await;
    Ok(())
}
