//! Worker configuration and capability declaration.
//!
//! Capabilities live in a YAML file so adding an encoder is a worker-side
//! configuration change, never a coordinator change. Declared values must
//! stay stable until the daemon reconnects.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use prismcast_core::transcode::{GpuCapability, WorkerCapabilities};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CapabilityFile {
    /// Video codec tags this worker encodes ("h264", "hevc", ...).
    pub video_encoders: Vec<String>,
    /// Video codec tags this worker decodes.
    pub video_decoders: Vec<String>,
    /// Audio codec tags this worker encodes.
    pub audio_encoders: Vec<String>,
    /// Audio codec tags this worker decodes.
    pub audio_decoders: Vec<String>,
    /// Hardware accelerators available ("cuda", "vaapi", ...).
    pub hw_accels: Vec<String>,
    /// GPUs with their concurrent encode session ceilings.
    pub gpus: Vec<GpuEntry>,
    /// Maximum concurrent transcode jobs.
    pub max_concurrent_jobs: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpuEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub max_encode_sessions: u32,
}

impl Default for CapabilityFile {
    fn default() -> Self {
        Self {
            video_encoders: vec!["h264".to_string(), "hevc".to_string()],
            video_decoders: vec!["h264".to_string(), "hevc".to_string()],
            audio_encoders: vec!["aac".to_string(), "mp3".to_string()],
            audio_decoders: vec!["aac".to_string(), "mp3".to_string(), "ac3".to_string()],
            hw_accels: Vec::new(),
            gpus: Vec::new(),
            max_concurrent_jobs: 2,
        }
    }
}

impl CapabilityFile {
    /// Loads the capability declaration, falling back to software
    /// defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read capability file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse capability file: {}", path.display()))
    }

    #[must_use]
    pub fn to_capabilities(&self) -> WorkerCapabilities {
        WorkerCapabilities {
            video_encoders: self.video_encoders.clone(),
            video_decoders: self.video_decoders.clone(),
            audio_encoders: self.audio_encoders.clone(),
            audio_decoders: self.audio_decoders.clone(),
            hw_accels: self.hw_accels.clone(),
            gpus: self
                .gpus
                .iter()
                .map(|gpu| GpuCapability {
                    id: gpu.id.clone(),
                    name: gpu.name.clone(),
                    max_encode_sessions: gpu.max_encode_sessions,
                })
                .collect(),
            max_concurrent_jobs: self.max_concurrent_jobs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_software_only() {
        let caps = CapabilityFile::default().to_capabilities();
        assert!(caps.hw_accels.is_empty());
        assert!(caps.video_encoders.contains(&"h264".to_string()));
        assert_eq!(caps.max_concurrent_jobs, 2);
    }

    #[test]
    fn file_parses_gpus() {
        let dir = tempfile_dir();
        let path = dir.join("caps.yaml");
        std::fs::write(
            &path,
            r#"
video_encoders: [hevc]
hw_accels: [cuda]
gpus:
  - id: gpu0
    name: RTX 4000
    max_encode_sessions: 3
max_concurrent_jobs: 6
"#,
        )
        .expect("write");
        let caps = CapabilityFile::load(Some(&path)).expect("load").to_capabilities();
        assert_eq!(caps.gpus.len(), 1);
        assert_eq!(caps.gpus[0].max_encode_sessions, 3);
        assert_eq!(caps.max_concurrent_jobs, 6);
        let _ = std::fs::remove_dir_all(dir);
    }

    fn tempfile_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("prismcast-caps-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }
}
