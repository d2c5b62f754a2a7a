//! Best-effort audio metadata for uploads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::runner::{ToolInvocation, ToolRunner};
use crate::config::MediaConfig;

/// Title, artist and duration attached to an audio upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration: Option<Duration>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
}

fn tag(tags: &HashMap<String, String>, name: &str) -> Option<String> {
    tags.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parses `ffprobe -show_format` JSON. Anything unreadable becomes `None`.
pub fn parse_metadata(json: &[u8]) -> AudioMetadata {
    let Ok(output) = serde_json::from_slice::<FfprobeOutput>(json) else {
        return AudioMetadata::default();
    };
    let Some(format) = output.format else {
        return AudioMetadata::default();
    };

    let duration = format
        .duration
        .as_deref()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .map(Duration::from_secs_f64);

    AudioMetadata {
        title: tag(&format.tags, "title"),
        artist: tag(&format.tags, "artist"),
        duration,
    }
}

/// Reads metadata from extracted artifacts.
#[derive(Clone)]
pub struct MetadataReader {
    runner: Arc<dyn ToolRunner>,
    ffprobe: PathBuf,
    timeout: Duration,
}

impl MetadataReader {
    pub fn new(runner: Arc<dyn ToolRunner>, config: &MediaConfig) -> Self {
        Self {
            runner,
            ffprobe: config.ffprobe_path.clone(),
            timeout: config.probe_timeout,
        }
    }

    /// Reads metadata from `path`. Failures are logged and yield empty
    /// metadata; an upload never fails for lack of tags.
    pub async fn read(&self, path: &Path) -> AudioMetadata {
        let invocation = ToolInvocation::new(&self.ffprobe, self.timeout)
            .args([
                "-hide_banner",
                "-v",
                "error",
                "-show_format",
                "-print_format",
                "json",
            ])
            .arg(path);

        match self.runner.run(&invocation).await {
            Ok(output) if output.success() => parse_metadata(&output.stdout),
            Ok(output) => {
                tracing::debug!(
                    "No metadata for {}: exit {:?}",
                    path.display(),
                    output.status
                );
                AudioMetadata::default()
            }
            Err(e) => {
                tracing::debug!("No metadata for {}: {}", path.display(), e);
                AudioMetadata::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags_and_duration() {
        let json = br#"{"format":{"duration":"215.480000","tags":{"TITLE":"Overture","artist":"Orchestra"}}}"#;
        let metadata = parse_metadata(json);

        assert_eq!(metadata.title.as_deref(), Some("Overture"));
        assert_eq!(metadata.artist.as_deref(), Some("Orchestra"));
        assert_eq!(metadata.duration.map(|d| d.as_secs()), Some(215));
    }

    #[test]
    fn test_missing_metadata_is_not_an_error() {
        assert_eq!(parse_metadata(b"{}"), AudioMetadata::default());
        assert_eq!(parse_metadata(b"garbage"), AudioMetadata::default());
        assert_eq!(
            parse_metadata(br#"{"format":{"duration":"N/A"}}"#),
            AudioMetadata::default()
        );
    }
}
